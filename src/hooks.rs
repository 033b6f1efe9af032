//! Hook signatures supplied by stream implementors
//!
//! Every hook completes through a [`Callback`], which may be called
//! synchronously or from a later task. Being `FnOnce`, a callback can only
//! complete its request once.

use std::rc::Rc;

use crate::chunk::{Chunk, Encoding};
use crate::error::{Callback, StreamError};
use crate::sink::SinkStream;
use crate::source::SourceStream;
use crate::transform::Emit;

/// Deliver one chunk to the underlying resource
pub type WriteFn = Rc<dyn Fn(&SinkStream, Chunk, Encoding, Callback)>;

/// Deliver several buffered chunks at once
pub type WritevFn = Rc<dyn Fn(&SinkStream, Vec<(Chunk, Encoding)>, Callback)>;

/// Flush the underlying resource before `finish`
pub type FinalFn = Rc<dyn Fn(&SinkStream, Callback)>;

/// Produce data by calling `push` with up to `size` units
pub type ReadFn = Rc<dyn Fn(&SourceStream, usize)>;

/// Asynchronous setup run before the first write or read
pub type ConstructFn<S> = Rc<dyn Fn(&S, Callback)>;

/// Release the underlying resource; may replace the error
pub type DestroyFn<S> = Rc<dyn Fn(&S, Option<StreamError>, Callback)>;

/// Turn one written chunk into zero or more output chunks
pub type TransformFn = Rc<dyn Fn(Chunk, Encoding, Emit)>;

/// Emit trailing output once the writable side has ended
pub type FlushFn = Rc<dyn Fn(Emit)>;

/// Tear down the other half of a duplex after this half failed
pub(crate) type PeerFn = Rc<dyn Fn(StreamError)>;
