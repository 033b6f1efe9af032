//! Stream events
//!
//! Every stream owns an [`EventRegistry`] of [`Payload`] listeners. The
//! [`Emitter`] trait exposes the `on`/`once`/`off`/`emit` surface shared by
//! sinks, sources, duplex and transform streams.
//!
//! # Events
//!
//! ```text
//! sink:    drain  prefinish  finish  pipe(Source)  unpipe(Source)
//! source:  data(Chunk)  readable  end  pause  resume
//! both:    error(StreamError)  close
//! ```

pub mod registry;

pub use registry::{EventRegistry, Listener, RemovalObserver};

use std::cell::Cell;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::source::SourceStream;

pub const DATA: &str = "data";
pub const READABLE: &str = "readable";
pub const END: &str = "end";
pub const PAUSE: &str = "pause";
pub const RESUME: &str = "resume";
pub const DRAIN: &str = "drain";
pub const PREFINISH: &str = "prefinish";
pub const FINISH: &str = "finish";
pub const PIPE: &str = "pipe";
pub const UNPIPE: &str = "unpipe";
pub const ERROR: &str = "error";
pub const CLOSE: &str = "close";

/// Argument passed to stream listeners
#[derive(Clone)]
pub enum Payload {
    /// Events without data (`drain`, `end`, `close`, ...)
    Empty,
    /// `data`
    Chunk(Chunk),
    /// `error`
    Error(StreamError),
    /// `pipe`: the source that was attached
    Source(SourceStream),
    /// `unpipe`: the source that detached, and whether a pipe already
    /// handled this notification
    Unpipe {
        source: SourceStream,
        handled: Rc<Cell<bool>>,
    },
}

impl Payload {
    /// The chunk carried by a `data` event
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            Payload::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// The error carried by an `error` event
    pub fn error(&self) -> Option<&StreamError> {
        match self {
            Payload::Error(err) => Some(err),
            _ => None,
        }
    }

    /// The source carried by `pipe` / `unpipe`
    pub fn source(&self) -> Option<&SourceStream> {
        match self {
            Payload::Source(source) | Payload::Unpipe { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Chunk(chunk) => f.debug_tuple("Chunk").field(chunk).finish(),
            Payload::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Payload::Source(_) => f.write_str("Source(..)"),
            Payload::Unpipe { handled, .. } => f
                .debug_struct("Unpipe")
                .field("handled", &handled.get())
                .finish_non_exhaustive(),
        }
    }
}

/// Wrap a closure as a stream listener
pub fn listener<F: Fn(&Payload) + 'static>(f: F) -> Listener<Payload> {
    Rc::new(f)
}

/// Listener surface shared by all stream types
pub trait Emitter {
    /// The registry backing this stream
    fn events(&self) -> &EventRegistry<Payload>;

    /// Add a listener
    fn on(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.events().add(name, listener);
        self
    }

    /// Add a listener that runs at most once
    fn once(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.events().once(name, listener);
        self
    }

    /// Remove the most recently added match for `listener`
    fn off(&self, name: &str, listener: &Listener<Payload>) -> &Self {
        self.events().remove(name, listener);
        self
    }

    /// Remove every listener for `name`, or every listener
    fn remove_all_listeners(&self, name: Option<&str>) -> &Self {
        self.events().remove_all(name);
        self
    }

    /// Emit an event synchronously
    fn emit(&self, name: &str, payload: &Payload) -> bool {
        self.events().emit(name, payload)
    }

    /// Number of listeners for `name`
    fn listener_count(&self, name: &str) -> usize {
        self.events().count(name)
    }

    /// Add a closure listener, returning its handle for `off`
    fn on_event<F>(&self, name: &str, f: F) -> Listener<Payload>
    where
        F: Fn(&Payload) + 'static,
        Self: Sized,
    {
        let handle = listener(f);
        self.on(name, handle.clone());
        handle
    }

    /// Add a `data` listener
    fn on_data<F>(&self, f: F) -> Listener<Payload>
    where
        F: Fn(&Chunk) + 'static,
        Self: Sized,
    {
        self.on_event(DATA, move |payload| {
            if let Some(chunk) = payload.chunk() {
                f(chunk);
            }
        })
    }

    /// Add an `error` listener
    fn on_error<F>(&self, f: F) -> Listener<Payload>
    where
        F: Fn(&StreamError) + 'static,
        Self: Sized,
    {
        self.on_event(ERROR, move |payload| {
            if let Some(err) = payload.error() {
                f(err);
            }
        })
    }
}
