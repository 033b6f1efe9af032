//! Flow-controlled chunk streaming
//!
//! Buffered sinks and sources with backpressure, duplex and transform
//! streams, and pipes that connect them.
//!
//! # Architecture
//!
//! ```text
//!   read hook ──push──► SourceStream ──data──► pipe ──write──► SinkStream ──► write hook
//!                        ChunkQueue     ◄──pause/resume──        VecDeque
//!                                              (drain)
//!
//!   TransformStream = SinkStream ──transform──► SourceStream
//! ```
//!
//! Everything runs on one thread. Streams hold `Rc` handles to shared state,
//! and work that must happen "later" (`error`, `close`, `readable`, construct
//! hooks, read-ahead) is queued on a [`Scheduler`] shared by the pipeline.
//! Drive it with [`Scheduler::run_until_idle`] in synchronous code, or with
//! [`Scheduler::run`] inside a `tokio::task::LocalSet` when hooks are async.
//!
//! # Example
//!
//! ```
//! use chunkflow::{Chunk, Scheduler, SinkStream, SourceStream, StreamConfig};
//!
//! let scheduler = Scheduler::new();
//! let source = SourceStream::new(&scheduler, StreamConfig::default(), |_, _| {});
//! let sink = SinkStream::new(&scheduler, StreamConfig::default(), |_, chunk, _, done| {
//!     assert_eq!(chunk.as_bytes(), Some(&b"hello"[..]));
//!     done(Ok(()));
//! });
//!
//! source.pipe(&sink);
//! source.push(Some(Chunk::from("hello")));
//! source.push(None);
//! scheduler.run_until_idle();
//! assert!(sink.writable_finished());
//! ```

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod duplex;
pub mod error;
pub mod events;
pub mod hooks;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stats;
pub mod transform;

pub use buffer::ChunkQueue;
pub use chunk::{Chunk, Encoding};
pub use config::{DuplexConfig, StreamConfig};
pub use duplex::DuplexStream;
pub use error::{Callback, Result, StreamError};
pub use events::{Emitter, EventRegistry, Listener, Payload};
pub use scheduler::Scheduler;
pub use sink::{AsSink, SinkBuilder, SinkStream};
pub use source::{PipeOptions, SourceBuilder, SourceStream};
pub use stats::{SinkStats, SourceStats};
pub use transform::{Emit, TransformBuilder, TransformStream};
