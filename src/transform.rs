//! Transform streams
//!
//! A [`TransformStream`] is a [`DuplexStream`] whose sink half feeds a
//! transform function and whose source half carries the results.
//!
//! ```text
//!   write ──► sink half ──► transform(chunk, encoding, emit)
//!                                    │ emit.done(Ok(Some(out)))
//!                                    ▼
//!                               source half ──► data / read
//!                                    │ read hook
//!                                    ▼
//!                     release the held write callback ──► next write
//! ```
//!
//! While output sits unread in the source half, the write that produced it
//! stays incomplete, so the sink half buffers further input and only one
//! transform is in flight.

use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;

use crate::chunk::{Chunk, Encoding};
use crate::config::DuplexConfig;
use crate::duplex::DuplexStream;
use crate::error::{Callback, Result, StreamError};
use crate::events::{Emitter, EventRegistry, Listener, Payload};
use crate::hooks::{FlushFn, TransformFn};
use crate::scheduler::Scheduler;
use crate::sink::{AsSink, SinkStream};
use crate::source::SourceStream;

type HeldCallback = Rc<RefCell<Option<Callback>>>;

enum Completion {
    Write {
        callback: Callback,
        sink: SinkStream,
        length_before: usize,
        held: HeldCallback,
    },
    Flush {
        callback: Callback,
    },
}

/// Output handle given to transform and flush functions
///
/// Consumed by [`Emit::done`]; dropping it without calling `done` leaves the
/// write (or `end`) pending forever.
pub struct Emit {
    source: SourceStream,
    completion: Completion,
}

impl Emit {
    /// Push an output chunk without completing
    ///
    /// Returns the source half's backpressure signal.
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        self.source.push(Some(chunk.into()))
    }

    /// Complete with an optional last output chunk, or fail
    pub fn done(self, result: Result<Option<Chunk>>) {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(error = %err, "transform failed");
                match self.completion {
                    Completion::Write { callback, .. } | Completion::Flush { callback } => {
                        callback(Err(err))
                    }
                }
                return;
            }
        };
        if let Some(chunk) = output {
            self.source.push(Some(chunk));
        }

        match self.completion {
            Completion::Write {
                callback,
                sink,
                length_before,
                held,
            } => {
                // Output consumed right away, or nothing to wait for
                if sink.is_ended() || self.source.readable_length() == length_before {
                    callback(Ok(()));
                } else {
                    *held.borrow_mut() = Some(callback);
                }
            }
            Completion::Flush { callback } => {
                self.source.push(None);
                callback(Ok(()));
            }
        }
    }

    /// Complete with one output chunk
    pub fn output(self, chunk: impl Into<Chunk>) {
        self.done(Ok(Some(chunk.into())));
    }
}

/// Builder for [`TransformStream`]
pub struct TransformBuilder {
    scheduler: Scheduler,
    config: DuplexConfig,
    transform: TransformFn,
    flush: Option<FlushFn>,
}

impl TransformBuilder {
    /// Set the options of both halves
    pub fn config(mut self, config: impl Into<DuplexConfig>) -> Self {
        self.config = config.into();
        self
    }

    /// Function run after the last write, before the source half ends
    pub fn flush<F>(mut self, f: F) -> Self
    where
        F: Fn(Emit) + 'static,
    {
        self.flush = Some(Rc::new(f));
        self
    }

    /// Create the transform
    pub fn build(self) -> TransformStream {
        let held: HeldCallback = Rc::default();

        let release = held.clone();
        let source = SourceStream::builder(&self.scheduler, move |_, _| {
            let callback = release.borrow_mut().take();
            if let Some(callback) = callback {
                callback(Ok(()));
            }
        })
        .config(self.config.readable)
        .initially_sync(false);

        let scheduler = self.scheduler;
        let writable = self.config.writable;
        let transform = self.transform;
        let flush = self.flush;
        let duplex = DuplexStream::assemble(source, move |source| {
            let write_source = source.downgrade();
            let final_source = source.downgrade();

            SinkStream::builder(&scheduler, move |sink, chunk, encoding, callback| {
                let Some(source) = write_source.upgrade() else {
                    callback(Err(StreamError::Destroyed("transform")));
                    return;
                };
                tracing::trace!(len = chunk.len(), "transforming chunk");
                let emit = Emit {
                    completion: Completion::Write {
                        callback,
                        sink: sink.clone(),
                        length_before: source.readable_length(),
                        held: held.clone(),
                    },
                    source,
                };
                transform(chunk, encoding, emit);
            })
            .config(writable)
            .finalize(move |_, callback| {
                let Some(source) = final_source.upgrade() else {
                    callback(Ok(()));
                    return;
                };
                match &flush {
                    Some(flush) if !source.destroyed() => flush(Emit {
                        source,
                        completion: Completion::Flush { callback },
                    }),
                    _ => {
                        source.push(None);
                        callback(Ok(()));
                    }
                }
            })
        });
        TransformStream { duplex }
    }
}

/// Duplex stream that rewrites what is written into what is read
#[derive(Clone)]
pub struct TransformStream {
    duplex: DuplexStream,
}

impl TransformStream {
    /// Start building a transform around `transform`
    pub fn builder<F>(scheduler: &Scheduler, transform: F) -> TransformBuilder
    where
        F: Fn(Chunk, Encoding, Emit) + 'static,
    {
        TransformBuilder {
            scheduler: scheduler.clone(),
            config: DuplexConfig::default(),
            transform: Rc::new(transform),
            flush: None,
        }
    }

    /// Create a transform with the given options
    pub fn new<F>(scheduler: &Scheduler, config: impl Into<DuplexConfig>, transform: F) -> Self
    where
        F: Fn(Chunk, Encoding, Emit) + 'static,
    {
        Self::builder(scheduler, transform).config(config).build()
    }

    /// A transform that forwards every chunk unchanged
    pub fn passthrough(scheduler: &Scheduler, config: impl Into<DuplexConfig>) -> Self {
        Self::new(scheduler, config, |chunk, _, emit| emit.output(chunk))
    }

    /// The underlying duplex
    pub fn duplex(&self) -> &DuplexStream {
        &self.duplex
    }
}

impl Deref for TransformStream {
    type Target = DuplexStream;

    fn deref(&self) -> &DuplexStream {
        &self.duplex
    }
}

impl AsSink for TransformStream {
    fn as_sink(&self) -> &SinkStream {
        self.duplex.sink()
    }
}

impl Emitter for TransformStream {
    fn events(&self) -> &EventRegistry<Payload> {
        self.duplex.events()
    }

    fn on(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.duplex.on(name, listener);
        self
    }

    fn once(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.duplex.once(name, listener);
        self
    }
}

impl std::fmt::Debug for TransformStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransformStream").field(&self.duplex).finish()
    }
}
