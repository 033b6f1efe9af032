//! Buffered sink with backpressure
//!
//! ```text
//!   write(chunk) ──► length += units ──► writing / corked / unconstructed?
//!                                          │ yes              │ no
//!                                          ▼                  ▼
//!                                       buffered ──────► write hook ──► done(result)
//!                                                                          │
//!   drain (once length is back to 0) ◄── callbacks ◄── next request ◄──────┘
//! ```
//!
//! `write` returns false once the accepted-but-incomplete length reaches the
//! high-water mark. The caller should then wait for `drain`.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use crate::chunk::{Chunk, Encoding};
use crate::config::StreamConfig;
use crate::error::{Callback, Result, StreamError};
use crate::events::{self, Emitter, EventRegistry, Payload};
use crate::hooks::{ConstructFn, DestroyFn, FinalFn, PeerFn, WriteFn, WritevFn};
use crate::scheduler::Scheduler;
use crate::stats::SinkStats;

use super::state::{PendingDestroy, SinkState, WriteRequest};

struct SinkHooks {
    write: WriteFn,
    writev: Option<WritevFn>,
    final_fn: Option<FinalFn>,
    destroy: Option<DestroyFn<SinkStream>>,
}

struct SinkInner {
    state: RefCell<SinkState>,
    events: EventRegistry<Payload>,
    scheduler: Scheduler,
    hooks: SinkHooks,
    /// Shared with the other half of a duplex so `error` is emitted once
    error_emitted: Rc<Cell<bool>>,
    peer: RefCell<Option<PeerFn>>,
}

/// Writable end of a pipeline
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct SinkStream {
    inner: Rc<SinkInner>,
}

/// Non-owning handle to a [`SinkStream`]
#[derive(Clone)]
pub(crate) struct WeakSink {
    inner: Weak<SinkInner>,
}

impl WeakSink {
    pub fn upgrade(&self) -> Option<SinkStream> {
        self.inner.upgrade().map(|inner| SinkStream { inner })
    }
}

/// Builder for [`SinkStream`]
pub struct SinkBuilder {
    scheduler: Scheduler,
    config: StreamConfig,
    write: WriteFn,
    writev: Option<WritevFn>,
    final_fn: Option<FinalFn>,
    construct: Option<ConstructFn<SinkStream>>,
    destroy: Option<DestroyFn<SinkStream>>,
    events: Option<EventRegistry<Payload>>,
    error_emitted: Option<Rc<Cell<bool>>>,
}

impl SinkBuilder {
    /// Set the stream options
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook receiving every buffered request in one call
    pub fn writev<F>(mut self, f: F) -> Self
    where
        F: Fn(&SinkStream, Vec<(Chunk, Encoding)>, Callback) + 'static,
    {
        self.writev = Some(Rc::new(f));
        self
    }

    /// Hook run after the last write completes, before `finish`
    pub fn finalize<F>(mut self, f: F) -> Self
    where
        F: Fn(&SinkStream, Callback) + 'static,
    {
        self.final_fn = Some(Rc::new(f));
        self
    }

    /// Hook run on a later turn before any write is dispatched
    pub fn construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&SinkStream, Callback) + 'static,
    {
        self.construct = Some(Rc::new(f));
        self
    }

    /// Hook releasing the underlying resource on destroy
    pub fn destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&SinkStream, Option<StreamError>, Callback) + 'static,
    {
        self.destroy = Some(Rc::new(f));
        self
    }

    pub(crate) fn events(mut self, events: EventRegistry<Payload>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn error_guard(mut self, guard: Rc<Cell<bool>>) -> Self {
        self.error_emitted = Some(guard);
        self
    }

    /// Leave `close` to the readable half of a duplex
    pub(crate) fn suppress_close(mut self) -> Self {
        self.config.emit_close = false;
        self
    }

    /// Create the sink
    pub fn build(self) -> SinkStream {
        let constructed = self.construct.is_none();
        let sink = SinkStream {
            inner: Rc::new(SinkInner {
                state: RefCell::new(SinkState::new(&self.config, constructed)),
                events: self.events.unwrap_or_default(),
                scheduler: self.scheduler,
                hooks: SinkHooks {
                    write: self.write,
                    writev: self.writev,
                    final_fn: self.final_fn,
                    destroy: self.destroy,
                },
                error_emitted: self.error_emitted.unwrap_or_default(),
                peer: RefCell::new(None),
            }),
        };
        if let Some(construct) = self.construct {
            sink.start_construct(construct);
        }
        sink
    }
}

impl SinkStream {
    /// Start building a sink around a write hook
    pub fn builder<F>(scheduler: &Scheduler, write: F) -> SinkBuilder
    where
        F: Fn(&SinkStream, Chunk, Encoding, Callback) + 'static,
    {
        SinkBuilder {
            scheduler: scheduler.clone(),
            config: StreamConfig::default(),
            write: Rc::new(write),
            writev: None,
            final_fn: None,
            construct: None,
            destroy: None,
            events: None,
            error_emitted: None,
        }
    }

    /// Create a sink with the given options and write hook
    pub fn new<F>(scheduler: &Scheduler, config: StreamConfig, write: F) -> Self
    where
        F: Fn(&SinkStream, Chunk, Encoding, Callback) + 'static,
    {
        Self::builder(scheduler, write).config(config).build()
    }

    fn state(&self) -> Ref<'_, SinkState> {
        self.inner.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, SinkState> {
        self.inner.state.borrow_mut()
    }

    /// Scheduler this sink defers work to
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Check if two handles refer to the same sink
    pub fn ptr_eq(&self, other: &SinkStream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn defer(&self, task: impl FnOnce(&SinkStream) + 'static) {
        let sink = self.clone();
        self.inner.scheduler.defer(move || task(&sink));
    }

    /// Write a chunk with the default encoding
    pub fn write(&self, chunk: impl Into<Chunk>) -> bool {
        self.write_with(chunk.into(), None, None)
    }

    /// Write a chunk
    ///
    /// Returns false when the caller should wait for `drain`, or when the
    /// write was rejected. A rejected write hands its error to `callback` on
    /// a later turn and surfaces it as `error`.
    pub fn write_with(
        &self,
        chunk: Chunk,
        encoding: Option<Encoding>,
        callback: Option<Callback>,
    ) -> bool {
        self.write_chunk(chunk, encoding, callback).unwrap_or(false)
    }

    fn write_chunk(
        &self,
        chunk: Chunk,
        encoding: Option<Encoding>,
        callback: Option<Callback>,
    ) -> Result<bool> {
        let checked = {
            let state = self.state();
            if state.ending {
                Err(StreamError::WriteAfterEnd)
            } else if state.destroyed {
                Err(StreamError::Destroyed("write"))
            } else {
                state.normalize(chunk, encoding)
            }
        };
        let (chunk, encoding) = match checked {
            Ok(normalized) => normalized,
            Err(err) => {
                tracing::debug!(error = %err, "write rejected");
                if let Some(callback) = callback {
                    let reported = err.clone();
                    self.inner.scheduler.defer(move || callback(Err(reported)));
                }
                self.error_or_destroy(err.clone(), true);
                return Err(err);
            }
        };

        let (ret, dispatch) = {
            let mut state = self.state_mut();
            let len = state.unit_len(&chunk);
            state.pending_cb += 1;
            state.length += len;
            state.chunks_written += 1;
            state.units_written += len as u64;

            let ret = state.length < state.high_water_mark;
            if !ret {
                state.need_drain = true;
            }

            if state.writing || state.corked > 0 || state.errored.is_some() || !state.constructed
            {
                state.buffered.push_back(WriteRequest {
                    chunk,
                    encoding,
                    callback,
                });
                (ret, None)
            } else {
                (ret, Some((len, chunk, encoding, callback)))
            }
        };

        if let Some((len, chunk, encoding, callback)) = dispatch {
            let write = self.inner.hooks.write.clone();
            self.do_write(len, callback, move |sink, done| {
                write(sink, chunk, encoding, done)
            });
        }

        let state = self.state();
        Ok(ret && state.errored.is_none() && !state.destroyed)
    }

    fn do_write(
        &self,
        len: usize,
        callback: Option<Callback>,
        dispatch: impl FnOnce(&SinkStream, Callback),
    ) {
        let destroyed = {
            let mut state = self.state_mut();
            state.write_len = len;
            state.write_cb = callback;
            state.writing = true;
            state.sync = true;
            state.destroyed
        };

        let sink = self.clone();
        let done: Callback = Box::new(move |result| sink.on_write(result));
        if destroyed {
            done(Err(StreamError::Destroyed("write")));
        } else {
            tracing::trace!(units = len, "dispatching write");
            dispatch(self, done);
        }

        self.state_mut().sync = false;
    }

    fn on_write(&self, result: Result<()>) {
        let (sync, callback, has_buffered) = {
            let mut state = self.state_mut();
            let sync = state.sync;
            let callback = state.write_cb.take();
            state.writing = false;
            state.length = state.length.saturating_sub(state.write_len);
            state.write_len = 0;
            if let Err(err) = &result {
                if state.errored.is_none() {
                    state.errored = Some(err.clone());
                }
            }
            (sync, callback, !state.buffered.is_empty())
        };

        match result {
            Err(err) => {
                if sync {
                    self.defer(move |sink| sink.on_write_error(err, callback));
                } else {
                    self.on_write_error(err, callback);
                }
            }
            Ok(()) => {
                if has_buffered {
                    self.clear_buffer();
                }
                if sync {
                    self.defer(move |sink| sink.after_write(callback));
                } else {
                    self.after_write(callback);
                }
            }
        }
    }

    fn on_write_error(&self, err: StreamError, callback: Option<Callback>) {
        {
            let mut state = self.state_mut();
            state.pending_cb = state.pending_cb.saturating_sub(1);
        }
        if let Some(callback) = callback {
            callback(Err(err.clone()));
        }
        self.error_buffer();
        self.error_or_destroy(err, false);
    }

    fn after_write(&self, callback: Option<Callback>) {
        let need_drain = {
            let mut state = self.state_mut();
            let need_drain =
                !state.ending && !state.destroyed && state.length == 0 && state.need_drain;
            if need_drain {
                state.need_drain = false;
                state.drains += 1;
            }
            need_drain
        };
        if need_drain {
            self.inner.events.emit(events::DRAIN, &Payload::Empty);
        }

        {
            let mut state = self.state_mut();
            state.pending_cb = state.pending_cb.saturating_sub(1);
        }
        if let Some(callback) = callback {
            callback(Ok(()));
        }

        if self.state().destroyed {
            self.error_buffer();
        }
        self.finish_maybe(false);
    }

    fn clear_buffer(&self) {
        let batch = {
            let mut state = self.state_mut();
            if state.corked > 0
                || state.buffer_processing
                || state.destroyed
                || !state.constructed
                || state.buffered.is_empty()
            {
                return;
            }
            state.buffer_processing = true;

            match &self.inner.hooks.writev {
                Some(writev) if state.buffered.len() > 1 => {
                    let requests: Vec<WriteRequest> = state.buffered.drain(..).collect();
                    state.pending_cb = state.pending_cb.saturating_sub(requests.len() - 1);
                    Some((writev.clone(), state.length, requests))
                }
                _ => None,
            }
        };

        match batch {
            Some((writev, len, requests)) => {
                let mut chunks = Vec::with_capacity(requests.len());
                let mut callbacks = Vec::new();
                for request in requests {
                    chunks.push((request.chunk, request.encoding));
                    callbacks.extend(request.callback);
                }
                let callback: Callback = Box::new(move |result: Result<()>| {
                    for callback in callbacks {
                        callback(result.clone());
                    }
                });
                self.do_write(len, Some(callback), move |sink, done| {
                    writev(sink, chunks, done)
                });
            }
            None => loop {
                let next = {
                    let mut state = self.state_mut();
                    state
                        .buffered
                        .pop_front()
                        .map(|request| (state.unit_len(&request.chunk), request))
                };
                let Some((len, request)) = next else {
                    break;
                };
                let write = self.inner.hooks.write.clone();
                let WriteRequest {
                    chunk,
                    encoding,
                    callback,
                } = request;
                self.do_write(len, callback, move |sink, done| {
                    write(sink, chunk, encoding, done)
                });

                let state = self.state();
                if state.writing || state.buffered.is_empty() {
                    break;
                }
            },
        }

        self.state_mut().buffer_processing = false;
    }

    /// Fail every buffered request and pending `end` callback
    fn error_buffer(&self) {
        let (requests, finished, err) = {
            let mut state = self.state_mut();
            if state.writing {
                return;
            }
            let requests: Vec<WriteRequest> = state.buffered.drain(..).collect();
            for request in &requests {
                let len = state.unit_len(&request.chunk);
                state.length = state.length.saturating_sub(len);
                state.pending_cb = state.pending_cb.saturating_sub(1);
            }
            let finished = std::mem::take(&mut state.on_finished);
            (requests, finished, state.errored.clone())
        };

        for request in requests {
            if let Some(callback) = request.callback {
                callback(Err(err
                    .clone()
                    .unwrap_or(StreamError::Destroyed("write"))));
            }
        }
        for callback in finished {
            callback(Err(err.clone().unwrap_or(StreamError::Destroyed("end"))));
        }
    }

    /// Hold writes in the buffer until a matching `uncork`
    pub fn cork(&self) -> &Self {
        self.state_mut().corked += 1;
        self
    }

    /// Release one `cork`; the buffer is flushed when the count reaches 0
    pub fn uncork(&self) -> &Self {
        let flush = {
            let mut state = self.state_mut();
            if state.corked == 0 {
                return self;
            }
            state.corked -= 1;
            !state.writing
        };
        if flush {
            self.clear_buffer();
        }
        self
    }

    /// Signal that no more data will be written
    pub fn end(&self) -> &Self {
        self.end_with(None, None, None)
    }

    /// Optionally write a last chunk, then end the sink
    ///
    /// `callback` runs after `finish`, or with an error if the sink already
    /// finished or was destroyed.
    pub fn end_with(
        &self,
        chunk: Option<Chunk>,
        encoding: Option<Encoding>,
        callback: Option<Callback>,
    ) -> &Self {
        let mut err = match chunk {
            Some(chunk) => self.write_chunk(chunk, encoding, None).err(),
            None => None,
        };

        let corked = {
            let mut state = self.state_mut();
            if state.corked > 0 {
                state.corked = 1;
                true
            } else {
                false
            }
        };
        if corked {
            self.uncork();
        }

        if err.is_none() {
            let (start, finished, destroyed) = {
                let state = self.state();
                (
                    state.errored.is_none() && !state.ending,
                    state.finished,
                    state.destroyed,
                )
            };
            if start {
                self.state_mut().ending = true;
                self.finish_maybe(true);
                self.state_mut().ended = true;
            } else if finished {
                err = Some(StreamError::AlreadyFinished);
            } else if destroyed {
                err = Some(StreamError::Destroyed("end"));
            }
        }

        if let Some(callback) = callback {
            let result = {
                let state = self.state();
                match err {
                    Some(err) => Some(Err(err)),
                    None if state.finished => Some(Ok(())),
                    // The final hook may already have failed and destroyed us
                    None if state.destroyed => Some(Err(state
                        .errored
                        .clone()
                        .unwrap_or(StreamError::Destroyed("end")))),
                    None => None,
                }
            };
            match result {
                Some(result) => self.inner.scheduler.defer(move || callback(result)),
                None => self.state_mut().on_finished.push(callback),
            }
        }
        self
    }

    fn need_finish(&self) -> bool {
        let state = self.state();
        state.ending
            && !state.destroyed
            && state.constructed
            && state.length == 0
            && state.errored.is_none()
            && state.buffered.is_empty()
            && !state.finished
            && !state.writing
            && !self.inner.error_emitted.get()
            && !state.close_emitted
    }

    fn finish_maybe(&self, sync: bool) {
        if !self.need_finish() {
            return;
        }
        self.prefinish();

        if self.state().pending_cb != 0 {
            return;
        }
        if sync {
            self.state_mut().pending_cb += 1;
            self.defer(|sink| {
                if sink.need_finish() {
                    sink.finish();
                } else {
                    let mut state = sink.state_mut();
                    state.pending_cb = state.pending_cb.saturating_sub(1);
                }
            });
        } else if self.need_finish() {
            self.state_mut().pending_cb += 1;
            self.finish();
        }
    }

    fn prefinish(&self) {
        let call_final = {
            let mut state = self.state_mut();
            if state.prefinished || state.final_called {
                return;
            }
            if self.inner.hooks.final_fn.is_some() && !state.destroyed {
                state.final_called = true;
                true
            } else {
                state.prefinished = true;
                false
            }
        };

        match (&self.inner.hooks.final_fn, call_final) {
            (Some(final_fn), true) => {
                {
                    let mut state = self.state_mut();
                    state.sync = true;
                    state.pending_cb += 1;
                }
                let sink = self.clone();
                let done: Callback = Box::new(move |result| sink.on_final(result));
                final_fn(self, done);
                self.state_mut().sync = false;
            }
            _ => {
                self.inner.events.emit(events::PREFINISH, &Payload::Empty);
            }
        }
    }

    fn on_final(&self, result: Result<()>) {
        let sync = {
            let mut state = self.state_mut();
            state.pending_cb = state.pending_cb.saturating_sub(1);
            state.sync
        };

        match result {
            Err(err) => {
                tracing::debug!(error = %err, "final hook failed");
                let callbacks = std::mem::take(&mut self.state_mut().on_finished);
                for callback in callbacks {
                    callback(Err(err.clone()));
                }
                self.error_or_destroy(err, sync);
            }
            Ok(()) if self.need_finish() => {
                self.state_mut().prefinished = true;
                self.inner.events.emit(events::PREFINISH, &Payload::Empty);
                self.state_mut().pending_cb += 1;
                self.defer(|sink| sink.finish());
            }
            Ok(()) => {}
        }
    }

    fn finish(&self) {
        let (callbacks, auto_destroy) = {
            let mut state = self.state_mut();
            state.pending_cb = state.pending_cb.saturating_sub(1);
            state.finished = true;
            (std::mem::take(&mut state.on_finished), state.auto_destroy)
        };
        for callback in callbacks {
            callback(Ok(()));
        }
        self.inner.events.emit(events::FINISH, &Payload::Empty);

        if auto_destroy {
            self.destroy();
        }
    }

    /// Change the encoding used for text writes without one
    pub fn set_default_encoding(&self, encoding: Encoding) -> &Self {
        self.state_mut().default_encoding = encoding;
        self
    }

    /// Change the default encoding by name
    pub fn set_default_encoding_name(&self, name: &str) -> Result<&Self> {
        let encoding = name.parse()?;
        Ok(self.set_default_encoding(encoding))
    }

    /// Destroy the sink without an error
    pub fn destroy(&self) -> &Self {
        self.destroy_with(None, None)
    }

    /// Destroy the sink
    ///
    /// Buffered writes fail with the recorded error (or `Destroyed`), `error`
    /// is emitted when `err` is given and `close` follows on a later turn.
    /// Calls after the first only run `callback`.
    pub fn destroy_with(&self, err: Option<StreamError>, callback: Option<Callback>) -> &Self {
        let (already, constructed, flush) = {
            let state = self.state();
            (
                state.destroyed,
                state.constructed,
                !state.buffered.is_empty() || !state.on_finished.is_empty(),
            )
        };
        if already {
            if let Some(callback) = callback {
                callback(Ok(()));
            }
            return self;
        }
        if flush {
            self.defer(|sink| sink.error_buffer());
        }

        {
            let mut state = self.state_mut();
            if state.errored.is_none() {
                state.errored = err.clone();
            }
            state.destroyed = true;
            if !constructed {
                state.pending_destroy = Some(PendingDestroy {
                    error: err,
                    callback,
                });
                return self;
            }
        }
        self.run_destroy(err, callback);
        self
    }

    fn run_destroy(&self, err: Option<StreamError>, callback: Option<Callback>) {
        tracing::debug!(error = ?err, "destroying sink");
        let sink = self.clone();
        let done: Callback = Box::new(move |result| sink.on_destroyed(result.err(), callback));
        match &self.inner.hooks.destroy {
            Some(destroy) => destroy(self, err, done),
            None => done(err.map_or(Ok(()), Err)),
        }
    }

    fn on_destroyed(&self, err: Option<StreamError>, callback: Option<Callback>) {
        {
            let mut state = self.state_mut();
            if state.errored.is_none() {
                state.errored = err.clone();
            }
            state.closed = true;
        }
        if let Some(callback) = callback {
            callback(err.clone().map_or(Ok(()), Err));
        }
        self.defer(move |sink| {
            if let Some(err) = err {
                sink.emit_error_now(err);
            }
            sink.emit_close_now();
        });
    }

    pub(crate) fn error_or_destroy(&self, err: StreamError, sync: bool) {
        let auto_destroy = {
            let mut state = self.state_mut();
            if state.destroyed {
                return;
            }
            if !state.auto_destroy && state.errored.is_none() {
                state.errored = Some(err.clone());
            }
            state.auto_destroy
        };

        if auto_destroy {
            self.destroy_with(Some(err.clone()), None);
            let peer = self.inner.peer.borrow().clone();
            if let Some(peer) = peer {
                peer(err);
            }
        } else if sync {
            self.defer(move |sink| sink.emit_error_now(err));
        } else {
            self.emit_error_now(err);
        }
    }

    fn emit_error_now(&self, err: StreamError) {
        if self.inner.error_emitted.replace(true) {
            return;
        }
        if !self.inner.events.emit(events::ERROR, &Payload::Error(err.clone())) {
            tracing::warn!(error = %err, "unhandled sink error");
        }
    }

    fn emit_close_now(&self) {
        let emit_close = {
            let mut state = self.state_mut();
            state.close_emitted = true;
            state.emit_close
        };
        if emit_close {
            self.inner.events.emit(events::CLOSE, &Payload::Empty);
        }
    }

    fn start_construct(&self, construct: ConstructFn<SinkStream>) {
        self.defer(move |sink| {
            let handle = sink.clone();
            let done: Callback = Box::new(move |result| {
                let err = result.err();
                handle.defer(move |sink| sink.on_construct(err));
            });
            construct(sink, done);
        });
    }

    fn on_construct(&self, err: Option<StreamError>) {
        let (destroyed, pending) = {
            let mut state = self.state_mut();
            state.constructed = true;
            (state.destroyed, state.pending_destroy.take())
        };

        if destroyed {
            if let Some(pending) = pending {
                self.run_destroy(err.or(pending.error), pending.callback);
            }
        } else if let Some(err) = err {
            tracing::debug!(error = %err, "sink construct failed");
            self.error_or_destroy(err, true);
        } else {
            self.defer(|sink| {
                if !sink.state().writing {
                    sink.clear_buffer();
                }
                sink.finish_maybe(false);
            });
        }
    }

    /// Check if `write` would be accepted
    pub fn writable(&self) -> bool {
        let state = self.state();
        !state.destroyed && state.errored.is_none() && !state.ending
    }

    /// Units accepted and not yet completed
    pub fn writable_length(&self) -> usize {
        self.state().length
    }

    /// Backpressure threshold
    pub fn writable_high_water_mark(&self) -> usize {
        self.state().high_water_mark
    }

    /// Check if a `drain` is owed to a writer that got `false`
    pub fn writable_need_drain(&self) -> bool {
        let state = self.state();
        !state.destroyed && !state.ending && state.need_drain
    }

    /// Current cork depth
    pub fn writable_corked(&self) -> u32 {
        self.state().corked
    }

    /// Check if `end` was called
    pub fn writable_ended(&self) -> bool {
        self.state().ending
    }

    /// Check if `finish` was emitted
    pub fn writable_finished(&self) -> bool {
        self.state().finished
    }

    /// Check if the sink is in object mode
    pub fn writable_object_mode(&self) -> bool {
        self.state().object_mode
    }

    /// Check if the sink was destroyed
    pub fn destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// Check if the destroy hook completed
    pub fn closed(&self) -> bool {
        self.state().closed
    }

    /// The recorded error, if any
    pub fn errored(&self) -> Option<StreamError> {
        self.state().errored.clone()
    }

    /// Snapshot of buffer and throughput counters
    pub fn stats(&self) -> SinkStats {
        self.state().stats()
    }

    /// A `write` returned false and `drain` has not been emitted yet
    pub(crate) fn downgrade(&self) -> WeakSink {
        WeakSink {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Run `peer` after this sink destroys itself because of an error
    pub(crate) fn set_peer(&self, peer: PeerFn) {
        *self.inner.peer.borrow_mut() = Some(peer);
    }

    pub(crate) fn awaiting_drain(&self) -> bool {
        self.state().need_drain
    }

    /// `end` has been called and has returned
    pub(crate) fn is_ended(&self) -> bool {
        self.state().ended
    }
}

/// Anything that can be written to: sinks, duplex and transform streams
pub trait AsSink {
    /// The writable half
    fn as_sink(&self) -> &SinkStream;
}

impl AsSink for SinkStream {
    fn as_sink(&self) -> &SinkStream {
        self
    }
}

impl Emitter for SinkStream {
    fn events(&self) -> &EventRegistry<Payload> {
        &self.inner.events
    }
}

impl std::fmt::Debug for SinkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SinkStream")
            .field("length", &state.length)
            .field("buffered", &state.buffered.len())
            .field("writing", &state.writing)
            .field("corked", &state.corked)
            .field("ending", &state.ending)
            .field("finished", &state.finished)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
