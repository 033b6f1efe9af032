//! Buffered source with flowing and paused consumption
//!
//! ```text
//!                  push(chunk)
//!                      │
//!      flowing, empty buffer, data listener, not inside the read hook?
//!             │ yes                          │ no
//!             ▼                              ▼
//!        emit `data`                    ChunkQueue ──► `readable` (deferred)
//!                                            │
//!                         read(n) / flow loop ──► emit `data`, return chunk
//!                                            │
//!                   below high-water mark ──► read hook(size) ──► push ...
//! ```
//!
//! A source starts with no flow mode. Adding a `data` listener (or calling
//! `resume`) switches it to flowing; adding a `readable` listener or calling
//! `pause` switches it to paused, where the consumer pulls with `read`.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use crate::chunk::{Chunk, Encoding};
use crate::config::StreamConfig;
use crate::error::{Callback, StreamError};
use crate::events::{self, Emitter, EventRegistry, Listener, Payload};
use crate::hooks::{ConstructFn, DestroyFn, PeerFn, ReadFn};
use crate::scheduler::Scheduler;
use crate::stats::SourceStats;

use super::state::{compute_new_high_water_mark, PendingDestroy, SourceState};

struct SourceHooks {
    read: ReadFn,
    destroy: Option<DestroyFn<SourceStream>>,
}

struct SourceInner {
    state: RefCell<SourceState>,
    events: EventRegistry<Payload>,
    scheduler: Scheduler,
    hooks: SourceHooks,
    error_emitted: Rc<Cell<bool>>,
    peer: RefCell<Option<PeerFn>>,
}

/// Readable end of a pipeline
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct SourceStream {
    inner: Rc<SourceInner>,
}

/// Non-owning handle to a [`SourceStream`]
#[derive(Clone)]
pub(crate) struct WeakSource {
    inner: Weak<SourceInner>,
}

impl WeakSource {
    pub fn upgrade(&self) -> Option<SourceStream> {
        self.inner.upgrade().map(|inner| SourceStream { inner })
    }
}

/// Builder for [`SourceStream`]
pub struct SourceBuilder {
    scheduler: Scheduler,
    config: StreamConfig,
    read: ReadFn,
    construct: Option<ConstructFn<SourceStream>>,
    destroy: Option<DestroyFn<SourceStream>>,
    events: Option<EventRegistry<Payload>>,
    error_emitted: Option<Rc<Cell<bool>>>,
    sync: bool,
}

impl SourceBuilder {
    /// Set the stream options
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook run on a later turn before the first read
    pub fn construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&SourceStream, Callback) + 'static,
    {
        self.construct = Some(Rc::new(f));
        self
    }

    /// Hook releasing the underlying resource on destroy
    pub fn destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&SourceStream, Option<StreamError>, Callback) + 'static,
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

    /// Whether pushes before the first read count as synchronous
    pub(crate) fn initially_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Create the source
    pub fn build(self) -> SourceStream {
        let constructed = self.construct.is_none();
        let source = SourceStream {
            inner: Rc::new(SourceInner {
                state: RefCell::new(SourceState::new(&self.config, constructed, self.sync)),
                events: self.events.unwrap_or_default(),
                scheduler: self.scheduler,
                hooks: SourceHooks {
                    read: self.read,
                    destroy: self.destroy,
                },
                error_emitted: self.error_emitted.unwrap_or_default(),
                peer: RefCell::new(None),
            }),
        };

        let weak = source.downgrade();
        source.inner.events.observe_removals(Rc::new(move |name: &str| {
            if name != events::READABLE {
                return;
            }
            if let Some(source) = weak.upgrade() {
                source.defer(|source| source.update_readable_listening());
            }
        }));

        if let Some(construct) = self.construct {
            source.start_construct(construct);
        }
        source
    }
}

impl SourceStream {
    /// Start building a source around a read hook
    pub fn builder<F>(scheduler: &Scheduler, read: F) -> SourceBuilder
    where
        F: Fn(&SourceStream, usize) + 'static,
    {
        SourceBuilder {
            scheduler: scheduler.clone(),
            config: StreamConfig::default(),
            read: Rc::new(read),
            construct: None,
            destroy: None,
            events: None,
            error_emitted: None,
            sync: true,
        }
    }

    /// Create a source with the given options and read hook
    pub fn new<F>(scheduler: &Scheduler, config: StreamConfig, read: F) -> Self
    where
        F: Fn(&SourceStream, usize) + 'static,
    {
        Self::builder(scheduler, read).config(config).build()
    }

    pub(crate) fn state(&self) -> Ref<'_, SourceState> {
        self.inner.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, SourceState> {
        self.inner.state.borrow_mut()
    }

    pub(crate) fn downgrade(&self) -> WeakSource {
        WeakSource {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_peer(&self, peer: PeerFn) {
        *self.inner.peer.borrow_mut() = Some(peer);
    }

    /// Scheduler this source defers work to
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Check if two handles refer to the same source
    pub fn ptr_eq(&self, other: &SourceStream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn defer(&self, task: impl FnOnce(&SourceStream) + 'static) {
        let source = self.clone();
        self.inner.scheduler.defer(move || task(&source));
    }

    /// Add a chunk at the tail, or end the stream with `None`
    ///
    /// Returns false once the buffer reaches the high-water mark or the
    /// stream has ended; the producer should stop until the next read hook
    /// call.
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        self.readable_add_chunk(chunk, None, false)
    }

    /// Push with an explicit encoding for text chunks
    pub fn push_with(&self, chunk: Option<Chunk>, encoding: Option<Encoding>) -> bool {
        self.readable_add_chunk(chunk, encoding, false)
    }

    /// Put a chunk back at the head of the buffer
    pub fn unshift(&self, chunk: Option<Chunk>) -> bool {
        self.readable_add_chunk(chunk, None, true)
    }

    /// Unshift with an explicit encoding for text chunks
    pub fn unshift_with(&self, chunk: Option<Chunk>, encoding: Option<Encoding>) -> bool {
        self.readable_add_chunk(chunk, encoding, true)
    }

    fn readable_add_chunk(&self, chunk: Option<Chunk>, encoding: Option<Encoding>, front: bool) -> bool {
        let normalized = match chunk {
            Some(chunk) => self.state().normalize(chunk, encoding).map(Some),
            None => Ok(None),
        };

        match normalized {
            Err(err) => self.error_or_destroy(err, true),
            Ok(None) => {
                self.state_mut().reading = false;
                self.on_eof_chunk();
            }
            Ok(Some(chunk)) => {
                let (object_mode, ended, end_emitted, dead) = {
                    let state = self.state();
                    (
                        state.object_mode,
                        state.ended,
                        state.end_emitted,
                        state.destroyed || state.errored.is_some(),
                    )
                };
                if object_mode || !chunk.is_empty() {
                    if front {
                        if end_emitted {
                            self.error_or_destroy(StreamError::UnshiftAfterEnd, true);
                        } else if dead {
                            return false;
                        } else {
                            self.add_chunk(chunk, true);
                        }
                    } else if ended {
                        self.error_or_destroy(StreamError::PushAfterEof, true);
                    } else if dead {
                        return false;
                    } else {
                        self.state_mut().reading = false;
                        self.add_chunk(chunk, false);
                    }
                } else if !front {
                    self.state_mut().reading = false;
                    self.maybe_read_more();
                }
            }
        }

        let state = self.state();
        !state.ended && (state.length < state.high_water_mark || state.length == 0)
    }

    fn add_chunk(&self, chunk: Chunk, front: bool) {
        let has_data_listener = self.inner.events.count(events::DATA) > 0;
        let direct = {
            let mut state = self.state_mut();
            let len = state.unit_len(&chunk);
            state.chunks_pushed += 1;
            state.units_pushed += len as u64;

            let direct = state.is_flowing() && state.length == 0 && !state.sync && has_data_listener;
            if direct {
                state.clear_await_drain();
                state.data_emitted = true;
                state.chunks_delivered += 1;
                state.units_delivered += len as u64;
                None
            } else {
                state.length += len;
                if front {
                    state.buffer.unshift(chunk.clone());
                } else {
                    state.buffer.push(chunk.clone());
                }
                Some(state.need_readable)
            }
        };

        match direct {
            None => {
                self.inner.events.emit(events::DATA, &Payload::Chunk(chunk));
            }
            Some(true) => self.emit_readable(),
            Some(false) => {}
        }
        self.maybe_read_more();
    }

    fn on_eof_chunk(&self) {
        let sync = {
            let mut state = self.state_mut();
            if state.ended {
                return;
            }
            state.ended = true;
            state.sync
        };

        if sync {
            self.emit_readable();
        } else {
            {
                let mut state = self.state_mut();
                state.need_readable = false;
                state.emitted_readable = true;
            }
            self.emit_readable_now();
        }
    }

    fn emit_readable(&self) {
        let schedule = {
            let mut state = self.state_mut();
            state.need_readable = false;
            if state.emitted_readable {
                false
            } else {
                state.emitted_readable = true;
                true
            }
        };
        if schedule {
            self.defer(|source| source.emit_readable_now());
        }
    }

    fn emit_readable_now(&self) {
        let emit = {
            let state = self.state();
            !state.destroyed && state.errored.is_none() && (state.length > 0 || state.ended)
        };
        if emit {
            self.inner.events.emit(events::READABLE, &Payload::Empty);
            self.state_mut().emitted_readable = false;
        }

        {
            let mut state = self.state_mut();
            state.need_readable = !state.is_flowing()
                && !state.ended
                && state.length <= state.high_water_mark;
        }
        self.flow();
    }

    fn maybe_read_more(&self) {
        let schedule = {
            let mut state = self.state_mut();
            if !state.reading_more && state.constructed {
                state.reading_more = true;
                true
            } else {
                false
            }
        };
        if schedule {
            self.defer(|source| source.maybe_read_more_now());
        }
    }

    fn maybe_read_more_now(&self) {
        loop {
            let len = {
                let state = self.state();
                let wants_more = state.length < state.high_water_mark
                    || (state.is_flowing() && state.length == 0);
                if state.reading || state.ended || !wants_more {
                    break;
                }
                state.length
            };
            self.read(Some(0));
            if len == self.state().length {
                break;
            }
        }
        self.state_mut().reading_more = false;
    }

    /// Pull up to `n` units from the buffer
    ///
    /// With `None` the whole buffer is returned while paused, or the first
    /// chunk while flowing. `read(Some(0))` only refills the buffer. A
    /// returned chunk is also emitted as `data`.
    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        let shortcut = {
            let mut state = self.state_mut();
            if let Some(n) = n {
                if n > state.high_water_mark {
                    let grown = compute_new_high_water_mark(n);
                    tracing::trace!(
                        from = state.high_water_mark,
                        to = grown,
                        "growing high-water mark"
                    );
                    state.high_water_mark = grown;
                }
            }
            if n != Some(0) {
                state.emitted_readable = false;
            }

            let filled = if state.high_water_mark != 0 {
                state.length >= state.high_water_mark
            } else {
                state.length > 0
            };
            if n == Some(0) && state.need_readable && (filled || state.ended) {
                Some(state.length == 0 && state.ended)
            } else {
                None
            }
        };
        match shortcut {
            Some(true) => {
                self.end_readable();
                return None;
            }
            Some(false) => {
                self.emit_readable();
                return None;
            }
            None => {}
        }

        let (mut count, at_end) = {
            let state = self.state();
            let count = state.how_much_to_read(n);
            (count, count == 0 && state.ended)
        };
        if at_end {
            if self.state().length == 0 {
                self.end_readable();
            }
            return None;
        }

        let do_read = {
            let mut state = self.state_mut();
            let mut do_read = state.need_readable;
            if state.length == 0 || state.length.saturating_sub(count) < state.high_water_mark {
                do_read = true;
            }
            if state.ended
                || state.reading
                || state.destroyed
                || state.errored.is_some()
                || !state.constructed
            {
                false
            } else if do_read {
                state.reading = true;
                state.sync = true;
                if state.length == 0 {
                    state.need_readable = true;
                }
                true
            } else {
                false
            }
        };
        if do_read {
            let size = self.state().high_water_mark;
            tracing::trace!(size, "calling read hook");
            (self.inner.hooks.read)(self, size);

            let mut state = self.state_mut();
            state.sync = false;
            if !state.reading {
                count = state.how_much_to_read(n);
            }
        }

        let (ret, end_now) = {
            let mut state = self.state_mut();
            let ret = if count > 0 { state.from_list(count) } else { None };
            match &ret {
                None => {
                    state.need_readable = state.length <= state.high_water_mark;
                    count = 0;
                }
                Some(_) => {
                    state.length -= count;
                    state.clear_await_drain();
                    state.chunks_delivered += 1;
                    state.units_delivered += count as u64;
                }
            }

            let mut end_now = false;
            if state.length == 0 {
                if !state.ended {
                    state.need_readable = true;
                }
                end_now = n != Some(count) && state.ended;
            }
            (ret, end_now)
        };
        if end_now {
            self.end_readable();
        }

        if let Some(chunk) = &ret {
            let silenced = self.inner.error_emitted.get() || self.state().close_emitted;
            if !silenced {
                self.state_mut().data_emitted = true;
                self.inner.events.emit(events::DATA, &Payload::Chunk(chunk.clone()));
            }
        }
        ret
    }

    fn end_readable(&self) {
        let schedule = {
            let mut state = self.state_mut();
            if state.end_emitted {
                false
            } else {
                state.ended = true;
                true
            }
        };
        if schedule {
            self.defer(|source| source.end_readable_now());
        }
    }

    fn end_readable_now(&self) {
        let auto_destroy = {
            let mut state = self.state_mut();
            if state.errored.is_some()
                || state.close_emitted
                || state.end_emitted
                || state.length != 0
            {
                return;
            }
            state.end_emitted = true;
            state.auto_destroy
        };
        self.inner.events.emit(events::END, &Payload::Empty);
        if auto_destroy {
            self.destroy();
        }
    }

    pub(crate) fn flow(&self) {
        loop {
            let flowing = self.state().is_flowing();
            if !flowing || self.read(None).is_none() {
                break;
            }
        }
    }

    /// Switch to flowing mode
    ///
    /// The buffer is drained through `data` on a later turn. A source with a
    /// `readable` listener stays paused.
    pub fn resume(&self) -> &Self {
        let schedule = {
            let mut state = self.state_mut();
            let mut schedule = false;
            if !state.is_flowing() {
                state.flowing = Some(!state.readable_listening);
                if !state.resume_scheduled {
                    state.resume_scheduled = true;
                    schedule = true;
                }
            }
            state.paused = Some(false);
            schedule
        };
        if schedule {
            self.defer(|source| source.resume_now());
        }
        self
    }

    fn resume_now(&self) {
        if !self.state().reading {
            self.read(Some(0));
        }
        self.state_mut().resume_scheduled = false;
        self.inner.events.emit(events::RESUME, &Payload::Empty);
        self.flow();

        let again = {
            let state = self.state();
            state.is_flowing() && !state.reading
        };
        if again {
            self.read(Some(0));
        }
    }

    /// Switch to paused mode; `pause` is emitted only on a mode change
    pub fn pause(&self) -> &Self {
        let changed = {
            let mut state = self.state_mut();
            let changed = state.flowing != Some(false);
            if changed {
                state.flowing = Some(false);
            }
            state.paused = Some(true);
            changed
        };
        if changed {
            self.inner.events.emit(events::PAUSE, &Payload::Empty);
        }
        self
    }

    /// Check if the source was explicitly paused
    pub fn is_paused(&self) -> bool {
        let state = self.state();
        state.paused == Some(true) || state.flowing == Some(false)
    }

    fn on_listener_added(&self, name: &str) {
        if name == events::DATA {
            let readable_listening = self.inner.events.count(events::READABLE) > 0;
            let resume = {
                let mut state = self.state_mut();
                state.readable_listening = readable_listening;
                state.flowing != Some(false)
            };
            if resume {
                self.resume();
            }
        } else if name == events::READABLE {
            // Some(true): buffered data to announce, Some(false): probe with read(0)
            let action = {
                let mut state = self.state_mut();
                if state.end_emitted || state.readable_listening {
                    None
                } else {
                    state.readable_listening = true;
                    state.need_readable = true;
                    state.flowing = Some(false);
                    state.emitted_readable = false;
                    if state.length > 0 {
                        Some(true)
                    } else if !state.reading {
                        Some(false)
                    } else {
                        None
                    }
                }
            };
            match action {
                Some(true) => self.emit_readable(),
                Some(false) => self.defer(|source| {
                    source.read(Some(0));
                }),
                None => {}
            }
        }
    }

    fn update_readable_listening(&self) {
        let readable_listening = self.inner.events.count(events::READABLE) > 0;
        let has_data = self.inner.events.count(events::DATA) > 0;
        let resume = {
            let mut state = self.state_mut();
            state.readable_listening = readable_listening;
            if state.resume_scheduled && state.paused == Some(false) {
                state.flowing = Some(true);
                false
            } else if has_data {
                true
            } else {
                if !readable_listening {
                    state.flowing = None;
                }
                false
            }
        };
        if resume {
            self.resume();
        }
    }

    /// Destroy the source without an error
    pub fn destroy(&self) -> &Self {
        self.destroy_with(None, None)
    }

    /// Destroy the source
    ///
    /// `error` is emitted when `err` is given and `close` follows on a later
    /// turn. Calls after the first only run `callback`.
    pub fn destroy_with(&self, err: Option<StreamError>, callback: Option<Callback>) -> &Self {
        {
            let mut state = self.state_mut();
            if state.destroyed {
                drop(state);
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
                return self;
            }
            if state.errored.is_none() {
                state.errored = err.clone();
            }
            state.destroyed = true;
            if !state.constructed {
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
        tracing::debug!(error = ?err, "destroying source");
        let source = self.clone();
        let done: Callback = Box::new(move |result| source.on_destroyed(result.err(), callback));
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
        self.defer(move |source| {
            if let Some(err) = err {
                source.emit_error_now(err);
            }
            source.emit_close_now();
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
            self.defer(move |source| source.emit_error_now(err));
        } else {
            self.emit_error_now(err);
        }
    }

    fn emit_error_now(&self, err: StreamError) {
        if self.inner.error_emitted.replace(true) {
            return;
        }
        if !self.inner.events.emit(events::ERROR, &Payload::Error(err.clone())) {
            tracing::warn!(error = %err, "unhandled source error");
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

    fn start_construct(&self, construct: ConstructFn<SourceStream>) {
        self.defer(move |source| {
            let handle = source.clone();
            let done: Callback = Box::new(move |result| {
                let err = result.err();
                handle.defer(move |source| source.on_construct(err));
            });
            construct(source, done);
        });
    }

    fn on_construct(&self, err: Option<StreamError>) {
        let (destroyed, pending, need_readable) = {
            let mut state = self.state_mut();
            state.constructed = true;
            (state.destroyed, state.pending_destroy.take(), state.need_readable)
        };

        if destroyed {
            if let Some(pending) = pending {
                self.run_destroy(err.or(pending.error), pending.callback);
            }
        } else if let Some(err) = err {
            tracing::debug!(error = %err, "source construct failed");
            self.error_or_destroy(err, true);
        } else if need_readable {
            self.maybe_read_more();
        }
    }

    /// Change the encoding used for pushed text without one
    pub fn set_default_encoding(&self, encoding: Encoding) -> &Self {
        self.state_mut().default_encoding = encoding;
        self
    }

    /// Check if `read` can still produce data
    pub fn readable(&self) -> bool {
        let state = self.state();
        !state.destroyed && state.errored.is_none() && !state.end_emitted
    }

    /// Units currently buffered
    pub fn readable_length(&self) -> usize {
        self.state().length
    }

    /// Flow mode: `None` until a consumer picks one
    pub fn readable_flowing(&self) -> Option<bool> {
        self.state().flowing
    }

    /// Check if `end` was emitted
    pub fn readable_ended(&self) -> bool {
        self.state().end_emitted
    }

    /// Current high-water mark, after any growth
    pub fn readable_high_water_mark(&self) -> usize {
        self.state().high_water_mark
    }

    /// Check if the source is in object mode
    pub fn readable_object_mode(&self) -> bool {
        self.state().object_mode
    }

    /// Check if the source was destroyed
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

    /// Destinations currently piped from this source
    pub fn pipe_count(&self) -> usize {
        self.state().pipes.len()
    }

    /// Snapshot of buffer and throughput counters
    pub fn stats(&self) -> SourceStats {
        self.state().stats()
    }
}

impl Emitter for SourceStream {
    fn events(&self) -> &EventRegistry<Payload> {
        &self.inner.events
    }

    fn on(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.inner.events.add(name, listener);
        self.on_listener_added(name);
        self
    }

    fn once(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.inner.events.once(name, listener);
        self.on_listener_added(name);
        self
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SourceStream")
            .field("length", &state.length)
            .field("flowing", &state.flowing)
            .field("reading", &state.reading)
            .field("ended", &state.ended)
            .field("end_emitted", &state.end_emitted)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Source whose read hook does nothing; tests push by hand
    fn manual_source(scheduler: &Scheduler, config: StreamConfig) -> SourceStream {
        SourceStream::new(scheduler, config, |_, _| {})
    }

    fn text(chunk: &Chunk) -> String {
        String::from_utf8_lossy(chunk.as_bytes().unwrap()).into_owned()
    }

    fn collect_data(source: &SourceStream) -> Log {
        let log: Log = Rc::default();
        let l = log.clone();
        source.on_data(move |chunk| l.borrow_mut().push(text(chunk)));
        log
    }

    fn record(source: &SourceStream, log: &Log, name: &'static str) {
        let log = log.clone();
        source.on_event(name, move |_| log.borrow_mut().push(name.to_string()));
    }

    #[test]
    fn test_buffered_until_data_listener() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());

        for chunk in ["aaaa", "bbbb", "cccc"] {
            source.push(Some(Chunk::from(chunk)));
        }
        scheduler.run_until_idle();
        assert_eq!(source.readable_length(), 12);
        assert_eq!(source.readable_flowing(), None);

        let log = collect_data(&source);
        assert_eq!(source.readable_flowing(), Some(true));
        // Nothing is emitted synchronously from `on`
        assert!(log.borrow().is_empty());

        scheduler.run_until_idle();
        assert_eq!(*log.borrow(), vec!["aaaa", "bbbb", "cccc"]);
        assert_eq!(source.readable_length(), 0);
    }

    #[test]
    fn test_direct_emission_while_flowing() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let log = collect_data(&source);
        scheduler.run_until_idle();

        source.push(Some(Chunk::from("now")));
        assert_eq!(*log.borrow(), vec!["now"]);
        assert_eq!(source.readable_length(), 0);
    }

    #[test]
    fn test_read_conserves_bytes() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let pushed = ["hello", " ", "streaming", " world", "!"];
        for chunk in pushed {
            source.push(Some(Chunk::from(chunk)));
        }
        source.push(None);

        let mut out = Vec::new();
        for n in [3, 1, 7, 2, 100] {
            if let Some(chunk) = source.read(Some(n)) {
                out.extend_from_slice(chunk.as_bytes().unwrap());
            }
        }
        assert_eq!(out, pushed.concat().into_bytes());
        assert_eq!(source.readable_length(), 0);
        assert_eq!(source.stats().units_delivered, out.len() as u64);
    }

    #[test]
    fn test_read_without_size() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        source.push(Some(Chunk::from("ab")));
        source.push(Some(Chunk::from("cd")));
        source.pause();

        let chunk = source.read(None).unwrap();
        assert_eq!(text(&chunk), "abcd");
        assert!(source.read(None).is_none());
    }

    #[test]
    fn test_read_grows_high_water_mark() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default().high_water_mark(16));
        source.read(Some(17));
        assert_eq!(source.readable_high_water_mark(), 32);
        source.read(Some(32));
        assert_eq!(source.readable_high_water_mark(), 32);
    }

    #[test]
    fn test_read_hook_refills_below_high_water_mark() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let source = SourceStream::new(
            &scheduler,
            StreamConfig::default().high_water_mark(8),
            move |source, size| {
                assert_eq!(size, 8);
                c.set(c.get() + 1);
                if c.get() <= 3 {
                    source.push(Some(Chunk::from("xyz")));
                } else {
                    source.push(None);
                }
            },
        );
        let log = collect_data(&source);
        let ended = Rc::new(Cell::new(false));
        let e = ended.clone();
        source.on_event(events::END, move |_| e.set(true));

        scheduler.run_until_idle();
        assert_eq!(log.borrow().concat(), "xyzxyzxyz");
        assert_eq!(calls.get(), 4);
        assert!(ended.get());
        assert!(source.destroyed());
    }

    #[test]
    fn test_push_returns_backpressure() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default().high_water_mark(4));
        assert!(source.push(Some(Chunk::from("ab"))));
        assert!(!source.push(Some(Chunk::from("cd"))));
        assert!(!source.push(None));
    }

    #[test]
    fn test_readable_then_end_ordering() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let log: Log = Rc::default();

        let reader = source.clone();
        let l = log.clone();
        source.on_event(events::READABLE, move |_| {
            l.borrow_mut().push("readable".to_string());
            while let Some(chunk) = reader.read(None) {
                l.borrow_mut().push(text(&chunk));
            }
        });
        record(&source, &log, events::END);
        record(&source, &log, events::CLOSE);
        assert_eq!(source.readable_flowing(), Some(false));

        source.push(Some(Chunk::from("abc")));
        source.push(None);
        scheduler.run_until_idle();

        let log = log.borrow();
        assert_eq!(log[0], "readable");
        assert_eq!(log[1], "abc");
        let end = log.iter().position(|entry| entry == "end").unwrap();
        assert_eq!(log.iter().filter(|entry| *entry == "end").count(), 1);
        assert!(end > 1);
        assert_eq!(log.last().unwrap(), "close");
    }

    #[test]
    fn test_end_emitted_once_after_drain() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let ends = Rc::new(Cell::new(0));
        let e = ends.clone();
        source.on_event(events::END, move |_| e.set(e.get() + 1));

        source.push(Some(Chunk::from("abc")));
        source.push(None);
        scheduler.run_until_idle();
        // Data still buffered: no `end` yet
        assert_eq!(ends.get(), 0);

        source.read(None);
        source.read(None);
        scheduler.run_until_idle();
        assert_eq!(ends.get(), 1);
        assert!(source.readable_ended());
    }

    #[test]
    fn test_push_after_eof_errors() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        source.on_error(move |err| e.borrow_mut().push(err.clone()));

        source.push(None);
        assert!(!source.push(Some(Chunk::from("late"))));
        scheduler.run_until_idle();

        assert_eq!(*errors.borrow(), vec![StreamError::PushAfterEof]);
        assert!(source.destroyed());
    }

    #[test]
    fn test_unshift_after_end_errors() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default().auto_destroy(false));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        source.on_error(move |err| e.borrow_mut().push(err.clone()));
        collect_data(&source);

        source.push(None);
        scheduler.run_until_idle();
        assert!(source.readable_ended());

        source.unshift(Some(Chunk::from("x")));
        scheduler.run_until_idle();
        assert_eq!(*errors.borrow(), vec![StreamError::UnshiftAfterEnd]);
    }

    #[test]
    fn test_unshift_puts_chunk_first() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        source.push(Some(Chunk::from("world")));
        source.unshift(Some(Chunk::from("hello ")));
        source.pause();

        assert_eq!(text(&source.read(None).unwrap()), "hello world");
    }

    #[test]
    fn test_empty_chunk_not_queued() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        assert!(source.push(Some(Chunk::from(""))));
        assert_eq!(source.readable_length(), 0);
        assert_eq!(source.stats().chunks_pushed, 0);
    }

    #[test]
    fn test_object_mode_reads_one_at_a_time() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::objects());
        source.push(Some(Chunk::object(1u32)));
        source.push(Some(Chunk::object(2u32)));
        assert_eq!(source.readable_length(), 2);

        let first = source.read(Some(100)).unwrap();
        assert_eq!(first.downcast_ref::<u32>(), Some(&1));
        let second = source.read(None).unwrap();
        assert_eq!(second.downcast_ref::<u32>(), Some(&2));
    }

    #[test]
    fn test_pause_and_resume_events() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let log: Log = Rc::default();
        record(&source, &log, events::PAUSE);
        record(&source, &log, events::RESUME);
        let data = collect_data(&source);
        scheduler.run_until_idle();

        source.pause();
        source.pause();
        assert!(source.is_paused());
        source.push(Some(Chunk::from("held")));
        scheduler.run_until_idle();
        assert!(data.borrow().is_empty());

        source.resume();
        assert!(!source.is_paused());
        scheduler.run_until_idle();
        assert_eq!(*data.borrow(), vec!["held"]);
        assert_eq!(*log.borrow(), vec!["resume", "pause", "resume"]);
    }

    #[test]
    fn test_removing_readable_listener_resumes_data() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let readable = source.on_event(events::READABLE, |_| {});
        let data = collect_data(&source);
        assert_eq!(source.readable_flowing(), Some(false));

        source.push(Some(Chunk::from("abc")));
        source.off(events::READABLE, &readable);
        scheduler.run_until_idle();

        assert_eq!(source.readable_flowing(), Some(true));
        assert_eq!(*data.borrow(), vec!["abc"]);
    }

    #[test]
    fn test_once_readable_listener_resets_flow_mode() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        source.once(events::READABLE, events::listener(|_| {}));
        source.push(Some(Chunk::from("abc")));

        scheduler.run_until_idle();
        assert_eq!(source.readable_flowing(), None);
        assert_eq!(source.readable_length(), 3);
    }

    #[test]
    fn test_once_data_listener_reentrant_push() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let inner = source.clone();
        source.once(
            events::DATA,
            events::listener(move |_| {
                c.set(c.get() + 1);
                // Re-enters `data` dispatch while the once-listener is running
                inner.push(Some(Chunk::from("again")));
            }),
        );
        scheduler.run_until_idle();

        source.push(Some(Chunk::from("first")));
        scheduler.run_until_idle();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_once_data_listener_fed_by_read_hook() {
        let scheduler = Scheduler::new();
        let produced = Rc::new(Cell::new(0));
        let p = produced.clone();
        let source = SourceStream::new(&scheduler, StreamConfig::default(), move |source, _| {
            let n = p.get() + 1;
            p.set(n);
            if n > 3 {
                source.push(None);
            } else {
                source.push(Some(Chunk::from(format!("c{n}"))));
            }
        });
        let once_calls: Log = Rc::default();
        let o = once_calls.clone();
        source.once(
            events::DATA,
            events::listener(move |payload: &Payload| {
                if let Some(chunk) = payload.chunk() {
                    o.borrow_mut().push(text(chunk));
                }
            }),
        );
        let log = collect_data(&source);
        let ended = Rc::new(Cell::new(false));
        let e = ended.clone();
        source.on_event(events::END, move |_| e.set(true));

        scheduler.run_until_idle();

        assert_eq!(*once_calls.borrow(), vec!["c1"]);
        assert_eq!(*log.borrow(), vec!["c1", "c2", "c3"]);
        assert_eq!(source.listener_count(events::DATA), 1);
        assert!(ended.get());
    }

    #[test]
    fn test_read_after_destroy_returns_buffered() {
        let scheduler = Scheduler::new();
        let reads = Rc::new(Cell::new(0));
        let r = reads.clone();
        let source = SourceStream::new(&scheduler, StreamConfig::default(), move |_, _| {
            r.set(r.get() + 1);
        });
        source.push(Some(Chunk::from("abc")));
        scheduler.run_until_idle();
        let before = reads.get();

        source.destroy();
        scheduler.run_until_idle();
        assert!(source.destroyed());
        // Destroy stops the read hook but leaves the buffer in place
        assert_eq!(source.read(None).as_ref().map(text), Some("abc".to_string()));
        assert_eq!(reads.get(), before);
        assert!(source.read(None).is_none());
    }

    #[test]
    fn test_invalid_chunk_destroys() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        source.on_error(move |err| e.borrow_mut().push(err.clone()));

        source.push(Some(Chunk::object("nope")));
        scheduler.run_until_idle();
        assert!(matches!(errors.borrow()[0], StreamError::InvalidChunk(_)));
    }

    #[test]
    fn test_construct_delays_first_read() {
        let scheduler = Scheduler::new();
        let log: Log = Rc::default();
        let (l1, l2) = (log.clone(), log.clone());
        let source = SourceStream::builder(&scheduler, move |source, _| {
            l1.borrow_mut().push("read".to_string());
            source.push(None);
        })
        .construct(move |_, done| {
            l2.borrow_mut().push("construct".to_string());
            done(Ok(()));
        })
        .build();

        assert!(source.read(Some(0)).is_none());
        assert!(log.borrow().is_empty());
        collect_data(&source);
        scheduler.run_until_idle();

        assert_eq!(log.borrow()[0], "construct");
        assert!(log.borrow().contains(&"read".to_string()));
    }

    #[test]
    fn test_destroy_emits_error_then_close_once() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        let log: Log = Rc::default();
        record(&source, &log, events::ERROR);
        record(&source, &log, events::CLOSE);

        let called = Rc::new(Cell::new(0));
        for _ in 0..2 {
            let c = called.clone();
            source.destroy_with(
                Some(StreamError::hook("gone")),
                Some(Box::new(move |_: crate::error::Result<()>| c.set(c.get() + 1))),
            );
        }
        scheduler.run_until_idle();

        assert_eq!(called.get(), 2);
        assert_eq!(*log.borrow(), vec!["error", "close"]);
        assert!(!source.push(Some(Chunk::from("x"))));
    }

    #[test]
    fn test_text_push_uses_encoding() {
        let scheduler = Scheduler::new();
        let source = manual_source(&scheduler, StreamConfig::default());
        source.push_with(Some(Chunk::from("0a0b")), Some(Encoding::Hex));
        source.pause();
        assert_eq!(source.read(None).unwrap().as_bytes().unwrap(), &[0x0A, 0x0B]);
    }

    #[tokio::test]
    async fn test_async_read_hook() {
        let local = tokio::task::LocalSet::new();
        let scheduler = Scheduler::new();

        let received = local
            .run_until(scheduler.run_until(async {
                let remaining = Rc::new(Cell::new(3u32));
                let source = SourceStream::new(
                    &scheduler,
                    StreamConfig::default(),
                    move |source, _| {
                        let source = source.clone();
                        let remaining = remaining.clone();
                        tokio::task::spawn_local(async move {
                            tokio::task::yield_now().await;
                            let left = remaining.get();
                            if left == 0 {
                                source.push(None);
                            } else {
                                remaining.set(left - 1);
                                source.push(Some(Chunk::from(format!("#{}", left))));
                            }
                        });
                    },
                );

                let (tx, rx) = tokio::sync::oneshot::channel();
                let tx = RefCell::new(Some(tx));
                let log = collect_data(&source);
                let l = log.clone();
                source.on_event(events::END, move |_| {
                    if let Some(tx) = tx.borrow_mut().take() {
                        let _ = tx.send(l.borrow().clone());
                    }
                });
                rx.await.unwrap()
            }))
            .await;

        assert_eq!(received, vec!["#3", "#2", "#1"]);
    }
}
