//! Duplex streams
//!
//! A [`DuplexStream`] pairs a [`SinkStream`] and a [`SourceStream`] that keep
//! independent state and lifecycles but share one event registry, so
//! listeners see a single stream.
//!
//! ```text
//!   write ──► sink half ──► write hook
//!                              (anything)
//!   read hook ──► push ──► source half ──► data / read
//! ```
//!
//! Only the source half emits `close`, and the halves share the guard that
//! keeps `error` from being emitted twice. A half that destroys itself on
//! error destroys the other half too.

use std::cell::Cell;
use std::rc::Rc;

use crate::chunk::{Chunk, Encoding};
use crate::config::DuplexConfig;
use crate::error::{Callback, StreamError};
use crate::events::{Emitter, EventRegistry, Listener, Payload};
use crate::scheduler::Scheduler;
use crate::sink::{AsSink, SinkBuilder, SinkStream};
use crate::source::{PipeOptions, SourceBuilder, SourceStream};

/// A sink and a source behind one identity
#[derive(Clone)]
pub struct DuplexStream {
    sink: SinkStream,
    source: SourceStream,
}

impl DuplexStream {
    /// Create a duplex from a write hook and a read hook
    pub fn new<W, R>(scheduler: &Scheduler, config: impl Into<DuplexConfig>, write: W, read: R) -> Self
    where
        W: Fn(&SinkStream, Chunk, Encoding, Callback) + 'static,
        R: Fn(&SourceStream, usize) + 'static,
    {
        let config = config.into();
        Self::from_builders(
            SinkStream::builder(scheduler, write).config(config.writable),
            SourceStream::builder(scheduler, read).config(config.readable),
        )
    }

    /// Create a duplex from fully configured halves
    pub fn from_builders(sink: SinkBuilder, source: SourceBuilder) -> Self {
        Self::assemble(source, move |_| sink)
    }

    /// Build the source half first so the sink half's hooks can refer to it
    pub(crate) fn assemble<F>(source: SourceBuilder, sink: F) -> Self
    where
        F: FnOnce(&SourceStream) -> SinkBuilder,
    {
        let events = EventRegistry::new();
        let error_emitted = Rc::new(Cell::new(false));

        let source = source
            .events(events.clone())
            .error_guard(error_emitted.clone())
            .build();
        let sink = sink(&source)
            .events(events)
            .error_guard(error_emitted)
            .suppress_close()
            .build();

        // An error in either half takes the whole duplex down
        let weak_source = source.downgrade();
        sink.set_peer(Rc::new(move |err: StreamError| {
            if let Some(source) = weak_source.upgrade() {
                source.destroy_with(Some(err), None);
            }
        }));
        let weak_sink = sink.downgrade();
        source.set_peer(Rc::new(move |err: StreamError| {
            if let Some(sink) = weak_sink.upgrade() {
                sink.destroy_with(Some(err), None);
            }
        }));
        Self { sink, source }
    }

    /// The writable half
    pub fn sink(&self) -> &SinkStream {
        &self.sink
    }

    /// The readable half
    pub fn source(&self) -> &SourceStream {
        &self.source
    }

    /// Check if two handles refer to the same duplex
    pub fn ptr_eq(&self, other: &DuplexStream) -> bool {
        self.sink.ptr_eq(&other.sink)
    }

    /// Write a chunk to the sink half
    pub fn write(&self, chunk: impl Into<Chunk>) -> bool {
        self.sink.write(chunk)
    }

    /// Write with an explicit encoding and completion callback
    pub fn write_with(&self, chunk: Chunk, encoding: Option<Encoding>, callback: Option<Callback>) -> bool {
        self.sink.write_with(chunk, encoding, callback)
    }

    pub fn cork(&self) -> &Self {
        self.sink.cork();
        self
    }

    pub fn uncork(&self) -> &Self {
        self.sink.uncork();
        self
    }

    /// End the sink half; the source half keeps its own lifecycle
    pub fn end(&self) -> &Self {
        self.sink.end();
        self
    }

    pub fn end_with(&self, chunk: Option<Chunk>, encoding: Option<Encoding>, callback: Option<Callback>) -> &Self {
        self.sink.end_with(chunk, encoding, callback);
        self
    }

    /// Push into the source half
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        self.source.push(chunk)
    }

    pub fn push_with(&self, chunk: Option<Chunk>, encoding: Option<Encoding>) -> bool {
        self.source.push_with(chunk, encoding)
    }

    pub fn unshift(&self, chunk: Option<Chunk>) -> bool {
        self.source.unshift(chunk)
    }

    /// Pull from the source half
    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        self.source.read(n)
    }

    pub fn pause(&self) -> &Self {
        self.source.pause();
        self
    }

    pub fn resume(&self) -> &Self {
        self.source.resume();
        self
    }

    pub fn is_paused(&self) -> bool {
        self.source.is_paused()
    }

    /// Pipe the source half into `dest`
    pub fn pipe<D: AsSink + Clone>(&self, dest: &D) -> D {
        self.source.pipe(dest)
    }

    pub fn pipe_with<D: AsSink + Clone>(&self, dest: &D, options: PipeOptions) -> D {
        self.source.pipe_with(dest, options)
    }

    pub fn unpipe(&self, dest: Option<&SinkStream>) -> &Self {
        self.source.unpipe(dest);
        self
    }

    /// Destroy both halves
    pub fn destroy(&self) -> &Self {
        self.destroy_with(None, None)
    }

    /// Destroy both halves; `callback` runs once the source half is closed
    pub fn destroy_with(&self, err: Option<StreamError>, callback: Option<Callback>) -> &Self {
        tracing::debug!(error = ?err, "destroying duplex");
        self.sink.destroy_with(err.clone(), None);
        self.source.destroy_with(err, callback);
        self
    }

    pub fn writable(&self) -> bool {
        self.sink.writable()
    }

    pub fn readable(&self) -> bool {
        self.source.readable()
    }

    pub fn writable_length(&self) -> usize {
        self.sink.writable_length()
    }

    pub fn readable_length(&self) -> usize {
        self.source.readable_length()
    }

    pub fn writable_finished(&self) -> bool {
        self.sink.writable_finished()
    }

    pub fn readable_ended(&self) -> bool {
        self.source.readable_ended()
    }

    pub fn readable_flowing(&self) -> Option<bool> {
        self.source.readable_flowing()
    }

    /// Check if both halves were destroyed
    ///
    /// The sink half destroys itself once it finishes, while buffered output
    /// may still be waiting in the source half.
    pub fn destroyed(&self) -> bool {
        self.sink.destroyed() && self.source.destroyed()
    }

    /// The first error recorded by either half
    pub fn errored(&self) -> Option<StreamError> {
        self.sink.errored().or_else(|| self.source.errored())
    }
}

impl AsSink for DuplexStream {
    fn as_sink(&self) -> &SinkStream {
        &self.sink
    }
}

impl Emitter for DuplexStream {
    fn events(&self) -> &EventRegistry<Payload> {
        self.source.events()
    }

    // `data` and `readable` listeners switch the source half's flow mode
    fn on(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.source.on(name, listener);
        self
    }

    fn once(&self, name: &str, listener: Listener<Payload>) -> &Self {
        self.source.once(name, listener);
        self
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("sink", &self.sink)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::config::StreamConfig;
    use crate::events;

    type Log = Rc<RefCell<Vec<String>>>;

    fn text(chunk: &Chunk) -> String {
        String::from_utf8_lossy(chunk.as_bytes().unwrap()).into_owned()
    }

    /// Duplex that records writes and never produces on its own
    fn echo_duplex(scheduler: &Scheduler) -> (DuplexStream, Log) {
        let written: Log = Rc::default();
        let w = written.clone();
        let duplex = DuplexStream::new(
            scheduler,
            StreamConfig::default(),
            move |_, chunk, _, cb| {
                w.borrow_mut().push(text(&chunk));
                cb(Ok(()));
            },
            |_, _| {},
        );
        (duplex, written)
    }

    fn record(duplex: &DuplexStream, log: &Log, name: &'static str) {
        let log = log.clone();
        duplex.on_event(name, move |_| log.borrow_mut().push(name.to_string()));
    }

    #[test]
    fn test_halves_are_independent() {
        let scheduler = Scheduler::new();
        let (duplex, written) = echo_duplex(&scheduler);
        let log: Log = Rc::default();
        for name in [events::FINISH, events::END, events::CLOSE] {
            record(&duplex, &log, name);
        }

        duplex.write("in");
        duplex.end();
        scheduler.run_until_idle();

        assert_eq!(*written.borrow(), vec!["in"]);
        assert!(duplex.writable_finished());
        assert!(!duplex.readable_ended());
        assert!(duplex.readable());
        // The sink half finished without closing the duplex
        assert_eq!(*log.borrow(), vec!["finish"]);

        let data: Log = Rc::default();
        let d = data.clone();
        duplex.on_data(move |chunk| d.borrow_mut().push(text(chunk)));
        duplex.push(Some(Chunk::from("out")));
        duplex.push(None);
        scheduler.run_until_idle();

        assert_eq!(*data.borrow(), vec!["out"]);
        assert_eq!(*log.borrow(), vec!["finish", "end", "close"]);
    }

    #[test]
    fn test_shared_registry() {
        let scheduler = Scheduler::new();
        let (duplex, _) = echo_duplex(&scheduler);
        let handle = duplex.on_event(events::DRAIN, |_| {});

        assert_eq!(duplex.sink().listener_count(events::DRAIN), 1);
        assert_eq!(duplex.source().listener_count(events::DRAIN), 1);
        duplex.off(events::DRAIN, &handle);
        assert_eq!(duplex.listener_count(events::DRAIN), 0);
    }

    #[test]
    fn test_data_listener_starts_flow() {
        let scheduler = Scheduler::new();
        let (duplex, _) = echo_duplex(&scheduler);
        duplex.on_data(|_| {});
        assert_eq!(duplex.readable_flowing(), Some(true));
    }

    #[test]
    fn test_destroy_emits_error_and_close_once() {
        let scheduler = Scheduler::new();
        let (duplex, _) = echo_duplex(&scheduler);
        let log: Log = Rc::default();
        record(&duplex, &log, events::ERROR);
        record(&duplex, &log, events::CLOSE);

        duplex.destroy_with(Some(StreamError::hook("reset")), None);
        duplex.destroy();
        scheduler.run_until_idle();

        assert_eq!(*log.borrow(), vec!["error", "close"]);
        assert!(duplex.sink().destroyed());
        assert!(duplex.source().destroyed());
        assert_eq!(duplex.errored(), Some(StreamError::hook("reset")));
    }

    #[test]
    fn test_write_error_surfaces_once() {
        let scheduler = Scheduler::new();
        let duplex = DuplexStream::new(
            &scheduler,
            StreamConfig::default(),
            |_, _, _, cb| cb(Err(StreamError::hook("broken"))),
            |_, _| {},
        );
        let errors = Rc::new(Cell::new(0));
        let e = errors.clone();
        duplex.on_error(move |_| e.set(e.get() + 1));

        duplex.write("x");
        duplex.source().destroy_with(Some(StreamError::hook("also")), None);
        scheduler.run_until_idle();
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn test_destroyed_waits_for_both_halves() {
        let scheduler = Scheduler::new();
        let (duplex, _) = echo_duplex(&scheduler);
        duplex.push(Some(Chunk::from("out")));
        duplex.write("in");
        duplex.end();
        scheduler.run_until_idle();

        // The finished sink half is gone, buffered output is not
        assert!(duplex.sink().destroyed());
        assert!(!duplex.destroyed());
        assert!(duplex.readable());
        assert_eq!(duplex.read(None).as_ref().map(text), Some("out".to_string()));
        assert!(!duplex.destroyed());

        duplex.push(None);
        assert!(duplex.read(None).is_none());
        scheduler.run_until_idle();
        assert!(duplex.readable_ended());
        assert!(duplex.destroyed());
    }

    #[test]
    fn test_write_error_destroys_both_halves() {
        let scheduler = Scheduler::new();
        let duplex = DuplexStream::new(
            &scheduler,
            StreamConfig::default(),
            |_, _, _, cb| cb(Err(StreamError::hook("broken"))),
            |_, _| {},
        );
        let log: Log = Rc::default();
        record(&duplex, &log, events::ERROR);
        record(&duplex, &log, events::CLOSE);

        duplex.write("x");
        scheduler.run_until_idle();

        assert!(duplex.sink().destroyed());
        assert!(duplex.source().destroyed());
        assert!(duplex.destroyed());
        assert_eq!(*log.borrow(), vec!["error", "close"]);
    }

    #[test]
    fn test_split_config() {
        let scheduler = Scheduler::new();
        let duplex = DuplexStream::new(
            &scheduler,
            DuplexConfig::split(StreamConfig::objects(), StreamConfig::default().high_water_mark(4)),
            |_, _, _, cb| cb(Ok(())),
            |_, _| {},
        );
        assert!(duplex.source().readable_object_mode());
        assert!(!duplex.sink().writable_object_mode());
        assert_eq!(duplex.sink().writable_high_water_mark(), 4);
        assert_eq!(duplex.source().readable_high_water_mark(), 16);
    }

    #[test]
    fn test_pipe_through_duplex() {
        let scheduler = Scheduler::new();
        let (duplex, written) = echo_duplex(&scheduler);
        let source = SourceStream::new(&scheduler, StreamConfig::default(), |_, _| {});

        let piped = source.pipe(&duplex);
        assert!(piped.ptr_eq(&duplex));
        source.push(Some(Chunk::from("a")));
        source.push(Some(Chunk::from("b")));
        source.push(None);
        scheduler.run_until_idle();

        assert_eq!(written.borrow().concat(), "ab");
        assert!(duplex.writable_finished());
    }
}
