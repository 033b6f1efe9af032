//! Piping a source into a sink
//!
//! ```text
//!   source `data` ──► dest.write ──false──► source.pause, wait for dest `drain`
//!   source `end`  ──► dest.end (unless PipeOptions::end is false)
//!   dest `close` / `finish` / `error` ──► unpipe
//! ```
//!
//! The wiring of one pipe lives in a [`PipeWiring`] owned by the source's
//! pipe list. Listeners on both streams only hold a weak reference to it, so
//! detaching a pipe drops every handler with it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::events::{self, Emitter, Listener, Payload};
use crate::sink::{AsSink, SinkStream};

use super::stream::{SourceStream, WeakSource};

/// Options for [`SourceStream::pipe_with`]
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl PipeOptions {
    /// Whether the destination is ended together with the source
    pub fn end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }
}

/// A destination in the source's pipe list
pub(crate) struct PipeLink {
    pub dest: SinkStream,
    pub wiring: Rc<PipeWiring>,
}

struct PipeListeners {
    data: Listener<Payload>,
    end: Listener<Payload>,
    unpipe: Listener<Payload>,
    error: Listener<Payload>,
    close: Listener<Payload>,
    finish: Listener<Payload>,
}

pub(crate) struct PipeWiring {
    source: WeakSource,
    dest: SinkStream,
    listeners: RefCell<Option<PipeListeners>>,
    on_drain: RefCell<Option<Listener<Payload>>>,
    cleaned_up: Cell<bool>,
}

/// Listener that forwards to `f` while the wiring is alive
fn handler<F>(wiring: &Rc<PipeWiring>, f: F) -> Listener<Payload>
where
    F: Fn(&Rc<PipeWiring>, &Payload) + 'static,
{
    let weak = Rc::downgrade(wiring);
    events::listener(move |payload| {
        if let Some(wiring) = weak.upgrade() {
            f(&wiring, payload);
        }
    })
}

impl PipeWiring {
    fn is_source(&self, source: &SourceStream) -> bool {
        self.source
            .upgrade()
            .is_some_and(|own| own.ptr_eq(source))
    }

    fn listener(&self, pick: impl Fn(&PipeListeners) -> &Listener<Payload>) -> Option<Listener<Payload>> {
        self.listeners.borrow().as_ref().map(|l| pick(l).clone())
    }

    fn unpipe(&self) {
        if let Some(source) = self.source.upgrade() {
            source.unpipe(Some(&self.dest));
        }
    }

    /// Stop the source until the destination drains
    fn pause(self: &Rc<Self>) {
        let Some(source) = self.source.upgrade() else {
            return;
        };
        if !self.cleaned_up.get() {
            {
                let mut state = source.state_mut();
                let piped = state.pipes.iter().any(|link| link.dest.ptr_eq(&self.dest));
                let waiting = state.await_drain.iter().any(|dest| dest.ptr_eq(&self.dest));
                if piped && !waiting {
                    state.await_drain.push(self.dest.clone());
                }
            }
            tracing::trace!("pipe destination full, pausing source");
            source.pause();
        }
        if self.on_drain.borrow().is_none() {
            let on_drain = handler(self, |wiring, _| wiring.drained());
            *self.on_drain.borrow_mut() = Some(on_drain.clone());
            self.dest.on(events::DRAIN, on_drain);
        }
    }

    fn drained(&self) {
        let Some(source) = self.source.upgrade() else {
            return;
        };
        let clear = {
            let mut state = source.state_mut();
            state.await_drain.retain(|dest| !dest.ptr_eq(&self.dest));
            state.await_drain.is_empty()
        };
        if clear && source.listener_count(events::DATA) > 0 {
            tracing::trace!("pipe destination drained, resuming source");
            source.resume();
            source.flow();
        }
    }

    /// Detach every handler this pipe installed
    fn cleanup(&self) {
        let listeners = self.listeners.borrow_mut().take();
        let on_drain = self.on_drain.borrow().clone();
        let source = self.source.upgrade();

        if let Some(listeners) = listeners {
            self.dest.off(events::CLOSE, &listeners.close);
            self.dest.off(events::FINISH, &listeners.finish);
            if let Some(on_drain) = &on_drain {
                self.dest.off(events::DRAIN, on_drain);
            }
            self.dest.off(events::ERROR, &listeners.error);
            self.dest.off(events::UNPIPE, &listeners.unpipe);
            if let Some(source) = &source {
                source.off(events::END, &listeners.end);
                source.off(events::DATA, &listeners.data);
            }
        }
        self.cleaned_up.set(true);

        // A destination removed while full must not keep the source paused
        if let (Some(on_drain), Some(source)) = (on_drain, source) {
            let waiting = !source.state().await_drain.is_empty();
            if waiting && self.dest.awaiting_drain() {
                on_drain(&Payload::Empty);
            }
        }
    }
}

impl SourceStream {
    /// Forward everything from this source into `dest`, ending it with the
    /// source
    ///
    /// Returns `dest` so pipes can be chained.
    pub fn pipe<D: AsSink + Clone>(&self, dest: &D) -> D {
        self.pipe_with(dest, PipeOptions::default())
    }

    /// Forward everything from this source into `dest`
    pub fn pipe_with<D: AsSink + Clone>(&self, dest: &D, options: PipeOptions) -> D {
        let sink = dest.as_sink().clone();
        let wiring = Rc::new(PipeWiring {
            source: self.downgrade(),
            dest: sink.clone(),
            listeners: RefCell::new(None),
            on_drain: RefCell::new(None),
            cleaned_up: Cell::new(false),
        });
        let pipes = {
            let mut state = self.state_mut();
            state.pipes.push(PipeLink {
                dest: sink.clone(),
                wiring: wiring.clone(),
            });
            state.pipes.len()
        };
        tracing::debug!(pipes, end = options.end, "pipe attached");

        let on_end = if options.end {
            handler(&wiring, |wiring, _| {
                wiring.dest.end();
            })
        } else {
            handler(&wiring, |wiring, _| wiring.unpipe())
        };
        let on_unpipe = handler(&wiring, |wiring, payload| {
            if let Payload::Unpipe { source, handled } = payload {
                if wiring.is_source(source) && !handled.replace(true) {
                    wiring.cleanup();
                }
            }
        });
        let on_data = handler(&wiring, |wiring, payload| {
            if let Some(chunk) = payload.chunk() {
                if !wiring.dest.write(chunk.clone()) {
                    wiring.pause();
                }
            }
        });
        let on_error = handler(&wiring, |wiring, payload| {
            wiring.unpipe();
            if let Some(on_error) = wiring.listener(|l| &l.error) {
                wiring.dest.off(events::ERROR, &on_error);
            }
            if wiring.dest.listener_count(events::ERROR) == 0 {
                if let Some(err) = payload.error() {
                    tracing::warn!(error = %err, "unhandled error on pipe destination");
                }
            }
        });
        let on_close = handler(&wiring, |wiring, _| {
            if let Some(on_finish) = wiring.listener(|l| &l.finish) {
                wiring.dest.off(events::FINISH, &on_finish);
            }
            wiring.unpipe();
        });
        let on_finish = handler(&wiring, |wiring, _| {
            if let Some(on_close) = wiring.listener(|l| &l.close) {
                wiring.dest.off(events::CLOSE, &on_close);
            }
            wiring.unpipe();
        });

        *wiring.listeners.borrow_mut() = Some(PipeListeners {
            data: on_data.clone(),
            end: on_end.clone(),
            unpipe: on_unpipe.clone(),
            error: on_error.clone(),
            close: on_close.clone(),
            finish: on_finish.clone(),
        });

        if self.state().end_emitted {
            self.defer(move |_| on_end(&Payload::Empty));
        } else {
            self.once(events::END, on_end);
        }
        sink.on(events::UNPIPE, on_unpipe);
        self.on(events::DATA, on_data);
        sink.events().prepend(events::ERROR, on_error);
        sink.once(events::CLOSE, on_close);
        sink.once(events::FINISH, on_finish);

        sink.emit(events::PIPE, &Payload::Source(self.clone()));

        if sink.writable_need_drain() {
            wiring.pause();
        } else if !self.state().is_flowing() {
            tracing::trace!("starting flow for pipe");
            self.resume();
        }
        dest.clone()
    }

    /// Detach `dest`, or every destination with `None`
    ///
    /// Each detached destination gets an `unpipe` event. The source is paused
    /// once no destinations remain.
    pub fn unpipe(&self, dest: Option<&SinkStream>) -> &Self {
        let removed: Vec<PipeLink> = {
            let mut state = self.state_mut();
            match dest {
                None => std::mem::take(&mut state.pipes),
                Some(dest) => state
                    .pipes
                    .iter()
                    .position(|link| link.dest.ptr_eq(dest))
                    .map(|index| vec![state.pipes.remove(index)])
                    .unwrap_or_default(),
            }
        };
        if removed.is_empty() {
            return self;
        }
        tracing::debug!(detached = removed.len(), "unpipe");

        if self.state().pipes.is_empty() {
            self.pause();
        }
        for link in &removed {
            link.dest.emit(
                events::UNPIPE,
                &Payload::Unpipe {
                    source: self.clone(),
                    handled: Rc::new(Cell::new(false)),
                },
            );
            // The destination may have dropped our `unpipe` listener
            if !link.wiring.cleaned_up.get() {
                link.wiring.cleanup();
            }
        }
        self
    }
}
