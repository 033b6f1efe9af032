//! Synchronous listener registry
//!
//! Listeners are `Rc<dyn Fn(&A)>`; their identity is the allocation they
//! point to, so the same `Rc` passed to `add` can later be passed to `remove`.
//!
//! Dispatch always iterates over a snapshot of the listener list. A listener
//! that adds or removes listeners (including itself) while an emit is in
//! progress only affects later emits.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A registered callback
pub type Listener<A> = Rc<dyn Fn(&A)>;

/// Callback invoked with the event name after a listener is removed
pub type RemovalObserver = Rc<dyn Fn(&str)>;

struct Entry<A: 'static> {
    callback: Listener<A>,
    /// The user's listener when `callback` is a once-wrapper
    origin: Option<Listener<A>>,
}

impl<A: 'static> Entry<A> {
    fn matches(&self, target: &Listener<A>) -> bool {
        Rc::ptr_eq(&self.callback, target)
            || self
                .origin
                .as_ref()
                .is_some_and(|origin| Rc::ptr_eq(origin, target))
    }
}

struct RegistryInner<A: 'static> {
    listeners: RefCell<HashMap<String, Vec<Entry<A>>>>,
    on_remove: RefCell<Option<RemovalObserver>>,
}

/// State shared between a once-wrapper and the registry
///
/// The wrapper is built before it knows its own identity, so the record
/// starts with `wrapper: None` and is filled in right after construction.
struct OnceRecord<A: 'static> {
    name: String,
    callback: Listener<A>,
    wrapper: RefCell<Option<Weak<dyn Fn(&A)>>>,
    fired: Cell<bool>,
}

/// Event name to ordered listener list
///
/// Cloning yields another handle to the same registry.
pub struct EventRegistry<A: 'static> {
    inner: Rc<RegistryInner<A>>,
}

impl<A: 'static> Clone for EventRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: 'static> Default for EventRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> EventRegistry<A> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                listeners: RefCell::new(HashMap::new()),
                on_remove: RefCell::new(None),
            }),
        }
    }

    /// Append a listener for `name`
    pub fn add(&self, name: &str, callback: Listener<A>) -> &Self {
        self.insert(name, Entry { callback, origin: None }, false);
        self
    }

    /// Insert a listener at the front of the list for `name`
    pub fn prepend(&self, name: &str, callback: Listener<A>) -> &Self {
        self.insert(name, Entry { callback, origin: None }, true);
        self
    }

    /// Register a listener that removes itself before its first call
    pub fn once(&self, name: &str, callback: Listener<A>) -> &Self {
        let record = Rc::new(OnceRecord {
            name: name.to_string(),
            callback: callback.clone(),
            wrapper: RefCell::new(None),
            fired: Cell::new(false),
        });

        let registry = Rc::downgrade(&self.inner);
        let handle = record.clone();
        let wrapper: Listener<A> = Rc::new(move |args: &A| {
            // An older snapshot may still hold the wrapper during reentrant emits
            if handle.fired.replace(true) {
                return;
            }
            let wrapper = handle.wrapper.borrow().as_ref().and_then(Weak::upgrade);
            if let (Some(inner), Some(wrapper)) = (registry.upgrade(), wrapper) {
                EventRegistry { inner }.remove(&handle.name, &wrapper);
            }
            (handle.callback)(args);
        });
        *record.wrapper.borrow_mut() = Some(Rc::downgrade(&wrapper));

        self.insert(
            name,
            Entry {
                callback: wrapper,
                origin: Some(callback),
            },
            false,
        );
        self
    }

    fn insert(&self, name: &str, entry: Entry<A>, front: bool) {
        let mut listeners = self.inner.listeners.borrow_mut();
        let list = listeners.entry(name.to_string()).or_default();
        if front {
            list.insert(0, entry);
        } else {
            list.push(entry);
        }
    }

    /// Remove the most recently added match for `callback`
    ///
    /// A once-wrapper matches either its own identity or the listener it
    /// wraps. At most one entry is removed per call.
    pub fn remove(&self, name: &str, callback: &Listener<A>) -> &Self {
        let removed = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let Some(list) = listeners.get_mut(name) else {
                return self;
            };
            let position = list.iter().rposition(|entry| entry.matches(callback));
            if let Some(position) = position {
                list.remove(position);
                if list.is_empty() {
                    listeners.remove(name);
                }
            }
            position.is_some()
        };
        if removed {
            self.notify_removed(name);
        }
        self
    }

    /// Remove every listener for `name`, or for all names
    pub fn remove_all(&self, name: Option<&str>) -> &Self {
        let removed: Vec<String> = {
            let mut listeners = self.inner.listeners.borrow_mut();
            match name {
                Some(name) => listeners
                    .remove(name)
                    .map(|_| vec![name.to_string()])
                    .unwrap_or_default(),
                None => listeners.drain().map(|(name, _)| name).collect(),
            }
        };
        for name in removed {
            self.notify_removed(&name);
        }
        self
    }

    /// Call every listener for `name` with `args`
    ///
    /// Returns true if at least one listener was registered.
    pub fn emit(&self, name: &str, args: &A) -> bool {
        let snapshot: Vec<Listener<A>> = {
            let listeners = self.inner.listeners.borrow();
            match listeners.get(name) {
                Some(list) => list.iter().map(|entry| entry.callback.clone()).collect(),
                None => return false,
            }
        };
        for callback in &snapshot {
            callback(args);
        }
        true
    }

    /// Number of listeners for `name`
    pub fn count(&self, name: &str) -> usize {
        self.inner
            .listeners
            .borrow()
            .get(name)
            .map_or(0, |list| list.len())
    }

    /// Names with at least one listener
    pub fn names(&self) -> Vec<String> {
        self.inner.listeners.borrow().keys().cloned().collect()
    }

    /// Listeners for `name`, unwrapping once-wrappers
    pub fn listeners(&self, name: &str) -> Vec<Listener<A>> {
        self.inner
            .listeners
            .borrow()
            .get(name)
            .map(|list| {
                list.iter()
                    .map(|entry| entry.origin.clone().unwrap_or_else(|| entry.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Install a callback run after any listener removal
    pub(crate) fn observe_removals(&self, observer: RemovalObserver) {
        *self.inner.on_remove.borrow_mut() = Some(observer);
    }

    fn notify_removed(&self, name: &str) {
        let observer = self.inner.on_remove.borrow().clone();
        if let Some(observer) = observer {
            observer(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &str) -> Listener<u32> {
        let log = log.clone();
        let tag = tag.to_string();
        Rc::new(move |value: &u32| log.borrow_mut().push(format!("{}:{}", tag, value)))
    }

    #[test]
    fn test_emit_in_insertion_order() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        registry
            .add("data", recorder(&log, "a"))
            .add("data", recorder(&log, "b"));

        assert!(registry.emit("data", &1));
        assert!(!registry.emit("other", &1));
        assert_eq!(*log.borrow(), vec!["a:1", "b:1"]);
        assert_eq!(registry.count("data"), 2);
    }

    #[test]
    fn test_prepend_runs_first() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        registry.add("x", recorder(&log, "late"));
        registry.prepend("x", recorder(&log, "early"));
        registry.emit("x", &0);

        assert_eq!(*log.borrow(), vec!["early:0", "late:0"]);
    }

    #[test]
    fn test_remove_duplicates_one_at_a_time() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let listener = recorder(&log, "dup");

        registry.add("x", listener.clone()).add("x", listener.clone());
        assert_eq!(registry.count("x"), 2);

        registry.remove("x", &listener);
        assert_eq!(registry.count("x"), 1);

        registry.remove("x", &listener);
        assert_eq!(registry.count("x"), 0);
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_remove_takes_most_recent_match() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");

        registry.add("x", a.clone()).add("x", b).add("x", a.clone());
        registry.remove("x", &a);
        registry.emit("x", &2);

        assert_eq!(*log.borrow(), vec!["a:2", "b:2"]);
    }

    #[test]
    fn test_once_fires_once() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        registry.once("x", recorder(&log, "once"));
        registry.emit("x", &1);
        registry.emit("x", &2);

        assert_eq!(*log.borrow(), vec!["once:1"]);
        assert_eq!(registry.count("x"), 0);
    }

    #[test]
    fn test_once_removable_by_original_identity() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let listener = recorder(&log, "once");

        registry.once("x", listener.clone());
        assert_eq!(registry.count("x"), 1);
        assert!(Rc::ptr_eq(&registry.listeners("x")[0], &listener));

        registry.remove("x", &listener);
        registry.emit("x", &1);

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_once_reentrant_emit_fires_once() {
        let registry: EventRegistry<u32> = EventRegistry::new();
        let calls = Rc::new(Cell::new(0));

        // First listener re-emits the same event while the once-listener is
        // still in the outer snapshot.
        let reg = registry.clone();
        let reentered = Rc::new(Cell::new(false));
        registry.add(
            "x",
            Rc::new(move |_: &u32| {
                if !reentered.replace(true) {
                    reg.emit("x", &2);
                }
            }),
        );
        let counter = calls.clone();
        registry.once("x", Rc::new(move |_: &u32| counter.set(counter.get() + 1)));

        registry.emit("x", &1);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_once_listener_reemitting_itself() {
        let registry: EventRegistry<u32> = EventRegistry::new();
        let calls = Rc::new(Cell::new(0));

        let reg = registry.clone();
        let counter = calls.clone();
        registry.once(
            "x",
            Rc::new(move |_: &u32| {
                counter.set(counter.get() + 1);
                reg.emit("x", &0);
            }),
        );

        registry.emit("x", &0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_remove_during_emit_uses_snapshot() {
        let registry: EventRegistry<u32> = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let victim = recorder(&log, "victim");

        let reg = registry.clone();
        let target = victim.clone();
        registry.add(
            "x",
            Rc::new(move |_: &u32| {
                reg.remove("x", &target);
            }),
        );
        registry.add("x", victim);

        // Removal does not affect the in-flight dispatch...
        registry.emit("x", &1);
        assert_eq!(*log.borrow(), vec!["victim:1"]);

        // ...but applies to the next one
        registry.emit("x", &2);
        assert_eq!(*log.borrow(), vec!["victim:1"]);
    }

    #[test]
    fn test_add_during_emit_waits_for_next_emit() {
        let registry: EventRegistry<u32> = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let reg = registry.clone();
        let late = recorder(&log, "late");
        registry.once(
            "x",
            Rc::new(move |_: &u32| {
                reg.add("x", late.clone());
            }),
        );

        registry.emit("x", &1);
        assert!(log.borrow().is_empty());
        registry.emit("x", &2);
        assert_eq!(*log.borrow(), vec!["late:2"]);
    }

    #[test]
    fn test_remove_all() {
        let registry = EventRegistry::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        registry
            .add("a", recorder(&log, "a"))
            .add("b", recorder(&log, "b"))
            .add("b", recorder(&log, "b2"));

        registry.remove_all(Some("b"));
        assert_eq!(registry.count("b"), 0);
        assert_eq!(registry.count("a"), 1);

        registry.remove_all(None);
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_removal_observer() {
        let registry = EventRegistry::new();
        let removed = Rc::new(RefCell::new(Vec::new()));
        let sink = removed.clone();
        registry.observe_removals(Rc::new(move |name: &str| {
            sink.borrow_mut().push(name.to_string())
        }));

        let log = Rc::new(RefCell::new(Vec::new()));
        registry.once("readable", recorder(&log, "r"));
        registry.emit("readable", &0);

        // Missing listeners do not notify
        registry.remove("readable", &recorder(&log, "other"));

        assert_eq!(*removed.borrow(), vec!["readable"]);
    }
}
