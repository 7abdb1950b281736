//! Intrusive, slab-backed list of suspended wakers.
//!
//! Grounded on the teacher's `sync::notify::Notify` (a `VecDeque` of
//! one-shot waiters), generalized to support O(1) removal by handle — needed
//! because cancel hooks are frequently registered and then deregistered
//! without ever firing (distilled spec §4.2, §8 "Hook removal").

use std::task::Waker;

/// Opaque handle returned by [`WaiterList::add`]. Removing it is always safe,
/// even after the waiter already fired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaiterHandle(usize);

/// An intrusive list of parked wakers, fired most-recently-added first.
///
/// The slab gives O(1) add/remove by key; a side `order` vector tracks
/// insertion order so [`fire_all`](Self::fire_all) can drain LIFO — slab key
/// reuse order is not a reliable proxy for recency, so this list is kept
/// explicitly rather than derived from the slab's own iteration order.
#[derive(Debug, Default)]
pub struct WaiterList {
    wakers: slab::Slab<Waker>,
    order: Vec<usize>,
}

impl WaiterList {
    pub fn new() -> Self {
        WaiterList {
            wakers: slab::Slab::new(),
            order: Vec::new(),
        }
    }

    /// Registers `waker`, returning a handle that can later be used to
    /// remove it before it fires.
    pub fn add(&mut self, waker: Waker) -> WaiterHandle {
        let key = self.wakers.insert(waker);
        self.order.push(key);
        WaiterHandle(key)
    }

    /// Removes a waiter before it fires. A no-op if it already fired or was
    /// already removed.
    pub fn remove(&mut self, handle: WaiterHandle) {
        self.wakers.try_remove(handle.0);
        // `order` is left with a stale entry; `fire_all` skips missing keys.
    }

    /// Wakes every still-registered waiter, most-recently-added first, then
    /// clears the list.
    pub fn fire_all(&mut self) {
        while let Some(key) = self.order.pop() {
            if let Some(waker) = self.wakers.try_remove(key) {
                waker.wake();
            }
        }
    }

    /// `true` if no waiters are currently registered.
    pub fn is_empty(&self) -> bool {
        self.wakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_waker(log: Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Waker {
        struct Wake(Rc<RefCell<Vec<&'static str>>>, &'static str);

        impl std::task::Wake for Wake {
            fn wake(self: Rc<Self>) {
                self.0.borrow_mut().push(self.1);
            }
        }

        Waker::from(Rc::new(Wake(log, name)))
    }

    mod fire_all {
        use super::*;

        #[test]
        fn fires_in_reverse_registration_order() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut list = WaiterList::new();

            list.add(recording_waker(log.clone(), "first"));
            list.add(recording_waker(log.clone(), "second"));
            list.add(recording_waker(log.clone(), "third"));

            list.fire_all();

            assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
        }

        #[test]
        fn empties_the_list() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut list = WaiterList::new();

            list.add(recording_waker(log.clone(), "only"));
            list.fire_all();

            assert!(list.is_empty());
        }

        #[test]
        fn later_added_hook_runs_before_earlier_survivor() {
            // distilled spec §8: removing an earlier hook, then adding a later
            // one, the later one still fires before any earlier survivor.
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut list = WaiterList::new();

            let first = list.add(recording_waker(log.clone(), "first"));
            let second = list.add(recording_waker(log.clone(), "second"));
            list.remove(first);
            let third = list.add(recording_waker(log.clone(), "third"));
            let _ = third;

            list.fire_all();

            assert_eq!(*log.borrow(), vec!["third", "second"]);
        }
    }

    mod remove {
        use super::*;

        #[test]
        fn prevents_the_hook_from_running() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut list = WaiterList::new();

            let handle = list.add(recording_waker(log.clone(), "removed"));
            list.remove(handle);
            list.fire_all();

            assert!(log.borrow().is_empty());
        }

        #[test]
        fn is_a_no_op_after_the_waiter_already_fired() {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut list = WaiterList::new();

            let handle = list.add(recording_waker(log.clone(), "fired"));
            list.fire_all();
            list.remove(handle); // shouldn't panic

            assert_eq!(*log.borrow(), vec!["fired"]);
        }
    }
}
