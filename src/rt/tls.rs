//! Abstraction over thread local storage.
//!
//! Mirrors the teacher's `runtime::tls` module: a single thread gets a single
//! [`super::Runtime`] for the lifetime of [`super::block_on`], and every other
//! `rt` function reaches it through this accessor instead of threading it
//! explicitly through every call site.

use std::cell::RefCell;

thread_local! {
    /// Each thread gets its own independent runtime.
    static RUNTIME: RefCell<Option<super::Runtime>> = RefCell::new(None);
}

/// Provides a runtime for the duration of the closure, sized by `config`.
/// Panics if a runtime is already active on this thread (nested `block_on` is
/// forbidden).
pub(super) fn exclusive_runtime_with_config<T>(config: &super::Config, f: impl FnOnce() -> T) -> T {
    RUNTIME.with(|cell| {
        let mut cell = cell.borrow_mut();
        assert!(cell.is_none(), "nested switchy::rt::block_on is forbidden");
        *cell = Some(super::Runtime::with_config(config));
    });

    let output = f();

    RUNTIME.with(|cell| {
        *cell.borrow_mut() = None;
    });

    output
}

/// Runs a closure that's given a reference to the active [`super::Runtime`].
///
/// Panics if called outside [`exclusive_runtime`].
pub(crate) fn runtime<T>(f: impl FnOnce(&mut super::Runtime) -> T) -> T {
    RUNTIME.with(|cell| {
        let mut cell = cell.borrow_mut();
        let runtime = cell
            .as_mut()
            .expect("no switchy runtime on this thread — call from inside rt::block_on");
        f(runtime)
    })
}

/// `true` while a runtime is active on this thread.
pub(crate) fn is_active() -> bool {
    RUNTIME.with(|cell| cell.borrow().is_some())
}
