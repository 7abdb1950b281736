//! Single-threaded executor collaborator.
//!
//! The distilled specification treats the event loop as an external
//! collaborator with a narrow contract: FIFO dispatch, single-threaded
//! execution, `spawn(..) -> promise`, and a deadlock report when nothing can
//! make progress. This module is the minimal implementation of that contract,
//! modeled on the teacher's `runtime::mod::RuntimeState`: a thread-local
//! runtime, a `slab::Slab` of boxed futures standing in for its
//! `fibers: slab::Slab<FiberState>`, and a `VecDeque` ready queue drained in
//! FIFO order standing in for its `ready_fibers`.
//!
//! Everything above this module (`cancel`, `switch`, `fibre`, the
//! combinators) is written against [`spawn`] and [`block_on`] only — it does
//! not know or care that futures are how fibres happen to be encoded here.

mod tls;

use crate::promise::{self, Promise};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Tuning knobs for a [`block_on`] run.
///
/// The teacher's `RuntimeState` preallocates neither its slab nor its ready
/// queue; this adds the one knob worth exposing once the io_uring-specific
/// submission-queue configuration the teacher carries alongside them is gone.
#[derive(Debug, Clone)]
pub struct Config {
    /// Preallocated capacity for the ready queue and task slab.
    pub ready_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ready_queue_capacity: 64,
        }
    }
}

/// A spawned task's future, boxed in its own `Rc<RefCell<_>>` cell rather
/// than stored bare in the slab. Polling only ever borrows this per-task
/// cell, never the runtime-level slab itself — so a fibre that spawns more
/// fibres from inside its own poll (every combinator does this) never
/// re-enters an already-borrowed `RefCell` and never holds a pointer that a
/// slab reallocation could invalidate.
type Task = Rc<RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>>;

pub(crate) struct Runtime {
    tasks: slab::Slab<Task>,
    ready: VecDeque<usize>,
}

impl Runtime {
    fn with_config(config: &Config) -> Self {
        Runtime {
            tasks: slab::Slab::with_capacity(config.ready_queue_capacity),
            ready: VecDeque::with_capacity(config.ready_queue_capacity),
        }
    }

    fn schedule(&mut self, key: usize) {
        if self.tasks.contains(key) {
            self.ready.push_back(key);
        }
    }
}

/// Spawns a future onto the current thread's runtime, returning a
/// [`Promise`] fulfilled with its output.
///
/// Panics if called outside [`block_on`].
pub fn spawn<F>(future: F) -> Promise<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let (promise, resolver) = promise::create();

    spawn_detached(async move {
        let value = future.await;
        resolver.fulfill(value);
    });

    promise
}

/// Spawns a future whose output nobody awaits. Polls it once, synchronously,
/// before returning — combinators like `fork_sub_ignore` rely on a spawned
/// fibre having run up to its first suspension point by the time the spawn
/// call returns.
pub(crate) fn spawn_detached(future: impl Future<Output = ()> + 'static) {
    let cell: Task = Rc::new(RefCell::new(Some(Box::pin(future))));
    let key = tls::runtime(|rt| rt.tasks.insert(cell));
    poll_task(key);
}

fn waker_for(key: usize) -> std::task::Waker {
    waker_fn::waker_fn(move || {
        if tls::is_active() {
            tls::runtime(|rt| rt.schedule(key));
        }
    })
}

/// Polls the task at `key` exactly once. Returns `true` if it completed.
///
/// Clones the per-task `Rc` out of the runtime-level slab and releases that
/// borrow *before* calling `poll` — the polled future is free to spawn more
/// fibres (and so re-enter the runtime-level slab) without tripping the
/// `RefCell`'s reentrancy check.
fn poll_task(key: usize) -> bool {
    let Some(cell) = tls::runtime(|rt| rt.tasks.get(key).cloned()) else {
        return false;
    };

    let mut slot = cell.borrow_mut();
    let Some(task) = slot.as_mut() else {
        return false;
    };

    let waker = waker_for(key);
    let mut cx = Context::from_waker(&waker);
    let ready = task.as_mut().poll(&mut cx).is_ready();

    if ready {
        *slot = None;
    }
    drop(slot);

    if ready {
        tls::runtime(|rt| rt.tasks.remove(key));
    }

    ready
}

/// Runs `future` to completion on a fresh runtime, processing any fibres it
/// spawns along the way. Panics if nested inside another `block_on`, and
/// panics with a deadlock diagnostic if the ready queue empties out before
/// `future` completes.
pub fn block_on<T: 'static>(future: impl Future<Output = T> + 'static) -> T {
    block_on_with_config(future, &Config::default())
}

/// [`block_on`], with explicit [`Config`].
pub fn block_on_with_config<T: 'static>(
    future: impl Future<Output = T> + 'static,
    config: &Config,
) -> T {
    let output: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let output_slot = output.clone();

    tls::exclusive_runtime_with_config(config, || {
        spawn_detached(async move {
            let value = future.await;
            *output_slot.borrow_mut() = Some(value);
        });

        loop {
            if output.borrow().is_some() {
                break;
            }

            let Some(key) = tls::runtime(|rt| rt.ready.pop_front()) else {
                let pending = tls::runtime(|rt| rt.tasks.len());
                panic!(
                    "switchy::rt deadlock: no runnable fibre and {pending} fibre(s) still pending"
                );
            };

            poll_task(key);
        }
    });

    Rc::try_unwrap(output)
        .unwrap_or_else(|_| unreachable!("root future's output slot is still shared after completion"))
        .into_inner()
        .expect("root future completed without producing output")
}
