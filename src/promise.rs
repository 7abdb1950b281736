//! Value-or-error cell used as the return type of `fork` and internally by
//! every combinator that needs to wait on a spawned fibre.
//!
//! Modeled directly on the teacher's `sync::oneshot_notify`/`sync::oneshot_channel`
//! state machines: a single `Rc<RefCell<State<T>>>` shared between a
//! single-use [`Resolver`] and a single-use [`Promise`].

use crate::cancel::{self, CancelId};
use crate::error::Error;
use crate::fibre;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Creates a linked [`Promise`]/[`Resolver`] pair.
pub fn create<T>() -> (Promise<T>, Resolver<T>) {
    let state = Rc::new(RefCell::new(State::Pending(None)));
    (
        Promise {
            state: state.clone(),
            cancel_ctx: None,
        },
        Resolver(state),
    )
}

enum State<T> {
    Pending(Option<Waker>),
    Fulfilled(T),
    Broken(Error),
    /// The value has already been handed to an awaiter.
    Taken,
}

/// The writer half of a [`create`] pair. Single use: [`fulfill`](Resolver::fulfill)
/// and [`break_`](Resolver::break_) both consume it.
pub struct Resolver<T>(Rc<RefCell<State<T>>>);

impl<T> Resolver<T> {
    /// Resolves the promise with a value, waking its awaiter if one is parked.
    pub fn fulfill(self, value: T) {
        let waker = {
            let mut state = self.0.borrow_mut();
            let previous = std::mem::replace(&mut *state, State::Fulfilled(value));
            match previous {
                State::Pending(waker) => waker,
                _ => unreachable!("Promise resolved twice"),
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Resolves the promise with a failure, waking its awaiter if one is parked.
    pub fn break_(self, error: Error) {
        let waker = {
            let mut state = self.0.borrow_mut();
            let previous = std::mem::replace(&mut *state, State::Broken(error));
            match previous {
                State::Pending(waker) => waker,
                _ => unreachable!("Promise resolved twice"),
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The reader half of a [`create`] pair.
///
/// `Promise<T>` implements [`Future<Output = Result<T, Error>>`]; awaiting it
/// is the distilled spec's `await_result` (never panics, always yields a
/// `Result`). Combinator code that wants `await`'s "raise on failure"
/// semantics simply writes `promise.await?`.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
    /// The context a cancel callback is installed on, if any. Cleared
    /// whenever this promise settles, so the context's single cancel-fn
    /// slot is freed for the next thing that suspends on it.
    cancel_ctx: Option<CancelId>,
}

impl<T> Future for Promise<T> {
    type Output = Result<T, Error>;

    /// Awaiting a bare `Promise` is itself a cancellation point: on every
    /// poll, if the current fibre has a `CancelId` (there isn't always
    /// one — a promise can be awaited directly from the root future passed
    /// to `rt::block_on`), it's checked first, and a cancel callback is
    /// installed so a cancel arriving while still pending wakes this
    /// promise instead of leaving it parked until its own `Resolver` fires.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(ctx) = this.cancel_ctx.or_else(fibre::try_current) {
            if let Err(err) = cancel::check(ctx) {
                this.cancel_ctx = None;
                return Poll::Ready(Err(err));
            }
            if this.cancel_ctx.is_none() {
                cancel::install_cancel_fn(ctx, cx.waker().clone());
                this.cancel_ctx = Some(ctx);
            }
        }

        let mut state = this.state.borrow_mut();

        match &mut *state {
            State::Pending(waker_slot) => {
                *waker_slot = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Fulfilled(_) | State::Broken(_) => {
                let result = match std::mem::replace(&mut *state, State::Taken) {
                    State::Fulfilled(value) => Ok(value),
                    State::Broken(error) => Err(error),
                    _ => unreachable!(),
                };
                drop(state);
                if let Some(ctx) = this.cancel_ctx.take() {
                    cancel::clear_cancel_fn(ctx);
                }
                Poll::Ready(result)
            }
            State::Taken => panic!("Promise polled after it already completed"),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match &*self.state.borrow() {
            State::Pending(_) => "Pending",
            State::Fulfilled(_) => "Fulfilled",
            State::Broken(_) => "Broken",
            State::Taken => "Taken",
        };
        f.debug_tuple("Promise").field(&label).finish()
    }
}
