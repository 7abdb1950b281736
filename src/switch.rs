//! Scoped supervisor: tracks in-flight work, collects release actions, and
//! guarantees every child fibre has finished before the owning scope
//! returns.
//!
//! `Rc<RefCell<State>>`, the same single-threaded shared-mutable-state shape
//! the teacher uses throughout `sync` for its channel/notify state machines.

use crate::cancel::{self, CancelId};
use crate::error::Error;
use crate::waiters::{WaiterHandle, WaiterList};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum Lifecycle {
    On,
    TurningOff(Error),
    Off,
}

struct State {
    cancel_ctx: CancelId,
    op_count: usize,
    lifecycle: Lifecycle,
    release_handlers: Vec<Box<dyn FnOnce() -> Result<(), Error>>>,
    cancel_hooks: WaiterList,
    op_count_waiters: WaiterList,
}

/// A scoped supervisor. Cheap to clone — every clone shares the same
/// underlying state, mirroring how fibres spawned under a switch all hold
/// onto the same supervisor.
pub struct Switch(Rc<RefCell<State>>);

impl Clone for Switch {
    fn clone(&self) -> Self {
        Switch(self.0.clone())
    }
}

impl Switch {
    /// The cancellation context every fibre spawned under this switch runs
    /// under.
    pub fn cancel_ctx(&self) -> CancelId {
        self.0.borrow().cancel_ctx
    }

    /// Creates a switch with a fresh root cancellation context, runs `body`,
    /// then [`finish`](Self::finish)es — waiting for outstanding ops,
    /// running release handlers, and propagating any stored failure.
    pub async fn run<T, Fut>(body: impl FnOnce(Switch) -> Fut) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        Self::run_under(cancel::make(None), body).await
    }

    /// Creates a switch whose cancellation context is a child of `parent`'s,
    /// runs `body`, and reports any non-`Cancelled` failure to `on_error`.
    /// `Cancelled` propagates transparently (the parent already knows — it's
    /// the one that cancelled it). If `on_error` itself raises `ex2`, `parent`
    /// is turned off with both errors combined.
    ///
    /// Checks `parent` is still live before creating the child context —
    /// `parent`'s `CancelId` is freed the instant it finishes, and creating a
    /// context under a freed one panics. A `parent` observed as already
    /// finished raises its own stored failure here instead, and `body` never
    /// runs.
    pub async fn sub<T, Fut>(
        parent: &Switch,
        on_error: impl FnOnce(Error) -> Result<(), Error>,
        body: impl FnOnce(Switch) -> Fut,
    ) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        parent.check()?;

        let result = Self::run_under(cancel::make(Some(parent.cancel_ctx())), body).await;

        if let Err(err) = &result {
            if !err.is_cancelled() {
                if let Err(ex2) = on_error(err.clone()) {
                    parent.turn_off(err.clone().combine(ex2));
                }
            }
        }

        result
    }

    async fn run_under<T, Fut>(cancel_ctx: CancelId, body: impl FnOnce(Switch) -> Fut) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        let switch = Switch(Rc::new(RefCell::new(State {
            cancel_ctx,
            op_count: 0,
            lifecycle: Lifecycle::On,
            release_handlers: Vec::new(),
            cancel_hooks: WaiterList::new(),
            op_count_waiters: WaiterList::new(),
        })));

        let result = body(switch.clone()).await;
        switch.finish(result).await
    }

    /// Raises `SwitchFinished` if `Off`; raises the stored exception
    /// (`Cancelled` stripped to its cause) if `TurningOff`; otherwise a
    /// no-op.
    pub fn check(&self) -> Result<(), Error> {
        match &self.0.borrow().lifecycle {
            Lifecycle::Off => Err(Error::SwitchFinished),
            Lifecycle::TurningOff(err) => Err(err.clone().strip_cancelled()),
            Lifecycle::On => Ok(()),
        }
    }

    /// Increments the op counter, runs `f`, decrements on every exit path.
    /// The increment itself fails with `SwitchFinished` once the switch is
    /// no longer `On` — a switch that's already turning off doesn't accept
    /// new work either.
    pub async fn with_op<T, Fut>(&self, f: impl FnOnce() -> Fut) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        {
            let mut state = self.0.borrow_mut();
            match state.lifecycle {
                Lifecycle::On => state.op_count += 1,
                _ => return Err(Error::SwitchFinished),
            }
        }

        let result = f().await;
        self.dec_op();
        result
    }

    fn dec_op(&self) {
        let reached_zero = {
            let mut state = self.0.borrow_mut();
            state.op_count -= 1;
            state.op_count == 0
        };

        if reached_zero {
            self.0.borrow_mut().op_count_waiters.fire_all();
        }
    }

    /// Transitions `On -> TurningOff(exn)`. A second call combines `exn`
    /// into whatever's already stored using [`Error::combine`]; cancel hooks
    /// and the context cancel only fire on the first transition.
    pub fn turn_off(&self, exn: Error) {
        let first_transition = {
            let mut state = self.0.borrow_mut();
            match &state.lifecycle {
                Lifecycle::On => {
                    state.lifecycle = Lifecycle::TurningOff(exn.clone());
                    true
                }
                Lifecycle::TurningOff(old) => {
                    let combined = old.clone().combine(exn.clone());
                    state.lifecycle = Lifecycle::TurningOff(combined);
                    false
                }
                Lifecycle::Off => false,
            }
        };

        if first_transition {
            self.0.borrow_mut().cancel_hooks.fire_all();
            let cancel_ctx = self.0.borrow().cancel_ctx;
            cancel::cancel(cancel_ctx, Rc::new(exn));
        }
    }

    /// Registers a release handler, run in LIFO order by [`finish`](Self::finish).
    /// Raises `SwitchFinished` if the switch already finished; a switch
    /// that's merely `TurningOff` still accepts the registration so `finish`
    /// runs it.
    pub fn on_release(&self, handler: impl FnOnce() -> Result<(), Error> + 'static) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        if matches!(state.lifecycle, Lifecycle::Off) {
            return Err(Error::SwitchFinished);
        }
        state.release_handlers.push(Box::new(handler));
        Ok(())
    }

    /// Registers a one-shot waker to be fired the moment this switch starts
    /// turning off.
    pub fn add_cancel_hook(&self, waker: Waker) -> WaiterHandle {
        self.0.borrow_mut().cancel_hooks.add(waker)
    }

    /// Deregisters a cancel hook before it fires. A no-op if it already did.
    pub fn remove_cancel_hook(&self, handle: WaiterHandle) {
        self.0.borrow_mut().cancel_hooks.remove(handle);
    }

    async fn finish<T>(self, body_result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &body_result {
            self.turn_off(err.clone());
        }

        self.await_op_count_zero().await;

        let cancel_ctx = self.0.borrow().cancel_ctx;

        loop {
            let handler = self.0.borrow_mut().release_handlers.pop();
            let Some(handler) = handler else { break };
            if let Err(err) = cancel::protect(cancel_ctx, handler) {
                self.turn_off(err);
            }
        }

        let stored = match &self.0.borrow().lifecycle {
            Lifecycle::TurningOff(err) => Some(err.clone()),
            _ => None,
        };

        self.0.borrow_mut().lifecycle = Lifecycle::Off;
        cancel::finish(cancel_ctx);

        match stored {
            Some(err) => Err(err),
            None => body_result,
        }
    }

    fn await_op_count_zero(&self) -> impl Future<Output = ()> + '_ {
        struct WaitOpCountZero<'a>(&'a Switch);

        impl<'a> Future for WaitOpCountZero<'a> {
            type Output = ();

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                let mut state = self.0 .0.borrow_mut();
                if state.op_count == 0 {
                    Poll::Ready(())
                } else {
                    state.op_count_waiters.add(cx.waker().clone());
                    Poll::Pending
                }
            }
        }

        WaitOpCountZero(self)
    }
}
