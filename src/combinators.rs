//! Fibre combinators: the operations built on top of [`crate::cancel`] and
//! [`crate::switch`] that user code actually calls.

use crate::cancel::{self, CancelId};
use crate::error::{Cause, Error};
use crate::fibre;
use crate::promise::Promise;
use crate::rt;
use crate::switch::Switch;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

pub use crate::fibre::{await_cancel, yield_now};

/// Runs `f` as a new fibre under `sw`, returning a [`Promise`] fulfilled
/// with its result. The fibre inherits cancellation from `sw`'s context.
///
/// `sw`'s liveness is checked before creating the child context — `sw`'s
/// `CancelId` is freed the instant it finishes, and creating a context under
/// a freed one panics. Forking onto an already-finished `sw` instead breaks
/// the returned promise with `sw`'s own stored failure, and the body never
/// runs.
pub fn fork<T, Fut>(sw: &Switch, f: impl FnOnce() -> Fut + 'static) -> Promise<T>
where
    Fut: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let (promise, resolver) = crate::promise::create();

    if let Err(err) = sw.check() {
        resolver.break_(err);
        return promise;
    }

    let sw = sw.clone();
    let child_ctx = cancel::make(Some(sw.cancel_ctx()));

    rt::spawn_detached(fibre::with_cancel_ctx(child_ctx, async move {
        let result = sw.with_op(f).await;
        cancel::finish(child_ctx);

        match result {
            Ok(value) => resolver.fulfill(value),
            Err(err) => resolver.break_(err),
        }
    }));

    promise
}

/// Runs `f` as a new fibre under `sw`; nobody awaits its result. Any
/// escaping failure other than `Cancelled` turns `sw` off — `Cancelled` is
/// swallowed because the cause is already recorded on the switch.
///
/// A no-op if `sw` has already finished, for the same reason [`fork`] checks
/// first: its `CancelId` is already freed.
pub fn fork_ignore<T, Fut>(sw: &Switch, f: impl FnOnce() -> Fut + 'static)
where
    Fut: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    if sw.check().is_err() {
        return;
    }

    let sw = sw.clone();
    let sw_for_catch = sw.clone();
    let child_ctx = cancel::make(Some(sw.cancel_ctx()));

    rt::spawn_detached(fibre::with_cancel_ctx(child_ctx, async move {
        let result = sw.with_op(f).await;
        cancel::finish(child_ctx);

        if let Err(err) = result {
            // `Cancelled` is already recorded on the switch; `SwitchFinished`
            // means `with_op` refused to even start the body because the
            // switch was already closing — neither is a new failure to report.
            if !err.is_cancelled() && !matches!(err, Error::SwitchFinished) {
                sw_for_catch.turn_off(err);
            }
        }
    }));
}

/// The canonical "allocate a scoped resource, run a child, release it"
/// primitive. `on_release` is guaranteed to run exactly once — even when
/// `sw` is already off and the body never gets to start.
pub fn fork_sub_ignore<T, OnError, OnRelease, Body, Fut>(
    sw: &Switch,
    on_error: OnError,
    on_release: Option<OnRelease>,
    body: Body,
) where
    OnError: FnOnce(Error) -> Result<(), Error> + 'static,
    OnRelease: FnOnce() -> Result<(), Error> + 'static,
    Body: FnOnce(Switch) -> Fut + 'static,
    Fut: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let did_attach = Rc::new(Cell::new(false));
    let did_attach_for_fibre = did_attach.clone();

    let shared_release: Rc<RefCell<Option<OnRelease>>> = Rc::new(RefCell::new(on_release));
    let release_for_fibre = shared_release.clone();

    let parent = sw.clone();
    let parent_for_cancel = sw.clone();

    fork_ignore::<(), _>(sw, move || async move {
        let result = Switch::sub(&parent, on_error, move |child_sw| {
            if let Some(handler) = release_for_fibre.borrow_mut().take() {
                let _ = child_sw.on_release(handler);
            }
            did_attach_for_fibre.set(true);
            body(child_sw)
        })
        .await;

        // Cancellation is reported through the parent directly, not `on_error`
        // — `Switch::sub` already skips `on_error` for it.
        if let Err(err) = &result {
            if err.is_cancelled() {
                parent_for_cancel.turn_off(err.clone());
            }
        }

        Ok(())
    });

    if !did_attach.get() {
        // The child switch never started: `sw` was already off, or its
        // cancel context already cancelled. Free the resource anyway, then
        // let the existing stored failure propagate as usual. A genuinely
        // `Off` `sw` has already freed its `CancelId` (`Switch::finish` does
        // both in the same step), so `cancel::protect` — which needs a live
        // node — would panic; run the handler directly in that case instead.
        if let Some(handler) = shared_release.borrow_mut().take() {
            let _ = if matches!(sw.check(), Err(Error::SwitchFinished)) {
                handler()
            } else {
                cancel::protect(sw.cancel_ctx(), handler)
            };
        }
        debug_assert!(
            sw.check().is_err(),
            "fork_sub_ignore: child never attached, but the parent switch was neither off nor turning off"
        );
    }
}

/// Runs `f` as a sibling fibre and `g` on the calling fibre, under a fresh
/// child cancellation context. See the module-level outcome table for how
/// failures on either side are reconciled.
pub async fn pair<A, B, FutF, FutG>(
    f: impl FnOnce() -> FutF + 'static,
    g: impl FnOnce() -> FutG,
) -> Result<(A, B), Error>
where
    FutF: Future<Output = Result<A, Error>> + 'static,
    FutG: Future<Output = Result<B, Error>>,
    A: 'static,
{
    Switch::run(move |sw| async move {
        let child_ctx = sw.cancel_ctx();
        let f_promise = fork(&sw, f);

        match g().await {
            Ok(g_value) => match f_promise.await {
                Ok(f_value) => Ok((f_value, g_value)),
                Err(fex) => Err(fex),
            },
            Err(gex) => {
                cancel::cancel(child_ctx, Rc::new(gex.clone()));
                let f_outcome = cancel::protect_async(child_ctx, f_promise).await;

                match f_outcome {
                    Ok(_) => Err(gex),
                    Err(fex) if fex.is_cancelled() => Err(gex),
                    Err(fex) if gex.is_cancelled() => Err(fex),
                    Err(fex) => Err(fex.combine(gex)),
                }
            }
        }
    })
    .await
}

/// Runs every procedure in `xs` concurrently under a fresh switch, waiting
/// for all of them and aggregating any failures. `both(f, g) = all([f, g])`.
pub async fn all(xs: Vec<Pin<Box<dyn Future<Output = Result<(), Error>>>>>) -> Result<(), Error> {
    Switch::run(move |sw| async move {
        for x in xs {
            fork_ignore(&sw, move || x);
        }
        Ok(())
    })
    .await
}

/// `both(f, g) = all([f; g])`.
pub async fn both(
    f: Pin<Box<dyn Future<Output = Result<(), Error>>>>,
    g: Pin<Box<dyn Future<Output = Result<(), Error>>>>,
) -> Result<(), Error> {
    all(vec![f, g]).await
}

enum Stored<T> {
    Empty,
    Ok(T),
    Ex(Error),
}

fn store_failure<T>(stored: &Rc<RefCell<Stored<T>>>, err: Error) {
    let mut slot = stored.borrow_mut();
    let previous = std::mem::replace(&mut *slot, Stored::Empty);
    *slot = match previous {
        Stored::Empty => Stored::Ex(err),
        Stored::Ok(_) => Stored::Ex(err),
        Stored::Ex(old) => Stored::Ex(old.combine(err)),
    };
}

fn record_branch_outcome<T>(child_ctx: CancelId, stored: &Rc<RefCell<Stored<T>>>, outcome: Result<T, Error>) {
    match outcome {
        Ok(value) => {
            let already_decided = !matches!(*stored.borrow(), Stored::Empty);
            if !already_decided {
                *stored.borrow_mut() = Stored::Ok(value);
                cancel::cancel(child_ctx, Rc::new(Error::NotFirst));
            }
        }
        Err(err) if err.is_cancelled() => {
            if cancel::check(child_ctx).is_err() {
                // this context was cancelled (typically by our own
                // winner-selection `NotFirst` signal) — a loser losing to
                // that is expected, not a failure.
            } else {
                store_failure(stored, err);
            }
        }
        Err(err) => store_failure(stored, err),
    }
}

/// Runs every function in `fs` and returns the first success (cancelling
/// the rest), or the aggregated failure if none succeed. Spawns all but the
/// last as forked fibres; the last runs inline so a single-function `any`
/// doesn't pay for a fork. `first(f, g) = any([f; g])`.
pub async fn any<T: 'static>(fs: Vec<Pin<Box<dyn Future<Output = Result<T, Error>>>>>) -> Result<T, Error> {
    let stored: Rc<RefCell<Stored<T>>> = Rc::new(RefCell::new(Stored::Empty));
    let parent_ctx = fibre::current();
    let stored_for_sub = stored.clone();

    let (_, sub_error) = cancel::sub_unchecked(parent_ctx, move |child_ctx| async move {
        let count = fs.len();
        let mut promises = Vec::with_capacity(count.saturating_sub(1));

        for (i, fut) in fs.into_iter().enumerate() {
            let stored = stored_for_sub.clone();
            let branch = fibre::with_cancel_ctx(child_ctx, async move {
                let outcome = fut.await;
                record_branch_outcome(child_ctx, &stored, outcome);
            });

            if i + 1 == count {
                branch.await;
            } else {
                promises.push(rt::spawn(branch));
            }
        }

        cancel::protect_async(child_ctx, async move {
            for promise in promises {
                let _ = promise.await;
            }
        })
        .await;
    })
    .await;

    // Our own `NotFirst` cancellation (used to signal losers) must not be
    // mistaken for an externally-caused cancellation of this `any` call.
    let external_error: Option<Cause> = sub_error.filter(|ex| !matches!(**ex, Error::NotFirst));

    let stored = Rc::try_unwrap(stored)
        .unwrap_or_else(|_| unreachable!("any: stored cell still shared after every branch settled"))
        .into_inner();

    match (stored, external_error) {
        (Stored::Ok(value), None) => Ok(value),
        (Stored::Ok(_), Some(ex)) => Err((*ex).clone()),
        (Stored::Ex(e), None) => Err(e),
        (Stored::Ex(e), Some(e2)) => Err(e.combine((*e2).clone())),
        (Stored::Empty, Some(ex)) => Err((*ex).clone()),
        (Stored::Empty, None) => {
            unreachable!("any: no branch produced a result and the scope wasn't cancelled")
        }
    }
}

/// `first(f, g) = any([f; g])`.
pub async fn first<T: 'static>(
    f: Pin<Box<dyn Future<Output = Result<T, Error>>>>,
    g: Pin<Box<dyn Future<Output = Result<T, Error>>>>,
) -> Result<T, Error> {
    any(vec![f, g]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Labelled(&'static str);

    mod first {
        use super::*;

        #[test]
        fn returns_the_winner_and_swallows_the_loser() {
            let output = rt::block_on(async {
                first(
                    Box::pin(async { Ok("a") }),
                    Box::pin(async {
                        yield_now().await?;
                        Ok("b")
                    }),
                )
                .await
            });

            assert_eq!(output.unwrap(), "a");
        }

        #[test]
        fn aggregates_when_both_fail() {
            let output: Result<(), Error> = rt::block_on(async {
                first(
                    Box::pin(async { Err(Error::user(Labelled("a"))) }),
                    Box::pin(async { Err(Error::user(Labelled("b"))) }),
                )
                .await
            });

            match output {
                Err(Error::Multiple(m)) => assert_eq!(m.errors().len(), 2),
                _ => panic!("expected Multiple"),
            }
        }

        #[test]
        fn a_losing_branch_cancelled_before_it_fails_never_raises() {
            let output = rt::block_on(async {
                first(
                    Box::pin(async { Ok("a") }),
                    Box::pin(async {
                        yield_now().await?;
                        Err(Error::user(Labelled("b")))
                    }),
                )
                .await
            });

            assert_eq!(output.unwrap(), "a");
        }

        #[test]
        fn a_losing_branch_parked_on_a_bare_promise_is_cancelled_not_deadlocked() {
            let output = rt::block_on(async {
                first(
                    Box::pin(async { Ok("a") }),
                    Box::pin(async {
                        let (never, _resolver) = crate::promise::create::<&'static str>();
                        never.await
                    }),
                )
                .await
            });

            assert_eq!(output.unwrap(), "a");
        }
    }

    mod both {
        use super::*;

        #[test]
        fn aggregates_synchronous_failures_in_order() {
            let output = rt::block_on(async {
                both(
                    Box::pin(async { Err(Error::user(Labelled("x"))) }),
                    Box::pin(async { Err(Error::user(Labelled("y"))) }),
                )
                .await
            });

            match output {
                Err(Error::Multiple(m)) => {
                    assert_eq!(m.errors().len(), 2);
                    assert_eq!(m.errors()[0].to_string(), "x");
                    assert_eq!(m.errors()[1].to_string(), "y");
                }
                _ => panic!("expected Multiple[x; y]"),
            }
        }

        #[test]
        fn succeeds_when_both_succeed() {
            let output = rt::block_on(async {
                both(Box::pin(async { Ok(()) }), Box::pin(async { Ok(()) })).await
            });

            assert!(output.is_ok());
        }
    }

    mod any {
        use super::*;
        use std::cell::RefCell as StdRefCell;

        #[test]
        fn first_to_finish_wins_and_others_are_swallowed() {
            let log = Rc::new(StdRefCell::new(Vec::new()));

            let output = rt::block_on(async {
                let l0 = log.clone();
                let l1 = log.clone();
                let l2 = log.clone();

                any(vec![
                    Box::pin(async move {
                        l0.borrow_mut().push(0);
                        yield_now().await?;
                        Ok(0)
                    }),
                    Box::pin(async move {
                        l1.borrow_mut().push(1);
                        yield_now().await?;
                        Ok(1)
                    }),
                    Box::pin(async move {
                        l2.borrow_mut().push(2);
                        yield_now().await?;
                        Ok(2)
                    }),
                ])
                .await
            });

            assert_eq!(output.unwrap(), 0);
            assert_eq!(*log.borrow(), vec![0, 1, 2]);
        }
    }

    mod fork_sub_ignore {
        use super::*;

        #[test]
        fn runs_on_release_but_not_the_body_when_the_parent_is_already_off() {
            let released = Rc::new(Cell::new(false));
            let body_ran = Rc::new(Cell::new(false));

            let output: Result<(), Error> = rt::block_on(async {
                Switch::run(move |sw| {
                    let released = released.clone();
                    let body_ran = body_ran.clone();
                    async move {
                        sw.turn_off(Error::user(Labelled("already off")));

                        fork_sub_ignore(
                            &sw,
                            |_err| Ok(()),
                            Some(move || {
                                released.set(true);
                                Ok(())
                            }),
                            move |_child_sw| {
                                body_ran.set(true);
                                async { Ok::<(), Error>(()) }
                            },
                        );

                        assert!(released.get());
                        assert!(!body_ran.get());

                        Err(Error::user(Labelled("already off")))
                    }
                })
                .await
            });

            assert!(output.is_err());
        }

        #[test]
        fn gracefully_handles_forking_onto_a_switch_that_has_already_finished() {
            let released = Rc::new(Cell::new(false));
            let body_ran = Rc::new(Cell::new(false));

            rt::block_on(async {
                let mut captured: Option<Switch> = None;

                Switch::run(|sw| {
                    captured = Some(sw.clone());
                    async move { Ok::<_, Error>(()) }
                })
                .await
                .unwrap();

                let sw = captured.unwrap();
                assert!(matches!(sw.check(), Err(Error::SwitchFinished)));

                let released = released.clone();
                let body_ran = body_ran.clone();

                fork_sub_ignore(
                    &sw,
                    |_err| Ok(()),
                    Some(move || {
                        released.set(true);
                        Ok(())
                    }),
                    move |_child_sw| {
                        body_ran.set(true);
                        async { Ok::<(), Error>(()) }
                    },
                );
            });

            assert!(released.get());
            assert!(!body_ran.get());
        }
    }
}
