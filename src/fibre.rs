//! Per-fibre handle: which cancellation context the currently-executing
//! fibre is running under, plus the two suspension primitives built
//! directly on it (`yield_now`, `await_cancel`).
//!
//! "Current fibre" is tracked in a thread-local slot rather than threaded
//! through every combinator signature. [`with_cancel_ctx`] restores the
//! previous value around each `poll` call of the future it wraps — correct
//! because this executor only ever polls one future at a time, so the
//! ambient value is always right for the duration of that synchronous poll,
//! regardless of how deeply fibres are nested or interleaved between polls.

use crate::cancel::{self, CancelId};
use crate::error::Error;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

thread_local! {
    static CURRENT: Cell<Option<CancelId>> = Cell::new(None);
}

/// The cancellation context of the fibre currently being polled.
///
/// Panics outside of [`with_cancel_ctx`] — every fibre spawned by `fork`,
/// `fork_ignore`, or `fork_sub_ignore` is wrapped in one, so ordinary
/// combinator code never needs to pass a context around explicitly.
pub fn current() -> CancelId {
    try_current().expect("no fibre is currently running — called outside a spawned fibre")
}

/// Like [`current`], but `None` instead of a panic outside any fibre
/// context — e.g. a `Promise` awaited directly in the future passed to
/// `rt::block_on`, with no `with_cancel_ctx` wrapper around it.
pub fn try_current() -> Option<CancelId> {
    CURRENT.with(|cell| cell.get())
}

/// Wraps `inner` so [`current`] returns `ctx` for the duration of every
/// `poll` call made on the result. Every fibre-spawning primitive
/// (`fork`/`fork_ignore`/`fork_sub_ignore`) wraps its body in this before
/// handing it to [`crate::rt::spawn`].
pub fn with_cancel_ctx<F: Future>(ctx: CancelId, inner: F) -> WithCancelCtx<F> {
    WithCancelCtx { ctx, inner }
}

pub struct WithCancelCtx<F> {
    ctx: CancelId,
    inner: F,
}

impl<F: Future> Future for WithCancelCtx<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `inner` is never moved out of `self`, and `WithCancelCtx`
        // has no `Drop` impl that could move it either.
        let (ctx, inner) = unsafe {
            let this = self.get_unchecked_mut();
            (this.ctx, Pin::new_unchecked(&mut this.inner))
        };

        let previous = CURRENT.with(|cell| cell.replace(Some(ctx)));
        let output = inner.poll(cx);
        CURRENT.with(|cell| cell.set(previous));
        output
    }
}

/// Suspends the current fibre once, resuming strictly after every fibre
/// already on the ready queue. Always a cancellation point: the context is
/// re-checked on resume.
pub async fn yield_now() -> Result<(), Error> {
    struct Yield {
        yielded: bool,
    }

    impl Future for Yield {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    Yield { yielded: false }.await;
    cancel::check(current())
}

/// Suspends forever except via cancellation: installs a cancel callback on
/// the current context and resolves with the cancelling cause the moment
/// it fires.
pub async fn await_cancel() -> Error {
    struct AwaitCancel {
        ctx: CancelId,
        installed: bool,
    }

    impl Future for AwaitCancel {
        type Output = Error;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Error> {
            if let Err(err) = cancel::check(self.ctx) {
                return Poll::Ready(err);
            }
            if !self.installed {
                cancel::install_cancel_fn(self.ctx, cx.waker().clone());
                self.installed = true;
            }
            Poll::Pending
        }
    }

    let ctx = current();
    let err = AwaitCancel {
        ctx,
        installed: false,
    }
    .await;
    cancel::clear_cancel_fn(ctx);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt;
    use std::rc::Rc;

    mod with_cancel_ctx {
        use super::*;

        #[test]
        fn current_reflects_the_installed_context() {
            rt::block_on(async {
                let ctx = cancel::make(None);
                with_cancel_ctx(ctx, async {
                    assert_eq!(current(), ctx);
                })
                .await;
                cancel::finish(ctx);
            });
        }

        #[test]
        fn restores_the_previous_context_afterwards() {
            rt::block_on(async {
                let outer = cancel::make(None);
                with_cancel_ctx(outer, async {
                    let inner = cancel::make(Some(outer));
                    with_cancel_ctx(inner, async {
                        assert_eq!(current(), inner);
                    })
                    .await;
                    assert_eq!(current(), outer);
                    cancel::finish(inner);
                })
                .await;
                cancel::finish(outer);
            });
        }
    }

    mod yield_now {
        use super::*;

        #[test]
        fn resumes_cleanly_when_not_cancelled() {
            rt::block_on(async {
                let ctx = cancel::make(None);
                with_cancel_ctx(ctx, async {
                    yield_now().await.unwrap();
                })
                .await;
                cancel::finish(ctx);
            });
        }

        #[test]
        fn raises_cancelled_if_the_context_was_cancelled_before_resuming() {
            rt::block_on(async {
                let ctx = cancel::make(None);
                let result = with_cancel_ctx(ctx, async move {
                    cancel::cancel(ctx, Rc::new(Error::SwitchFinished));
                    yield_now().await
                })
                .await;

                assert!(result.is_err());
                cancel::finish(ctx);
            });
        }
    }

    mod await_cancel {
        use super::*;

        #[test]
        fn resolves_with_the_cancelling_cause() {
            rt::block_on(async {
                let ctx = cancel::make(None);

                let waiter = rt::spawn(with_cancel_ctx(ctx, async { await_cancel().await }));

                cancel::cancel(ctx, Rc::new(Error::SwitchFinished));

                let err = waiter.await.unwrap();
                assert!(err.is_cancelled());
                cancel::finish(ctx);
            });
        }
    }
}
