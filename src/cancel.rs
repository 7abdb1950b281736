//! Cancellation-context tree.
//!
//! Nodes are arena-allocated in a thread-local `slab::Slab`, referenced by
//! [`CancelId`] index handles rather than `Rc` parent/child pointers — the
//! "arena-allocated nodes with index handles" option, chosen so the tree
//! never needs a weak/strong split to break cycles. Grounded on the same
//! slab-arena shape as [`crate::rt::Runtime`]'s task table, generalized from
//! a flat collection to a tree.

use crate::error::{Cause, Error};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::task::Waker;

/// Opaque handle to a node in the cancellation tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CancelId(usize);

#[derive(Debug, Clone)]
enum State {
    Active,
    Cancelling(Cause),
    Finished,
}

struct Node {
    parent: Option<CancelId>,
    children: Vec<CancelId>,
    state: State,
    cancel_fn: Option<Waker>,
    protect_depth: u32,
    /// Set when a cancel arrives while `protect_depth > 0`; the deferred
    /// wake is delivered once the outermost `protect` call returns.
    deferred_wake: bool,
}

thread_local! {
    static ARENA: RefCell<slab::Slab<Node>> = RefCell::new(slab::Slab::new());
}

fn with_node<T>(id: CancelId, f: impl FnOnce(&mut Node) -> T) -> T {
    ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        let node = arena
            .get_mut(id.0)
            .expect("CancelId used after its context finished");
        f(node)
    })
}

/// Creates a new context as a child of `parent` (or a fresh root if `None`).
///
/// A child created under an already-`Cancelling` parent is born `Cancelling`
/// with the same cause rather than this call failing — it can never become
/// independently `Active`, which satisfies "every descendant becomes
/// Cancelling" without threading a `Result` through every `fork`/`sub` call
/// site that creates one.
pub fn make(parent: Option<CancelId>) -> CancelId {
    let initial_state = match parent {
        Some(parent) => with_node(parent, |node| match &node.state {
            State::Cancelling(cause) => State::Cancelling(cause.clone()),
            State::Active => State::Active,
            State::Finished => panic!("cannot create a context under a finished parent"),
        }),
        None => State::Active,
    };

    let id = ARENA.with(|arena| {
        CancelId(arena.borrow_mut().insert(Node {
            parent,
            children: Vec::new(),
            state: initial_state,
            cancel_fn: None,
            protect_depth: 0,
            deferred_wake: false,
        }))
    });

    if let Some(parent) = parent {
        with_node(parent, |node| node.children.push(id));
    }

    id
}

/// Marks `id` `Finished`, detaches it from its parent's children, and frees
/// its arena slot. Call exactly once per context, after its owner is done
/// with it.
pub fn finish(id: CancelId) {
    let parent = with_node(id, |node| {
        node.state = State::Finished;
        node.parent
    });

    if let Some(parent) = parent {
        with_node(parent, |node| node.children.retain(|&child| child != id));
    }

    ARENA.with(|arena| arena.borrow_mut().remove(id.0));
}

/// Idempotent: a context can only ever record the first cause it's
/// cancelled with. Recurses into every descendant before firing `id`'s own
/// installed cancel callback, matching §4.1's ordering.
pub fn cancel(id: CancelId, cause: Cause) {
    let (children, fired) = ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        let Some(node) = arena.get_mut(id.0) else {
            return (Vec::new(), None);
        };

        if !matches!(node.state, State::Active) {
            return (Vec::new(), None);
        }

        node.state = State::Cancelling(cause.clone());
        let children = node.children.clone();

        let fired = if node.protect_depth == 0 {
            node.cancel_fn.take()
        } else {
            node.deferred_wake = true;
            None
        };

        (children, fired)
    });

    for child in children {
        cancel(child, cause.clone());
    }

    if let Some(waker) = fired {
        waker.wake();
    }
}

/// Raises `Cancelled(cause)` if `id` is cancelling; otherwise a no-op.
pub fn check(id: CancelId) -> Result<(), Error> {
    ARENA.with(|arena| match arena.borrow().get(id.0) {
        Some(Node {
            state: State::Cancelling(cause),
            ..
        }) => Err(Error::Cancelled(cause.clone())),
        _ => Ok(()),
    })
}

/// The stored cause, if `id` is cancelling.
pub fn get_error(id: CancelId) -> Option<Cause> {
    ARENA.with(|arena| match arena.borrow().get(id.0) {
        Some(Node {
            state: State::Cancelling(cause),
            ..
        }) => Some(cause.clone()),
        _ => None,
    })
}

/// Installs `waker` as the one outstanding cancel callback for `id`. Panics
/// if one is already installed — at most one per suspended fibre.
pub fn install_cancel_fn(id: CancelId, waker: Waker) {
    with_node(id, |node| {
        assert!(
            node.cancel_fn.is_none(),
            "a cancel callback is already installed on this context"
        );
        node.cancel_fn = Some(waker);
    });
}

/// Clears the installed cancel callback, if any. A fibre calls this as soon
/// as it resumes, before inspecting why.
pub fn clear_cancel_fn(id: CancelId) {
    with_node(id, |node| node.cancel_fn = None);
}

/// Runs `f` with `id`'s cancel callback deferred: a `cancel` that arrives
/// while `f` runs does not fire the callback until `f` returns. Used to
/// delimit non-cancellable regions such as release handlers.
pub fn protect<T>(id: CancelId, f: impl FnOnce() -> T) -> T {
    with_node(id, |node| node.protect_depth += 1);

    let value = f();

    let deferred = with_node(id, |node| {
        node.protect_depth -= 1;
        if node.protect_depth == 0 && node.deferred_wake {
            node.deferred_wake = false;
            node.cancel_fn.take()
        } else {
            None
        }
    });

    if let Some(waker) = deferred {
        waker.wake();
    }

    value
}

/// Like [`protect`], but wraps a future instead of a synchronous closure:
/// `id`'s cancel callback is deferred for the whole lifetime of `inner`,
/// across every poll, not just one synchronous call. Used to await a
/// promise without letting a cancel arriving mid-await fire prematurely
/// (`pair`'s "await f's result under protect").
pub fn protect_async<F: Future>(id: CancelId, inner: F) -> ProtectAsync<F> {
    ProtectAsync {
        id,
        inner,
        entered: false,
    }
}

pub struct ProtectAsync<F> {
    id: CancelId,
    inner: F,
    entered: bool,
}

impl<F: Future> Future for ProtectAsync<F> {
    type Output = F::Output;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<F::Output> {
        // Safety: `inner` is never moved out of `self`, and `ProtectAsync` has
        // no `Drop` impl that could move it either.
        let this = unsafe { self.get_unchecked_mut() };

        if !this.entered {
            with_node(this.id, |node| node.protect_depth += 1);
            this.entered = true;
        }

        let inner = unsafe { std::pin::Pin::new_unchecked(&mut this.inner) };
        let poll = inner.poll(cx);

        if poll.is_ready() {
            let deferred = with_node(this.id, |node| {
                node.protect_depth -= 1;
                if node.protect_depth == 0 && node.deferred_wake {
                    node.deferred_wake = false;
                    node.cancel_fn.take()
                } else {
                    None
                }
            });

            if let Some(waker) = deferred {
                waker.wake();
            }
        }

        poll
    }
}

/// Creates a child of `parent`, runs `body(child)`, and ensures the child is
/// finished afterwards. If `body` raises anything other than `Cancelled`,
/// the child is cancelled with that cause first, so any of its own
/// still-active descendants are cancelled too before this returns.
pub async fn sub<T, Fut>(parent: CancelId, body: impl FnOnce(CancelId) -> Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    let child = make(Some(parent));
    let result = body(child).await;

    if let Err(error) = &result {
        if !error.is_cancelled() {
            cancel(child, Rc::new(error.clone()));
        }
    }

    finish(child);
    result
}

/// Like [`sub`], but `body` never raises — it returns a value directly, and
/// the caller inspects [`get_error`] to see whether the child ended up
/// cancelled along the way. Used by `any`, which treats "a loser was
/// cancelled" as a normal outcome rather than a failure.
pub async fn sub_unchecked<T, Fut>(
    parent: CancelId,
    body: impl FnOnce(CancelId) -> Fut,
) -> (T, Option<Cause>)
where
    Fut: Future<Output = T>,
{
    let child = make(Some(parent));
    let value = body(child).await;
    let error = get_error(child);
    finish(child);
    (value, error)
}
