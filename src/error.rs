//! Exception taxonomy shared by every combinator.
//!
//! Mirrors the root `Error<E>` enum the teacher codebase keeps in its own
//! `lib.rs`, generalized from "one underlying I/O error" to "any user error,
//! plus the runtime's own control-flow signals".

use std::backtrace::Backtrace;
use std::fmt;
use std::rc::Rc;

/// The single exception type that flows through `fork`, `pair`, `all`, `any`, ...
///
/// `Cancelled` and `SwitchFinished` are runtime-owned signals; `Multiple` is
/// produced by the aggregation rules in [`crate::switch`] and the combinators;
/// `User` carries whatever the caller's fibre body returned.
#[derive(Debug, Clone)]
pub enum Error {
    /// A context was cancelled. Carries the exception that caused it, by
    /// identity (the `Rc` is never re-built from a message).
    Cancelled(Cause),

    /// An operation was attempted on a [`crate::switch::Switch`] that already
    /// finished.
    SwitchFinished,

    /// Two or more independent failures that must be preserved. Never
    /// contains another `Multiple` at any depth — see [`Multiple::push`].
    Multiple(Multiple),

    /// Internal sentinel used by `any`/`first` to cancel losing branches.
    /// Never escapes a combinator; reaching user code is a bug.
    NotFirst,

    /// A caller-supplied error, passed through unchanged.
    User(Rc<dyn std::error::Error + 'static>),
}

/// The originating exception behind a [`Error::Cancelled`], kept by `Rc`
/// identity so "strip `Cancelled` outside the cancelling context" can compare
/// the unwrapped cause without reconstructing it.
pub type Cause = Rc<Error>;

impl Error {
    /// Wraps an arbitrary user error.
    pub fn user<E: std::error::Error + 'static>(error: E) -> Self {
        Error::User(Rc::new(error))
    }

    /// True for [`Error::Cancelled`] — the only variant that user-facing
    /// `on_error`/`fork_ignore` handlers must never see.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Unwraps one layer of `Cancelled`, returning the original cause.
    /// Used when re-raising outside the context that was cancelled (distilled
    /// spec §4.1/§4.7: "Cancelled is stripped when re-raised outside the
    /// originating context").
    pub fn strip_cancelled(self) -> Error {
        match self {
            Error::Cancelled(cause) => Rc::try_unwrap(cause).unwrap_or_else(|rc| (*rc).clone()),
            other => other,
        }
    }

    /// Combines two exceptions per the `turn_off`/release-handler aggregation
    /// policy (distilled spec §4.3, §7):
    /// - `Cancelled` is discarded once a non-`Cancelled` exception exists.
    /// - two non-`Cancelled` exceptions flatten into one [`Multiple`].
    /// - two `Cancelled`s: the most recent wins.
    pub fn combine(self, new: Error) -> Error {
        match (self, new) {
            (old, Error::Cancelled(_)) if !old.is_cancelled() => old,
            (Error::Cancelled(_), new) => new,
            (old, new) => {
                let mut multiple = Multiple::new(old);
                multiple.push(new);
                Error::Multiple(multiple)
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled(cause) => write!(f, "cancelled: {cause}"),
            Error::SwitchFinished => write!(f, "switch finished"),
            Error::Multiple(multiple) => write!(f, "{multiple}"),
            Error::NotFirst => write!(f, "not first"),
            Error::User(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for Error {}

/// An ordered, never-nested list of independent failures.
///
/// Constructed via [`Error::combine`]; `push` flattens a nested `Multiple`
/// instead of wrapping it, satisfying "aggregation is never nested".
#[derive(Debug, Clone)]
pub struct Multiple {
    errors: Vec<Error>,
    backtrace: Rc<Backtrace>,
}

impl Multiple {
    fn new(first: Error) -> Self {
        let mut errors = Vec::with_capacity(2);
        Self::push_flattened(&mut errors, first);
        Multiple {
            errors,
            backtrace: Rc::new(Backtrace::capture()),
        }
    }

    fn push(&mut self, error: Error) {
        Self::push_flattened(&mut self.errors, error);
    }

    fn push_flattened(errors: &mut Vec<Error>, error: Error) {
        match error {
            Error::Multiple(nested) => errors.extend(nested.errors),
            other => errors.push(other),
        }
    }

    /// The flattened list of failures, in the order they were combined.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Backtrace captured when this `Multiple` was first formed.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for Multiple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiple errors: [")?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
        }
        write!(f, "]")
    }
}
