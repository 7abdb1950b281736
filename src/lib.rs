//! A single-threaded structured-concurrency runtime: cancellation contexts,
//! switches, and fibre combinators.
//!
//! Start a root scope with [`switch::Switch::run`] (or the `#[switchy::start]`
//! attribute, if the `macros` feature is enabled), spawn fibres under it with
//! [`combinators::fork`]/[`combinators::fork_ignore`]/[`combinators::fork_sub_ignore`],
//! and combine their results with [`combinators::pair`], [`combinators::all`],
//! [`combinators::both`], [`combinators::any`], or [`combinators::first`].

#[cfg(feature = "macros")]
pub use switchy_macros::start;

pub mod cancel;
pub mod combinators;
pub mod error;
pub mod fibre;
pub mod promise;
pub mod rt;
pub mod switch;

mod utils;
mod waiters;
