#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The root cancellation signal and the periodic-tick primitive every
//! supervised task loop is built on (spec.md §5).
//!
//! Every task shares one root [`CancellationToken`]; the supervisor
//! cancels it once to begin an orderly, observable-at-every-suspension-
//! point shutdown (spec.md §5 "Cancellation"). A [`Ticker`] pairs that
//! token with a `tokio::time::Interval` so a task loop reduces to
//! `match ticker.tick().await { Elapsed => ..., Cancelled => break }`.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// The outcome of one [`Ticker::tick`] call.
#[derive(Debug)]
#[non_exhaustive]
pub enum Tick {
    /// The configured interval elapsed; the task should run one cycle.
    Elapsed,
    /// The root cancellation token fired; the task should stop.
    Cancelled,
}

/// Drives a task's periodic duty: each call to [`tick`](Ticker::tick)
/// waits for either the next interval elapsed or cancellation, whichever
/// comes first.
pub struct Ticker {
    interval: tokio::time::Interval,
    cancel: CancellationToken,
}

impl Ticker {
    /// Builds a ticker firing every `period`, stopping early if `cancel`
    /// fires. The first tick fires immediately, then every `period`
    /// thereafter — matching `tokio::time::interval`'s default behavior.
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval: tokio::time::interval(period),
            cancel,
        }
    }

    /// Waits for the next interval elapsed or cancellation.
    pub async fn tick(&mut self) -> Tick {
        tokio::select! {
            _ = self.interval.tick() => Tick::Elapsed,
            () = self.cancel.cancelled() => Tick::Cancelled,
        }
    }

    /// The cancellation token this ticker observes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
