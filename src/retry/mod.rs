//! Bounded readiness polling and fixed-count retries.
//!
//! Every provider wait, machine boot and reboot goes through
//! [`wait_until_ready`]. A check returns `Ok(true)` once the awaited state is
//! reached, `Ok(false)` to keep waiting, and `Err(_)` to abort immediately.
//! Transient conditions must therefore be mapped to `Ok(false)` by the
//! caller; anything surfaced as an error is treated as fatal.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};

/// Timeout and interval describing one readiness poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Poll {
    /// Total time budget before the poll gives up.
    pub timeout: Duration,
    /// Delay between two consecutive checks.
    pub interval: Duration,
}

impl Poll {
    /// Instance creation on a cloud provider: ten minutes, every ten seconds.
    pub const INSTANCE_BOOT: Self = Self::new(Duration::from_secs(600), Duration::from_secs(10));
    /// Azure VM provisioning: five minutes, every ten seconds.
    pub const AZURE_PROVISION: Self =
        Self::new(Duration::from_secs(300), Duration::from_secs(10));
    /// Service convergence on a running machine: two minutes, every ten seconds.
    pub const SERVICE: Self = Self::new(Duration::from_secs(120), Duration::from_secs(10));

    /// Builds a poll descriptor.
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Errors produced by [`wait_until_ready`] and [`retry`].
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// The awaited state was not observed before the timeout elapsed.
    #[error("timed out after {timeout:?} ({attempts} attempts)")]
    Timeout {
        /// Configured time budget.
        timeout: Duration,
        /// Number of checks performed.
        attempts: u32,
    },
    /// The poll was cancelled from outside.
    #[error("cancelled")]
    Cancelled,
    /// The check reported a fatal error.
    #[error("{0}")]
    Check(#[source] E),
}

impl<E> PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns `true` when the poll ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the check error, if any.
    #[must_use]
    pub fn into_check(self) -> Option<E> {
        match self {
            Self::Check(err) => Some(err),
            Self::Timeout { .. } | Self::Cancelled => None,
        }
    }
}

/// Handle used to cancel every poll observing the paired [`CancelSignal`].
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Cancels all polls holding a clone of the paired signal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal threaded through long-running waits.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    #[must_use]
    pub const fn never() -> Self {
        Self { rx: None }
    }

    /// Returns `true` once the paired [`Canceller`] has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested. Pending forever for
    /// [`CancelSignal::never`] or when the canceller was dropped unused.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut receiver = rx.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a connected canceller and signal.
#[must_use]
pub fn cancel_pair() -> (Canceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancelSignal { rx: Some(rx) })
}

/// Polls `check` until it reports readiness, fails, the timeout elapses or
/// `cancel` fires.
///
/// The first check runs immediately and later checks are separated by
/// `poll.interval`. No check starts after the deadline and a check still
/// running at `timeout + interval` is dropped, so the call always returns
/// within `timeout + interval`.
///
/// # Errors
///
/// Returns [`PollError::Check`] as soon as `check` fails,
/// [`PollError::Timeout`] when the budget is exhausted and
/// [`PollError::Cancelled`] when `cancel` fires.
pub async fn wait_until_ready<F, Fut, E>(
    poll: Poll,
    cancel: &CancelSignal,
    mut check: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: std::error::Error + 'static,
{
    poll_for(poll, cancel, || {
        let pending = check();
        async move { pending.await.map(|ready| ready.then_some(())) }
    })
    .await
}

/// Like [`wait_until_ready`], but the check hands back a value once ready.
///
/// # Errors
///
/// Same as [`wait_until_ready`].
pub async fn poll_for<F, Fut, T, E>(
    poll: Poll,
    cancel: &CancelSignal,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::error::Error + 'static,
{
    let deadline = Instant::now() + poll.timeout;
    let mut attempts: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        attempts = attempts.saturating_add(1);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            () = sleep_until(deadline + poll.interval) => {
                return Err(PollError::Timeout {
                    timeout: poll.timeout,
                    attempts,
                });
            }
            outcome = check() => outcome.map_err(PollError::Check)?,
        };
        if let Some(value) = outcome {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(PollError::Timeout {
                timeout: poll.timeout,
                attempts,
            });
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            () = sleep(poll.interval) => {}
        }
    }
}

/// Runs `op` up to `attempts` times, sleeping `delay` between failures.
///
/// A zero attempt count still runs the operation once.
///
/// # Errors
///
/// Returns the last failure as [`PollError::Check`], or
/// [`PollError::Cancelled`] when `cancel` fires.
pub async fn retry<F, Fut, T, E>(
    attempts: u32,
    delay: Duration,
    cancel: &CancelSignal,
    mut op: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let total = attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            outcome = op() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= total => return Err(PollError::Check(err)),
            Err(_) => {}
        }
        attempt += 1;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            () = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests;
