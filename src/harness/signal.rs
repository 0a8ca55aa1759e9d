//! SIGINT handling for test runs.

use slog::{Logger, error, warn};
use tokio::signal::unix::{SignalKind, signal};

use crate::retry::{CancelSignal, cancel_pair};

/// Exit status used when a second SIGINT arrives during shutdown.
const SIGINT_EXIT_CODE: i32 = 130;

/// Returns a signal that fires on the first SIGINT.
///
/// The first interrupt asks running tests to stop so their clusters are
/// still torn down. A second interrupt exits the process immediately.
///
/// # Errors
///
/// Returns the I/O error raised when the handler cannot be installed.
pub fn cancel_on_interrupt(log: &Logger) -> std::io::Result<CancelSignal> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let (canceller, cancel) = cancel_pair();
    let observed = cancel.clone();
    let logger = log.clone();
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            if observed.is_cancelled() {
                error!(logger, "SIGINT received while shutting down, exiting");
                error!(logger, "instances may have been leaked; run kola-gc to clean up");
                std::process::exit(SIGINT_EXIT_CODE);
            }
            warn!(logger, "SIGINT received, stopping tests");
            canceller.cancel();
        }
    });
    Ok(cancel)
}
