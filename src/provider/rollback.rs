//! Undo log for multi-step resource creation.

use std::ffi::OsString;

use slog::{Logger, warn};

use super::cli::VendorCli;

struct UndoStep {
    label: String,
    args: Vec<OsString>,
}

/// Records the CLI call that releases each resource as it is created.
///
/// On failure [`Rollback::unwind`] replays the calls newest first. Failures
/// while unwinding are logged and never replace the error that triggered the
/// rollback.
pub(crate) struct Rollback<'a> {
    cli: &'a VendorCli,
    log: &'a Logger,
    steps: Vec<UndoStep>,
}

impl<'a> Rollback<'a> {
    pub(crate) const fn new(cli: &'a VendorCli, log: &'a Logger) -> Self {
        Self {
            cli,
            log,
            steps: Vec::new(),
        }
    }

    /// Registers the call undoing the resource just created.
    pub(crate) fn push(&mut self, label: impl Into<String>, args: Vec<OsString>) {
        self.steps.push(UndoStep {
            label: label.into(),
            args,
        });
    }

    /// Releases every registered resource in reverse creation order.
    pub(crate) async fn unwind(self) {
        for step in self.steps.into_iter().rev() {
            if let Err(err) = self.cli.run(&step.label, step.args).await {
                warn!(self.log, "rollback step failed"; "step" => &step.label, "error" => %err);
            }
        }
    }

    /// Keeps every resource; the creation chain completed.
    pub(crate) fn commit(self) {
        drop(self.steps);
    }
}
