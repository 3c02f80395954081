//! Built-in simulator handler.
//!
//! Runs the full handler contract against the real download path and the
//! installed-criteria ledger without touching device state. Used for
//! provisioning checks, bench runs, and the integration tests.

use tracing::info;

use crate::download;
use crate::handler::{UpdateHandler, WorkflowView};
use crate::types::{InstalledState, StepOutcome};

/// Update type the simulator registers under.
pub const SIMULATOR_UPDATE_TYPE: &str = "overair/simulator:1";

#[derive(Debug, Default)]
pub struct SimulatorHandler {
    reboot_on_apply: bool,
}

impl SimulatorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variant whose `apply` asks for a reboot, for exercising the resume
    /// path.
    pub fn with_reboot_required() -> Self {
        Self {
            reboot_on_apply: true,
        }
    }
}

impl UpdateHandler for SimulatorHandler {
    fn download(&self, view: &WorkflowView<'_>) -> StepOutcome {
        if view.is_cancel_requested() {
            return StepOutcome::Cancelled;
        }
        match download::download_deployment_files(view) {
            Ok(()) => StepOutcome::Success,
            Err(e) => e.into_outcome(),
        }
    }

    fn backup(&self, _view: &WorkflowView<'_>) -> StepOutcome {
        StepOutcome::Success
    }

    fn install(&self, view: &WorkflowView<'_>) -> StepOutcome {
        if view.is_cancel_requested() {
            return StepOutcome::Cancelled;
        }
        StepOutcome::Success
    }

    fn apply(&self, view: &WorkflowView<'_>) -> StepOutcome {
        if view.is_cancel_requested() {
            return StepOutcome::Cancelled;
        }
        let deployment = view.deployment;
        if !deployment.installed_criteria.is_empty() {
            if let Err(e) = view
                .criteria
                .mark_installed(&deployment.installed_criteria, &deployment.update_id)
            {
                return StepOutcome::failed(
                    crate::types::FailureClass::Transient,
                    crate::error::extended_codes::HANDLER,
                    format!("failed to record installed criteria: {e}"),
                );
            }
        }
        info!(update_id = %deployment.update_id, "simulated apply complete");
        if self.reboot_on_apply {
            StepOutcome::SuccessRebootRequired
        } else {
            StepOutcome::Success
        }
    }

    fn cancel(&self, _view: &WorkflowView<'_>) -> StepOutcome {
        StepOutcome::Success
    }

    fn restore(&self, view: &WorkflowView<'_>) -> StepOutcome {
        let criteria = &view.deployment.installed_criteria;
        if !criteria.is_empty()
            && let Err(e) = view.criteria.clear(criteria)
        {
            return StepOutcome::failed(
                crate::types::FailureClass::Fatal,
                crate::error::extended_codes::HANDLER,
                format!("failed to roll back installed criteria: {e}"),
            );
        }
        StepOutcome::Success
    }

    fn is_installed(&self, view: &WorkflowView<'_>) -> InstalledState {
        let criteria = &view.deployment.installed_criteria;
        if criteria.is_empty() {
            return InstalledState::Unknown;
        }
        match view.criteria.is_marked_installed(criteria) {
            Ok(true) => InstalledState::Installed,
            Ok(false) => InstalledState::NotInstalled,
            Err(_) => InstalledState::Unknown,
        }
    }
}
