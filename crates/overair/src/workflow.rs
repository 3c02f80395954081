//! The update workflow state machine.
//!
//! Drives one deployment from reception through download, install, apply,
//! and reporting. Every transition is persisted before its side effect is
//! reported, so recovery after a crash or reboot never double-reports
//! success. Retry waits are tick-driven: the engine never sleeps on the
//! worker thread, it records when the next attempt is due and yields.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use overair_retry::RetryPolicy;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::criteria::CriteriaLedger;
use crate::download::Downloader;
use crate::error::{AgentError, extended_codes};
use crate::handler::{HandlerRegistry, UpdateHandler, WorkflowView};
use crate::persistence::{WorkflowRecord, WorkflowStateStore};
use crate::plugin::PluginRegistry;
use crate::report::{CloudReporter, ReportLog};
use crate::sandbox;
use crate::types::{
    AgentRestartState, Deployment, FailureClass, InstalledState, ReportedState, StepOutcome,
    SystemRebootState, UpdateId, WorkflowStep, result_codes,
};
use crate::verify;

/// Current workflow id shared with the transport threads, so `Cancel` can
/// be routed without taking the engine lock.
pub type SharedWorkflowId = Arc<Mutex<Option<String>>>;

/// The deployment currently owning the pipeline.
struct ActiveWorkflow {
    deployment: Deployment,
    step: WorkflowStep,
    work_folder: PathBuf,
    retry_policy: RetryPolicy,
    retry_count: u32,
    verification_retries: u32,
    next_attempt_at: Option<u64>,
    reboot_state: SystemRebootState,
    restart_state: AgentRestartState,
    last_outcome: Option<StepOutcome>,
    last_reported: WorkflowStep,
    backup_done: bool,
}

/// The workflow engine. Single-threaded by construction: every method runs
/// on the worker thread, with only the cancel flag and the shared workflow
/// id crossing threads.
pub struct WorkflowEngine {
    config: AgentConfig,
    registry: Arc<HandlerRegistry>,
    plugins: Arc<PluginRegistry>,
    store: WorkflowStateStore,
    reporter: Box<dyn CloudReporter>,
    report_log: ReportLog,
    downloader: Downloader,
    criteria: CriteriaLedger,
    cancel: Arc<AtomicBool>,
    shared_workflow_id: SharedWorkflowId,
    current: Option<ActiveWorkflow>,
}

fn now_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl WorkflowEngine {
    pub fn new(
        config: AgentConfig,
        registry: Arc<HandlerRegistry>,
        plugins: Arc<PluginRegistry>,
        reporter: Box<dyn CloudReporter>,
    ) -> Result<Self, AgentError> {
        let downloader =
            Downloader::new(config.retry.download.clone(), config.retry.throttle.clone())?;
        let store = WorkflowStateStore::new(&config.state_file);
        let report_log = ReportLog::in_dir(&config.log_dir);
        let criteria = CriteriaLedger::new(&config.installed_criteria_file);
        Ok(Self {
            config,
            registry,
            plugins,
            store,
            reporter,
            report_log,
            downloader,
            criteria,
            cancel: Arc::new(AtomicBool::new(false)),
            shared_workflow_id: Arc::new(Mutex::new(None)),
            current: None,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancel flag shared with handlers and the transport threads.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Shared current-workflow-id cell for the façade.
    pub fn shared_workflow_id(&self) -> SharedWorkflowId {
        Arc::clone(&self.shared_workflow_id)
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn current_workflow_id(&self) -> Option<&str> {
        self.current
            .as_ref()
            .map(|a| a.deployment.workflow_id.as_str())
    }

    /// Whether the last apply asked the host to reboot the device.
    pub fn reboot_requested(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|a| a.reboot_state == SystemRebootState::Rebooting)
    }

    /// Whether the last apply asked the host to restart the agent.
    pub fn restart_requested(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|a| a.restart_state == AgentRestartState::Restarting)
    }

    /// When the next retry attempt is due, if one is scheduled.
    pub fn pending_retry_at(&self) -> Option<u64> {
        self.current.as_ref().and_then(|a| a.next_attempt_at)
    }

    /// Entry point for a deployment delivered over the desired-properties
    /// channel.
    ///
    /// While a different deployment is in flight the new one is rejected;
    /// redelivery of the current one is an idempotent no-op.
    pub fn on_deployment_received(&mut self, deployment: Deployment) {
        if let Some(active) = &self.current {
            if active.deployment.workflow_id == deployment.workflow_id {
                debug!(workflow_id = %deployment.workflow_id, "deployment redelivered, ignoring");
            } else {
                warn!(
                    active = %active.deployment.workflow_id,
                    rejected = %deployment.workflow_id,
                    "deployment rejected: another workflow is in flight"
                );
            }
            return;
        }

        info!(
            workflow_id = %deployment.workflow_id,
            update_id = %deployment.update_id,
            update_type = %deployment.update_type,
            "deployment received"
        );
        self.cancel.store(false, Ordering::Release);

        let work_folder =
            match sandbox::create(&self.config.downloads_dir, &deployment.workflow_id) {
                Ok(folder) => folder,
                Err(e) => {
                    self.report_rejected(&deployment, &format!("sandbox creation failed: {e}"));
                    return;
                }
            };

        *self
            .shared_workflow_id
            .lock()
            .expect("workflow id cell poisoned") = Some(deployment.workflow_id.clone());
        self.current = Some(ActiveWorkflow {
            retry_policy: self.config.retry.download.clone(),
            deployment,
            step: WorkflowStep::DeploymentInProgress,
            work_folder,
            retry_count: 0,
            verification_retries: 0,
            next_attempt_at: None,
            reboot_state: SystemRebootState::None,
            restart_state: AgentRestartState::None,
            last_outcome: None,
            last_reported: WorkflowStep::Idle,
            backup_done: false,
        });
        if let Err(e) = self.transition(
            WorkflowStep::DeploymentInProgress,
            result_codes::IN_PROGRESS,
            0,
            None,
        ) {
            self.fail_terminal(e.into_outcome());
            return;
        }

        let handler = match self.resolve_current_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.fail_terminal(e.into_outcome());
                return;
            }
        };
        let installed = self
            .with_view(|view| handler.is_installed(view))
            .unwrap_or(InstalledState::Unknown);
        match installed {
            InstalledState::Installed => {
                // Idempotency short-circuit: no handler mutation operations.
                info!("update already installed; reporting success without side effects");
                let installed_id = self.current_update_id();
                let _ = self.transition(
                    WorkflowStep::ApplySucceeded,
                    result_codes::SUCCESS,
                    0,
                    installed_id.clone(),
                );
                self.terminal_cleanup(result_codes::SUCCESS, 0, installed_id);
            }
            InstalledState::NotInstalled | InstalledState::Unknown => {
                if self.enter_phase(WorkflowStep::DownloadStarted) {
                    self.advance();
                }
            }
        }
    }

    /// Drive time-based retries. Called by the façade on every tick.
    pub fn tick(&mut self, now_epoch_secs: u64) {
        let due_now = {
            let Some(active) = self.current.as_mut() else {
                return;
            };
            if active.reboot_state == SystemRebootState::Rebooting {
                return;
            }
            match active.next_attempt_at {
                Some(due) if now_epoch_secs >= due => {
                    active.next_attempt_at = None;
                    debug!(step = ?active.step, "retry due, re-entering phase");
                    true
                }
                _ => false,
            }
        };
        if due_now {
            self.advance();
        }
    }

    /// Cooperative cancellation of the named workflow.
    pub fn cancel(&mut self, workflow_id: &str) {
        let Some(active) = self.current.as_ref() else {
            debug!(workflow_id, "cancel ignored: agent idle");
            return;
        };
        if active.deployment.workflow_id != workflow_id {
            warn!(
                workflow_id,
                active = %active.deployment.workflow_id,
                "cancel ignored: unknown workflow"
            );
            self.cancel.store(false, Ordering::Release);
            return;
        }
        if active.reboot_state == SystemRebootState::Rebooting {
            // A persisted reboot request is past the point of no return.
            debug!(workflow_id, "cancel ignored: reboot already persisted");
            self.cancel.store(false, Ordering::Release);
            return;
        }
        info!(workflow_id, "cancelling deployment");
        self.cancel.store(true, Ordering::Release);
        if let Ok(handler) = self.resolve_current_handler() {
            let _ = self.with_view(|view| handler.cancel(view));
        }
        self.cancelled_terminal();
    }

    /// Rebuild state from the persistence record after a reboot or agent
    /// restart.
    pub fn resume(&mut self) -> Result<(), AgentError> {
        let Some(record) = self.store.load()? else {
            return Ok(());
        };
        if record.workflow_step.is_terminal() || record.workflow_step == WorkflowStep::Idle {
            // Crash after the terminal transition but before cleanup.
            self.store.delete()?;
            return Ok(());
        }

        info!(
            workflow_id = %record.workflow_id,
            step = ?record.workflow_step,
            reboot = ?record.system_reboot_state,
            "resuming persisted workflow"
        );
        let deployment = match &record.deployment_json {
            Some(json) => Deployment::from_json(json).unwrap_or_else(|e| {
                warn!("persisted deployment document unusable ({e}); resuming with skeleton");
                skeleton_deployment(&record)
            }),
            None => skeleton_deployment(&record),
        };

        let rebooted = record.workflow_step == WorkflowStep::ApplyStarted
            && record.system_reboot_state == SystemRebootState::Rebooting;

        *self
            .shared_workflow_id
            .lock()
            .expect("workflow id cell poisoned") = Some(record.workflow_id.clone());
        self.current = Some(ActiveWorkflow {
            deployment,
            step: normalized_resume_step(record.workflow_step),
            work_folder: record.work_folder.clone(),
            retry_policy: self.config.retry.post_reboot.clone(),
            retry_count: 0,
            verification_retries: 0,
            next_attempt_at: None,
            reboot_state: SystemRebootState::None,
            restart_state: AgentRestartState::Restarting,
            last_outcome: record.last_result.clone(),
            last_reported: record.reported_state,
            backup_done: matches!(
                record.workflow_step,
                WorkflowStep::InstallSucceeded | WorkflowStep::ApplyStarted
            ),
        });

        if rebooted {
            self.evaluate_post_reboot();
            return Ok(());
        }

        // Crash between persistence and report is recovered by
        // re-reporting the recorded payload.
        if let Some(json) = &record.reporting_json
            && let Ok(report) = serde_json::from_str::<ReportedState>(json)
        {
            if let Err(e) = self.reporter.report(&report) {
                warn!("re-report after restart failed: {e}");
            }
        }

        // Re-enter the phase conservatively, on the post-reboot policy.
        if let Some(active) = self.current.as_mut() {
            active.next_attempt_at = Some(overair_retry::next_attempt_at(
                &self.config.retry.post_reboot,
                0,
                now_epoch(),
            ));
        }
        Ok(())
    }

    /// A persisted `ApplyStarted` + `rebooting` record means the device
    /// came back from an update reboot; the installed criteria decide
    /// success.
    fn evaluate_post_reboot(&mut self) {
        let handler = match self.resolve_current_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.fail_terminal(e.into_outcome());
                return;
            }
        };
        let installed = self
            .with_view(|view| handler.is_installed(view))
            .unwrap_or(InstalledState::Unknown);
        match installed {
            InstalledState::Installed => {
                info!("update active after reboot");
                self.finish_success();
            }
            InstalledState::NotInstalled | InstalledState::Unknown => {
                warn!("update not active after reboot");
                self.fail_terminal(StepOutcome::failed(
                    FailureClass::Fatal,
                    extended_codes::VERIFICATION,
                    "update not active after reboot",
                ));
            }
        }
    }

    /// Run phases until the workflow waits, parks for reboot, or ends.
    fn advance(&mut self) {
        loop {
            let Some(active) = self.current.as_ref() else {
                return;
            };
            if active.next_attempt_at.is_some()
                || active.reboot_state == SystemRebootState::Rebooting
            {
                return;
            }
            let keep_going = match active.step {
                WorkflowStep::DownloadStarted => self.run_download(),
                WorkflowStep::InstallStarted => self.run_install(),
                WorkflowStep::ApplyStarted => self.run_apply(),
                _ => false,
            };
            if !keep_going {
                return;
            }
        }
    }

    fn run_download(&mut self) -> bool {
        let handler = match self.resolve_current_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.fail_terminal(e.into_outcome());
                return false;
            }
        };
        let outcome = self
            .with_view(|view| handler.download(view))
            .unwrap_or(StepOutcome::Cancelled);
        if self.cancel.load(Ordering::Acquire) {
            self.cancelled_terminal();
            return false;
        }
        match outcome {
            outcome if outcome.is_success() => match self.verify_sandbox_files() {
                Ok(true) => {
                    if self
                        .transition(WorkflowStep::DownloadSucceeded, result_codes::IN_PROGRESS, 0, None)
                        .is_err()
                    {
                        self.fail_persistence();
                        return false;
                    }
                    self.enter_phase(WorkflowStep::InstallStarted)
                }
                Ok(false) => {
                    self.schedule_verification_retry();
                    false
                }
                Err(e) if e.is_transient() => {
                    self.schedule_phase_retry(e.into_outcome());
                    false
                }
                Err(e) => {
                    self.fail_terminal(e.into_outcome());
                    false
                }
            },
            StepOutcome::Failed {
                class: FailureClass::Transient,
                ..
            } => {
                self.schedule_phase_retry(outcome);
                false
            }
            StepOutcome::Failed { .. } => {
                self.fail_terminal(outcome);
                false
            }
            StepOutcome::Cancelled => {
                self.cancelled_terminal();
                false
            }
            StepOutcome::Success
            | StepOutcome::SuccessRebootRequired
            | StepOutcome::SuccessRestartRequired => unreachable!("successes matched above"),
        }
    }

    fn run_install(&mut self) -> bool {
        let handler = match self.resolve_current_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.fail_terminal(e.into_outcome());
                return false;
            }
        };

        if !self.current.as_ref().is_some_and(|a| a.backup_done) {
            let backup = self
                .with_view(|view| handler.backup(view))
                .unwrap_or(StepOutcome::Cancelled);
            if !backup.is_success() {
                self.fail_terminal(backup);
                return false;
            }
            if let Some(active) = self.current.as_mut() {
                active.backup_done = true;
            }
        }

        let outcome = self
            .with_view(|view| handler.install(view))
            .unwrap_or(StepOutcome::Cancelled);
        if self.cancel.load(Ordering::Acquire) {
            self.cancelled_terminal();
            return false;
        }
        match outcome {
            outcome if outcome.is_success() => {
                if self
                    .transition(WorkflowStep::InstallSucceeded, result_codes::IN_PROGRESS, 0, None)
                    .is_err()
                {
                    self.fail_persistence();
                    return false;
                }
                self.enter_phase(WorkflowStep::ApplyStarted)
            }
            StepOutcome::Failed {
                class: FailureClass::Transient,
                ..
            } => {
                self.schedule_phase_retry(outcome);
                false
            }
            StepOutcome::Failed { .. } => {
                self.fail_terminal(outcome);
                false
            }
            StepOutcome::Cancelled => {
                self.cancelled_terminal();
                false
            }
            _ => unreachable!("successes matched above"),
        }
    }

    fn run_apply(&mut self) -> bool {
        let handler = match self.resolve_current_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.fail_terminal(e.into_outcome());
                return false;
            }
        };
        let outcome = self
            .with_view(|view| handler.apply(view))
            .unwrap_or(StepOutcome::Cancelled);
        if self.cancel.load(Ordering::Acquire) {
            // Cancel won the race against the reboot request; nothing has
            // been persisted as rebooting yet.
            self.cancelled_terminal();
            return false;
        }
        match outcome {
            StepOutcome::Success => {
                self.finish_success();
                false
            }
            StepOutcome::SuccessRebootRequired => {
                info!("apply complete, reboot required");
                if let Some(active) = self.current.as_mut() {
                    active.reboot_state = SystemRebootState::Rebooting;
                    active.last_outcome = Some(StepOutcome::SuccessRebootRequired);
                }
                if self
                    .transition(
                        WorkflowStep::ApplyStarted,
                        result_codes::SUCCESS_REBOOT_REQUIRED,
                        0,
                        None,
                    )
                    .is_err()
                {
                    self.fail_persistence();
                }
                false
            }
            StepOutcome::SuccessRestartRequired => {
                info!("apply complete, agent restart required");
                if let Some(active) = self.current.as_mut() {
                    active.restart_state = AgentRestartState::Restarting;
                    active.last_outcome = Some(StepOutcome::SuccessRestartRequired);
                }
                if self
                    .transition(
                        WorkflowStep::ApplyStarted,
                        result_codes::SUCCESS_RESTART_REQUIRED,
                        0,
                        None,
                    )
                    .is_err()
                {
                    self.fail_persistence();
                }
                false
            }
            StepOutcome::Failed {
                class: FailureClass::Transient,
                ..
            } => {
                self.schedule_phase_retry(outcome);
                false
            }
            StepOutcome::Failed { .. } => {
                warn!("apply failed fatally; restoring");
                let restore = self
                    .with_view(|view| handler.restore(view))
                    .unwrap_or(StepOutcome::Cancelled);
                if !restore.is_success() {
                    error!("restore after failed apply did not succeed: {restore:?}");
                }
                self.fail_terminal(outcome);
                false
            }
            StepOutcome::Cancelled => {
                self.cancelled_terminal();
                false
            }
        }
    }

    /// All payload files present with a matching hash. Deletes offenders.
    fn verify_sandbox_files(&mut self) -> Result<bool, AgentError> {
        let Some(active) = self.current.as_ref() else {
            return Ok(false);
        };
        let mut all_valid = true;
        for file in &active.deployment.files {
            let path = active.work_folder.join(&file.target_filename);
            if !path.is_file() {
                warn!(file = %file.target_filename, "payload missing from sandbox");
                all_valid = false;
                continue;
            }
            if !verify::is_hash_valid(&path, &file.hashes)? {
                warn!(file = %file.target_filename, "payload hash mismatch, deleting");
                let _ = std::fs::remove_file(&path);
                all_valid = false;
            }
        }
        Ok(all_valid)
    }

    /// Enter a phase: reset the counters, pick the policy, persist, report.
    fn enter_phase(&mut self, step: WorkflowStep) -> bool {
        let policy = match step {
            WorkflowStep::DownloadStarted => self.config.retry.download.clone(),
            WorkflowStep::InstallStarted => self.config.retry.install.clone(),
            WorkflowStep::ApplyStarted => self.config.retry.apply.clone(),
            _ => self.config.retry.download.clone(),
        };
        if let Some(active) = self.current.as_mut() {
            active.step = step;
            active.retry_count = 0;
            active.verification_retries = 0;
            active.next_attempt_at = None;
            active.retry_policy = policy;
        }
        if self
            .transition(step, result_codes::IN_PROGRESS, 0, None)
            .is_err()
        {
            self.fail_persistence();
            return false;
        }
        true
    }

    fn schedule_phase_retry(&mut self, outcome: StepOutcome) {
        let max_retries = self.config.max_phase_retries;
        let Some(active) = self.current.as_mut() else {
            return;
        };
        active.retry_count += 1;
        active.last_outcome = Some(outcome.clone());
        if active.retry_count > max_retries {
            warn!(
                retries = active.retry_count - 1,
                "phase retry budget exhausted"
            );
            let escalated = match outcome {
                StepOutcome::Failed {
                    extended_code,
                    message,
                    ..
                } => StepOutcome::failed(
                    FailureClass::Fatal,
                    extended_code,
                    format!("{message} (retry budget exhausted)"),
                ),
                other => other,
            };
            self.fail_terminal(escalated);
            return;
        }
        let due = overair_retry::next_attempt_at(
            &active.retry_policy,
            active.retry_count,
            now_epoch(),
        );
        active.next_attempt_at = Some(due);
        debug!(
            attempt = active.retry_count,
            due, "transient failure, retry scheduled"
        );
        self.persist_best_effort();
    }

    fn schedule_verification_retry(&mut self) {
        let max_retries = self.config.max_verification_retries;
        let download_policy = self.config.retry.download.clone();
        let Some(active) = self.current.as_mut() else {
            return;
        };
        active.verification_retries += 1;
        if active.verification_retries > max_retries {
            self.fail_terminal(StepOutcome::failed(
                FailureClass::Fatal,
                extended_codes::VERIFICATION,
                "payload verification failed after retries",
            ));
            return;
        }
        let attempt = active.verification_retries;
        active.next_attempt_at = Some(overair_retry::next_attempt_at(
            &download_policy,
            attempt,
            now_epoch(),
        ));
        warn!(attempt, "payload verification failed, retry scheduled");
        self.persist_best_effort();
    }

    fn finish_success(&mut self) {
        if let Some(active) = self.current.as_mut() {
            active.last_outcome = Some(StepOutcome::Success);
        }
        let installed_id = self.current_update_id();
        let _ = self.transition(
            WorkflowStep::ApplySucceeded,
            result_codes::SUCCESS,
            0,
            installed_id.clone(),
        );
        self.with_view(|view| {
            view.plugins.notify_workflow_completed(view);
        });
        self.terminal_cleanup(result_codes::SUCCESS, 0, installed_id);
    }

    fn fail_terminal(&mut self, outcome: StepOutcome) {
        let extended = match &outcome {
            StepOutcome::Failed { extended_code, .. } => *extended_code,
            _ => 0,
        };
        if let StepOutcome::Failed { message, .. } = &outcome {
            error!("deployment failed (extended {extended:#x}): {message}");
        }
        if let Some(active) = self.current.as_mut() {
            active.last_outcome = Some(outcome);
        }
        let _ = self.transition(WorkflowStep::Failed, result_codes::FAILED, extended, None);
        self.terminal_cleanup(result_codes::FAILED, extended, None);
    }

    fn cancelled_terminal(&mut self) {
        info!("deployment cancelled");
        if let Some(active) = self.current.as_mut() {
            active.last_outcome = Some(StepOutcome::Cancelled);
        }
        let _ = self.transition(WorkflowStep::Cancelled, result_codes::CANCELLED, 0, None);
        self.terminal_cleanup(result_codes::CANCELLED, 0, None);
    }

    /// Persistence is load-bearing; when it breaks, the only safe move is
    /// to fail the deployment.
    fn fail_persistence(&mut self) {
        self.fail_terminal(StepOutcome::failed(
            FailureClass::Fatal,
            extended_codes::PERSISTENCE,
            "failed to persist workflow state",
        ));
    }

    /// Drop the workflow, delete its record and sandbox, and report the
    /// return to idle.
    fn terminal_cleanup(
        &mut self,
        result_code: u32,
        extended_result_code: u32,
        installed_update_id: Option<UpdateId>,
    ) {
        let Some(active) = self.current.take() else {
            return;
        };
        if let Err(e) = self.store.delete() {
            error!("failed to delete workflow record: {e}");
        }
        if let Err(e) = sandbox::remove(&active.work_folder) {
            warn!("failed to remove sandbox: {e}");
        }
        *self
            .shared_workflow_id
            .lock()
            .expect("workflow id cell poisoned") = None;
        self.cancel.store(false, Ordering::Release);

        let report = ReportedState {
            workflow_id: active.deployment.workflow_id,
            state: WorkflowStep::Idle,
            result_code,
            extended_result_code,
            installed_update_id,
        };
        if let Err(e) = self.reporter.report(&report) {
            warn!("failed to report idle state: {e}");
        }
        if let Err(e) = self.report_log.append(&report) {
            warn!("failed to append idle report to audit log: {e}");
        }
    }

    /// Persist the record for `state`, then emit the report. Persistence
    /// happens-before the report so recovery can re-derive and re-report.
    fn transition(
        &mut self,
        state: WorkflowStep,
        result_code: u32,
        extended_result_code: u32,
        installed_update_id: Option<UpdateId>,
    ) -> Result<(), AgentError> {
        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };
        active.step = state;
        active.last_reported = state;
        let report = ReportedState {
            workflow_id: active.deployment.workflow_id.clone(),
            state,
            result_code,
            extended_result_code,
            installed_update_id,
        };
        let reporting_json = serde_json::to_string(&report).ok();
        let record = build_record(active, reporting_json);
        self.store.save(&record)?;

        if let Err(e) = self.reporter.report(&report) {
            // The record carries the payload; resume re-reports it.
            warn!("failed to report state {state:?}: {e}");
        }
        if let Err(e) = self.report_log.append(&report) {
            warn!("failed to append report to audit log: {e}");
        }
        Ok(())
    }

    fn persist_best_effort(&mut self) {
        let Some(active) = self.current.as_ref() else {
            return;
        };
        let record = build_record(active, None);
        if let Err(e) = self.store.save(&record) {
            error!("failed to persist retry bookkeeping: {e}");
        }
    }

    fn report_rejected(&mut self, deployment: &Deployment, reason: &str) {
        error!(workflow_id = %deployment.workflow_id, "deployment not started: {reason}");
        let report = ReportedState {
            workflow_id: deployment.workflow_id.clone(),
            state: WorkflowStep::Failed,
            result_code: result_codes::FAILED,
            extended_result_code: extended_codes::CONFIG,
            installed_update_id: None,
        };
        if let Err(e) = self.reporter.report(&report) {
            warn!("failed to report rejection: {e}");
        }
        let _ = self.report_log.append(&report);
    }

    fn resolve_current_handler(&self) -> Result<Arc<dyn UpdateHandler>, AgentError> {
        let Some(active) = self.current.as_ref() else {
            return Err(AgentError::Handler {
                class: FailureClass::Fatal,
                extended_code: extended_codes::HANDLER,
                message: "no active workflow".into(),
            });
        };
        self.registry.resolve(&active.deployment.update_type)
    }

    fn current_update_id(&self) -> Option<UpdateId> {
        self.current
            .as_ref()
            .map(|a| a.deployment.update_id.clone())
    }

    fn with_view<R>(&self, f: impl FnOnce(&WorkflowView<'_>) -> R) -> Option<R> {
        let active = self.current.as_ref()?;
        let view = WorkflowView {
            deployment: &active.deployment,
            work_folder: &active.work_folder,
            cancel: &self.cancel,
            criteria: &self.criteria,
            downloader: &self.downloader,
            plugins: &self.plugins,
            device_key_file: &self.config.device_key_file,
        };
        Some(f(&view))
    }
}

fn build_record(active: &ActiveWorkflow, reporting_json: Option<String>) -> WorkflowRecord {
    WorkflowRecord {
        workflow_step: active.step,
        last_result: active.last_outcome.clone(),
        reported_state: active.last_reported,
        system_reboot_state: active.reboot_state,
        agent_restart_state: active.restart_state,
        expected_update_id: active.deployment.update_id.clone(),
        workflow_id: active.deployment.workflow_id.clone(),
        update_type: active.deployment.update_type.clone(),
        installed_criteria: active.deployment.installed_criteria.clone(),
        work_folder: active.work_folder.clone(),
        reporting_json,
        deployment_json: serde_json::to_string(&active.deployment).ok(),
    }
}

/// Minimal deployment rebuilt from a record whose full document was lost.
fn skeleton_deployment(record: &WorkflowRecord) -> Deployment {
    Deployment {
        workflow_id: record.workflow_id.clone(),
        update_id: record.expected_update_id.clone(),
        update_type: record.update_type.clone(),
        installed_criteria: record.installed_criteria.clone(),
        files: Vec::new(),
        content_protection: None,
        steps: None,
    }
}

/// Map between-phase and entry states onto the phase to re-enter.
fn normalized_resume_step(step: WorkflowStep) -> WorkflowStep {
    match step {
        WorkflowStep::DeploymentInProgress => WorkflowStep::DownloadStarted,
        WorkflowStep::DownloadSucceeded => WorkflowStep::InstallStarted,
        WorkflowStep::InstallSucceeded => WorkflowStep::ApplyStarted,
        other => other,
    }
}
