//! Workflow persistence.
//!
//! Before every transition's side effect the engine writes one JSON
//! document describing where the workflow stands; the write goes to a temp
//! file, is fsynced and renamed into place. On startup the record (when
//! present) is the sole source of truth for resuming after a reboot or an
//! agent restart. Terminal transitions delete it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::types::{
    AgentRestartState, StepOutcome, SystemRebootState, UpdateId, UpdateType, WorkflowStep,
};

/// Everything needed to resume a workflow after a crash, reboot, or agent
/// restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub workflow_step: WorkflowStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<StepOutcome>,
    /// The state most recently handed to the reporting channel.
    pub reported_state: WorkflowStep,
    pub system_reboot_state: SystemRebootState,
    pub agent_restart_state: AgentRestartState,
    pub expected_update_id: UpdateId,
    pub workflow_id: String,
    pub update_type: UpdateType,
    pub installed_criteria: String,
    pub work_folder: PathBuf,
    /// Last reported-properties payload, for re-reporting after a crash
    /// between persistence and the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_json: Option<String>,
    /// Full deployment document, so pre-apply phases can be re-entered
    /// with their file list intact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_json: Option<String>,
}

/// Store for the single workflow record at a well-known path.
#[derive(Debug, Clone)]
pub struct WorkflowStateStore {
    path: PathBuf,
}

impl WorkflowStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably write the record. The caller must not report or execute the
    /// transition's side effect until this returns.
    pub fn save(&self, record: &WorkflowRecord) -> Result<(), AgentError> {
        let io_err = |e: std::io::Error| AgentError::Persistence(e.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).map_err(io_err)?;
            file.write_all(json.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Load the record, or `None` when the agent shut down idle.
    pub fn load(&self) -> Result<Option<WorkflowRecord>, AgentError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        let record = serde_json::from_str(&content).map_err(|e| {
            AgentError::Persistence(format!("corrupt record at {}: {e}", self.path.display()))
        })?;
        Ok(Some(record))
    }

    /// Remove the record on a terminal transition.
    pub fn delete(&self) -> Result<(), AgentError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| AgentError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
