//! Core domain types: deployments, workflow states, step results, and the
//! error taxonomy shared across the agent.
//!
//! Deployment documents arrive over the desired-properties channel as
//! camelCase JSON; everything here round-trips through serde with that
//! casing.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Identity of one update: provider, name, version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateId {
    pub provider: String,
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.name, self.version)
    }
}

/// Handler family and contract hint, e.g. `microsoft/swupdate:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateType(pub String);

impl UpdateType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `provider/name` part, without the trailing `:version`.
    pub fn family(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// The numeric suffix after `:`, when present and well-formed.
    pub fn version_hint(&self) -> Option<u32> {
        self.0.split(':').nth(1)?.parse().ok()
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A declared hash of a payload file. `value` is the base64 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    #[serde(rename = "type")]
    pub hash_type: String,
    pub value: String,
}

/// Link from a delta payload to the cached source it is built from.
///
/// `source_hash` is the lowercase hex digest keying the source update
/// cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedFile {
    pub source_hash: String,
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler_id: Option<String>,
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

/// One payload file of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntity {
    pub file_id: String,
    pub target_filename: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    pub hashes: Vec<FileHash>,
    pub download_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<RelatedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler_id: Option<String>,
}

impl FileEntity {
    /// The declared digest for a given algorithm, if any.
    pub fn hash_for(&self, hash_type: &str) -> Option<&str> {
        self.hashes
            .iter()
            .find(|h| h.hash_type.eq_ignore_ascii_case(hash_type))
            .map(|h| h.value.as_str())
    }
}

/// Encrypted content key material attached to a deployment.
///
/// The decrypted DEK never appears here; see [`crate::content`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentProtection {
    /// Base64 of nonce-prefixed, key-encrypted DEK.
    pub encrypted_dek: String,
    pub algorithm: String,
    pub mode: String,
    pub key_length: u32,
}

/// One step of a multi-step deployment, executed by a `components`-family
/// handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStep {
    pub handler: UpdateType,
    #[serde(default)]
    pub files: Vec<String>,
}

/// A deployment targeted at this device, as delivered over the
/// desired-properties channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub workflow_id: String,
    pub update_id: UpdateId,
    pub update_type: UpdateType,
    #[serde(default)]
    pub installed_criteria: String,
    pub files: Vec<FileEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_protection: Option<ContentProtection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<DeploymentStep>>,
}

impl Deployment {
    /// Parse a desired-properties document. Malformed input is a
    /// [`AgentError::Config`] (fatal for that deployment, never retried).
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        let deployment: Deployment = serde_json::from_str(json)
            .map_err(|e| AgentError::Config(format!("malformed deployment document: {e}")))?;
        if deployment.workflow_id.is_empty() {
            return Err(AgentError::Config("deployment without workflowId".into()));
        }
        if deployment.files.is_empty() && deployment.steps.is_none() {
            return Err(AgentError::Config(format!(
                "deployment {} carries neither files nor steps",
                deployment.workflow_id
            )));
        }
        Ok(deployment)
    }
}

/// Workflow phases. At most one deployment is ever in a non-`Idle` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowStep {
    #[default]
    Idle,
    DeploymentInProgress,
    DownloadStarted,
    DownloadSucceeded,
    InstallStarted,
    InstallSucceeded,
    ApplyStarted,
    ApplySucceeded,
    Failed,
    Cancelled,
}

impl WorkflowStep {
    /// Terminal states end the deployment and return the agent to idle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStep::ApplySucceeded | WorkflowStep::Failed | WorkflowStep::Cancelled
        )
    }
}

/// Whether the device must reboot to finish an apply, and where that
/// reboot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemRebootState {
    #[default]
    None,
    Required,
    Rebooting,
}

/// Agent-restart analogue of [`SystemRebootState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentRestartState {
    #[default]
    None,
    Required,
    Restarting,
}

/// Verdict of a handler's `is_installed` probe against the deployment's
/// installed criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstalledState {
    Installed,
    NotInstalled,
    Unknown,
}

/// How a failed step should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    /// Retried under the phase's policy.
    Transient,
    /// Ends the deployment.
    Fatal,
}

/// Result of one handler operation. No unwinding crosses the handler
/// boundary; everything comes back as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StepOutcome {
    Success,
    /// Update staged; the device must reboot before it is active.
    SuccessRebootRequired,
    /// Update staged; the agent process must restart.
    SuccessRestartRequired,
    Failed {
        class: FailureClass,
        extended_code: u32,
        message: String,
    },
    Cancelled,
}

impl StepOutcome {
    pub fn failed(class: FailureClass, extended_code: u32, message: impl Into<String>) -> Self {
        StepOutcome::Failed {
            class,
            extended_code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StepOutcome::Success
                | StepOutcome::SuccessRebootRequired
                | StepOutcome::SuccessRestartRequired
        )
    }
}

/// Result codes carried on the reported-properties channel.
pub mod result_codes {
    /// Non-terminal progress report.
    pub const IN_PROGRESS: u32 = 102;
    pub const SUCCESS: u32 = 200;
    pub const SUCCESS_REBOOT_REQUIRED: u32 = 202;
    pub const SUCCESS_RESTART_REQUIRED: u32 = 203;
    pub const CANCELLED: u32 = 410;
    pub const FAILED: u32 = 500;
}

/// One message on the outbound reported-properties channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedState {
    pub workflow_id: String,
    pub state: WorkflowStep,
    pub result_code: u32,
    pub extended_result_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_update_id: Option<UpdateId>,
}
