//! Agent configuration.
//!
//! The configuration document is JSON with every field defaulted, so an
//! empty object is a valid config. A document that fails to parse is a
//! fatal [`AgentError::Config`] surfaced to the host process.

use std::fs;
use std::path::{Path, PathBuf};

use overair_retry::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Per-phase retry policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicies {
    pub download: RetryPolicy,
    pub install: RetryPolicy,
    pub apply: RetryPolicy,
    /// Applied when the server reports throttling; its backoff is floored
    /// by the server-provided retry-after.
    pub throttle: RetryPolicy,
    pub post_reboot: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            download: RetryPolicy::transient_network(),
            install: RetryPolicy::transient_network(),
            apply: RetryPolicy::transient_network(),
            throttle: RetryPolicy::cloud_throttled(),
            post_reboot: RetryPolicy::post_reboot(),
        }
    }
}

/// Top-level agent configuration with the standard filesystem bases as
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Per-deployment sandboxes live under here.
    pub downloads_dir: PathBuf,
    /// Handler registration files and shared objects.
    pub extensions_dir: PathBuf,
    /// Source update cache base.
    pub cache_dir: PathBuf,
    /// Workflow persistence document.
    pub state_file: PathBuf,
    /// Installed-criteria ledger.
    pub installed_criteria_file: PathBuf,
    /// Root key trust store.
    pub root_key_file: PathBuf,
    /// Provisioned device key used to unwrap deployment DEKs.
    pub device_key_file: PathBuf,
    /// Audit log directory.
    pub log_dir: PathBuf,
    /// Size budget for the source update cache, in bytes.
    pub cache_size_cap_bytes: u64,
    /// Hash-mismatch retries before a download is declared failed.
    pub max_verification_retries: u32,
    /// Transient-failure retries per phase before the deployment fails.
    pub max_phase_retries: u32,
    /// Capacity of the work queue feeding the worker thread.
    pub work_queue_capacity: usize,
    pub retry: RetryPolicies,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("/var/lib/adu/downloads"),
            extensions_dir: PathBuf::from("/var/lib/adu/extensions/sources"),
            cache_dir: PathBuf::from("/var/lib/adu/sdc"),
            state_file: PathBuf::from("/var/lib/adu/workflow_state.json"),
            installed_criteria_file: PathBuf::from("/var/lib/adu/installedcriteria"),
            root_key_file: PathBuf::from("/var/lib/adu/rootkeys.json"),
            device_key_file: PathBuf::from("/var/lib/adu/device.key"),
            log_dir: PathBuf::from("/var/log/adu"),
            cache_size_cap_bytes: 1024 * 1024 * 1024,
            max_verification_retries: 3,
            max_phase_retries: 8,
            work_queue_capacity: 32,
            retry: RetryPolicies::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON document at `path`.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse a configuration document.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Rebase every path under `root`; used by tests and containerized
    /// deployments.
    pub fn rebased_under(root: &Path) -> Self {
        Self {
            downloads_dir: root.join("downloads"),
            extensions_dir: root.join("extensions/sources"),
            cache_dir: root.join("sdc"),
            state_file: root.join("workflow_state.json"),
            installed_criteria_file: root.join("installedcriteria"),
            root_key_file: root.join("rootkeys.json"),
            device_key_file: root.join("device.key"),
            log_dir: root.join("log"),
            ..Self::default()
        }
    }
}
