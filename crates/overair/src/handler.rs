//! Handler contract and registry.
//!
//! Each update type (e.g. `microsoft/swupdate:1`) maps to a handler
//! implementing the seven-operation contract. Handlers are resolved through
//! a registration file under the extensions directory and instantiated via
//! registered factories; one shared instance per update type, always
//! invoked from the worker thread.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::criteria::CriteriaLedger;
use crate::download::Downloader;
use crate::error::AgentError;
use crate::plugin::PluginRegistry;
use crate::types::{Deployment, FailureClass, FileEntity, InstalledState, StepOutcome, UpdateType};

/// Contract version spoken by a handler. Handlers without an explicit
/// contract are treated as v1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerContract {
    pub major_version: u32,
    pub minor_version: u32,
}

impl HandlerContract {
    pub const V1: HandlerContract = HandlerContract {
        major_version: 1,
        minor_version: 0,
    };
}

impl Default for HandlerContract {
    fn default() -> Self {
        Self::V1
    }
}

/// Handler-facing view of the workflow in flight.
///
/// Handlers may block on I/O; long operations must poll
/// [`WorkflowView::is_cancel_requested`].
pub struct WorkflowView<'a> {
    pub deployment: &'a Deployment,
    pub work_folder: &'a Path,
    pub cancel: &'a AtomicBool,
    pub criteria: &'a CriteriaLedger,
    pub downloader: &'a Downloader,
    pub plugins: &'a PluginRegistry,
    /// Provisioned device key for unwrapping content-protection DEKs.
    pub device_key_file: &'a Path,
}

impl WorkflowView<'_> {
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Sandbox path a payload file lands at.
    pub fn file_path(&self, file: &FileEntity) -> PathBuf {
        self.work_folder.join(&file.target_filename)
    }
}

/// The seven-operation handler contract.
///
/// Operations never unwind; every result comes back as a [`StepOutcome`].
impl std::fmt::Debug for dyn UpdateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn UpdateHandler")
    }
}

pub trait UpdateHandler: Send + Sync {
    /// All payload files present and hash-verified in the sandbox.
    fn download(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Capture enough device state for `restore` to undo `apply`.
    fn backup(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Stage the update without activating it.
    fn install(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Activate the update; may request a reboot through its result.
    fn apply(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Abort whatever step is in progress.
    fn cancel(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Return the device to the state captured by `backup`.
    fn restore(&self, view: &WorkflowView<'_>) -> StepOutcome;
    /// Evaluate the deployment's installed criteria.
    fn is_installed(&self, view: &WorkflowView<'_>) -> InstalledState;

    fn contract_info(&self) -> HandlerContract {
        HandlerContract::V1
    }
}

/// One entry in the registration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRegistration {
    /// Loadable module that provides the handler.
    pub lib_path: PathBuf,
    #[serde(default)]
    pub contract: HandlerContract,
}

/// Factory producing a handler instance for one update type.
pub type HandlerFactory = Box<dyn Fn() -> Arc<dyn UpdateHandler> + Send + Sync>;

/// Name of the registration file under the extensions directory.
pub const REGISTRATION_FILE: &str = "update_types.json";

/// Registry mapping update types to handler instances.
#[derive(Default)]
pub struct HandlerRegistry {
    extensions_dir: PathBuf,
    factories: Mutex<BTreeMap<String, HandlerFactory>>,
    instances: Mutex<BTreeMap<String, Arc<dyn UpdateHandler>>>,
}

impl HandlerRegistry {
    pub fn new(extensions_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            factories: Mutex::new(BTreeMap::new()),
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    fn registration_path(&self) -> PathBuf {
        self.extensions_dir.join(REGISTRATION_FILE)
    }

    /// Write (or update) the registration entry for an update type.
    pub fn register(
        &self,
        update_type: &UpdateType,
        registration: HandlerRegistration,
    ) -> Result<(), AgentError> {
        let mut entries = self.read_registrations()?;
        entries.insert(update_type.as_str().to_string(), registration);
        self.write_registrations(&entries)
    }

    /// The registration for an update type, if present.
    pub fn registration(
        &self,
        update_type: &UpdateType,
    ) -> Result<Option<HandlerRegistration>, AgentError> {
        Ok(self.read_registrations()?.remove(update_type.as_str()))
    }

    /// Install the in-process factory backing an update type's module.
    pub fn register_factory(&self, update_type: &UpdateType, factory: HandlerFactory) {
        self.factories
            .lock()
            .expect("factory table poisoned")
            .insert(update_type.as_str().to_string(), factory);
    }

    /// Resolve the shared handler instance for an update type.
    pub fn resolve(&self, update_type: &UpdateType) -> Result<Arc<dyn UpdateHandler>, AgentError> {
        if let Some(instance) = self
            .instances
            .lock()
            .expect("instance table poisoned")
            .get(update_type.as_str())
        {
            return Ok(Arc::clone(instance));
        }

        let registration = self.registration(update_type)?.ok_or_else(|| {
            AgentError::Handler {
                class: FailureClass::Fatal,
                extended_code: crate::error::extended_codes::HANDLER,
                message: format!("no handler registered for update type {update_type}"),
            }
        })?;
        if registration.contract.major_version != HandlerContract::V1.major_version {
            return Err(AgentError::Handler {
                class: FailureClass::Fatal,
                extended_code: crate::error::extended_codes::HANDLER,
                message: format!(
                    "handler for {update_type} speaks contract {}.{}, expected major {}",
                    registration.contract.major_version,
                    registration.contract.minor_version,
                    HandlerContract::V1.major_version
                ),
            });
        }

        let factories = self.factories.lock().expect("factory table poisoned");
        let factory = factories.get(update_type.as_str()).ok_or_else(|| {
            AgentError::Handler {
                class: FailureClass::Fatal,
                extended_code: crate::error::extended_codes::HANDLER,
                message: format!(
                    "registered module {} for {update_type} is not loadable",
                    registration.lib_path.display()
                ),
            }
        })?;
        let instance = factory();
        debug!(update_type = %update_type, "handler instantiated");
        self.instances
            .lock()
            .expect("instance table poisoned")
            .insert(update_type.as_str().to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    fn read_registrations(&self) -> Result<BTreeMap<String, HandlerRegistration>, AgentError> {
        let path = self.registration_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("corrupt registration file: {e}")))
    }

    fn write_registrations(
        &self,
        entries: &BTreeMap<String, HandlerRegistration>,
    ) -> Result<(), AgentError> {
        let path = self.registration_path();
        let io_err = |e: std::io::Error| AgentError::Config(e.to_string());
        fs::create_dir_all(&self.extensions_dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).map_err(io_err)?;
            file.write_all(json.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &path).map_err(io_err)?;
        Ok(())
    }
}
