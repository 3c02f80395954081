//! Installed-criteria ledger.
//!
//! Handlers record which criteria strings they have satisfied so that
//! `is_installed` probes and post-reboot evaluation stay cheap and
//! idempotent. The ledger is a JSON map persisted with the usual
//! temp-write-rename dance.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UpdateId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledEntry {
    pub update_id: UpdateId,
    pub installed_at: DateTime<Utc>,
}

/// File-backed map of installed-criteria strings.
#[derive(Debug, Clone)]
pub struct CriteriaLedger {
    path: PathBuf,
}

impl CriteriaLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the criteria string has been satisfied.
    pub fn is_marked_installed(&self, criteria: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(criteria))
    }

    /// The entry that satisfied a criteria string, if any.
    pub fn entry(&self, criteria: &str) -> Result<Option<InstalledEntry>> {
        Ok(self.read()?.remove(criteria))
    }

    /// Record a criteria string as satisfied by `update_id`.
    pub fn mark_installed(&self, criteria: &str, update_id: &UpdateId) -> Result<()> {
        let mut entries = self.read()?;
        entries.insert(
            criteria.to_string(),
            InstalledEntry {
                update_id: update_id.clone(),
                installed_at: Utc::now(),
            },
        );
        self.write(&entries)
    }

    /// Drop a criteria string (e.g. after a restore).
    pub fn clear(&self, criteria: &str) -> Result<()> {
        let mut entries = self.read()?;
        if entries.remove(criteria).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }

    fn read(&self) -> Result<BTreeMap<String, InstalledEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read ledger {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("corrupt ledger at {}", self.path.display()))
    }

    fn write(&self, entries: &BTreeMap<String, InstalledEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(entries).context("failed to serialize ledger")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync ledger")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename ledger to {}", self.path.display()))?;
        Ok(())
    }
}
