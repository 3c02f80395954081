//! Outbound reporting: the reported-properties channel and the local
//! audit trail.
//!
//! The cloud transport is a collaborator; the core only sees the
//! [`CloudReporter`] trait. Every report additionally lands in an
//! append-only JSONL audit log so a fleet operator can reconstruct what the
//! device claimed and when.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ReportedState;

/// Sink for the reported-properties channel.
pub trait CloudReporter: Send {
    fn report(&mut self, state: &ReportedState) -> Result<()>;
}

/// One audit line: what was reported, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub report: ReportedState,
}

/// Append-only JSONL log of reported states.
#[derive(Debug, Clone)]
pub struct ReportLog {
    path: PathBuf,
}

pub const REPORT_LOG_FILE: &str = "reports.jsonl";

impl ReportLog {
    /// Log under the agent's log directory.
    pub fn in_dir(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(REPORT_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    pub fn append(&self, report: &ReportedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let entry = ReportEntry {
            timestamp: Utc::now(),
            report: report.clone(),
        };
        let line = serde_json::to_string(&entry).context("failed to serialize report entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open report log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Read the whole audit trail back.
    pub fn read_all(&self) -> Result<Vec<ReportEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read report log {}", self.path.display()))?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let entry = serde_json::from_str(line)
                .with_context(|| format!("corrupt report log line: {line}"))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Reporter that only writes the audit log; used when the device runs
/// without a live transport (provisioning, bench tests, CLI one-shots).
#[derive(Debug, Clone)]
pub struct JsonlReporter {
    log: ReportLog,
}

impl JsonlReporter {
    pub fn new(log: ReportLog) -> Self {
        Self { log }
    }
}

impl CloudReporter for JsonlReporter {
    fn report(&mut self, state: &ReportedState) -> Result<()> {
        self.log.append(state)
    }
}
