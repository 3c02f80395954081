//! Per-deployment download sandboxes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Sandbox directory for a workflow, `<downloads>/<workflowId>`.
pub fn work_folder(downloads_dir: &Path, workflow_id: &str) -> Result<PathBuf> {
    if workflow_id.is_empty()
        || workflow_id == "."
        || workflow_id == ".."
        || workflow_id.contains(['/', '\\'])
    {
        bail!("workflow id {workflow_id:?} is not usable as a path component");
    }
    Ok(downloads_dir.join(workflow_id))
}

/// Create the sandbox, returning its path.
pub fn create(downloads_dir: &Path, workflow_id: &str) -> Result<PathBuf> {
    let folder = work_folder(downloads_dir, workflow_id)?;
    fs::create_dir_all(&folder)
        .with_context(|| format!("failed to create sandbox {}", folder.display()))?;
    Ok(folder)
}

/// Remove the sandbox and everything in it. Missing sandboxes are fine.
pub fn remove(folder: &Path) -> Result<()> {
    if folder.exists() {
        fs::remove_dir_all(folder)
            .with_context(|| format!("failed to remove sandbox {}", folder.display()))?;
    }
    Ok(())
}
