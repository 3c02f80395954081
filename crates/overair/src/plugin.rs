//! Download handler plugins.
//!
//! A payload file may name a `downloadHandlerId`; the matching plugin gets
//! the first shot at producing that file, typically by rebuilding it from a
//! cached source payload instead of fetching it over the network. After a
//! successful workflow the plugins are notified so they can seed the source
//! cache with the payloads that just landed.

use std::path::Path;

use anyhow::Result;
use overair_cache::SourceCache;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::handler::WorkflowView;
use crate::types::FileEntity;
use crate::verify;

/// What the plugin did with a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOutcome {
    /// The payload is now present on disk; skip the network.
    Handled,
    /// The core must download the file directly.
    Fallback,
    /// The plugin failed; the download step fails with it.
    Failed(String),
}

/// Per-file download hook.
pub trait DownloadPlugin: Send + Sync {
    /// Try to produce `file` at `dest` without a network fetch.
    fn process_update(
        &self,
        view: &WorkflowView<'_>,
        file: &FileEntity,
        dest: &Path,
    ) -> PluginOutcome;

    /// Called once after a workflow succeeds, before the sandbox is
    /// dropped.
    fn on_update_workflow_completed(&self, view: &WorkflowView<'_>) -> Result<()> {
        let _ = view;
        Ok(())
    }
}

/// Registry of download plugins keyed by `downloadHandlerId`.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn DownloadPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler_id: impl Into<String>, plugin: Arc<dyn DownloadPlugin>) {
        self.plugins.insert(handler_id.into(), plugin);
    }

    pub fn get(&self, handler_id: &str) -> Option<&Arc<dyn DownloadPlugin>> {
        self.plugins.get(handler_id)
    }

    /// Fan the completion notification out to every plugin. Failures are
    /// logged, not propagated; the workflow already succeeded.
    pub fn notify_workflow_completed(&self, view: &WorkflowView<'_>) {
        for (id, plugin) in &self.plugins {
            if let Err(e) = plugin.on_update_workflow_completed(view) {
                warn!(plugin = %id, error = %e, "workflow-completed hook failed");
            }
        }
    }
}

/// Seam through which a delta plugin rebuilds a target payload from its
/// source. The real patch application runs behind the privileged shim;
/// tests and the simulator use [`PassthroughProcessor`].
pub trait DeltaProcessor: Send + Sync {
    fn recreate(&self, source: &Path, file: &FileEntity, dest: &Path) -> Result<()>;
}

/// Processor for the degenerate delta whose source already equals the
/// target payload.
pub struct PassthroughProcessor;

impl DeltaProcessor for PassthroughProcessor {
    fn recreate(&self, source: &Path, _file: &FileEntity, dest: &Path) -> Result<()> {
        std::fs::copy(source, dest)?;
        Ok(())
    }
}

/// Delta download plugin backed by the source update cache.
pub struct DeltaDownloadPlugin {
    cache: SourceCache,
    processor: Box<dyn DeltaProcessor>,
}

impl DeltaDownloadPlugin {
    pub fn new(cache: SourceCache, processor: Box<dyn DeltaProcessor>) -> Self {
        Self { cache, processor }
    }
}

impl DownloadPlugin for DeltaDownloadPlugin {
    fn process_update(
        &self,
        view: &WorkflowView<'_>,
        file: &FileEntity,
        dest: &Path,
    ) -> PluginOutcome {
        let provider = &view.deployment.update_id.provider;
        for related in &file.related_files {
            let Some(source) =
                self.cache
                    .lookup(provider, &related.source_hash, &related.hash_algorithm)
            else {
                continue;
            };
            debug!(
                file = %file.target_filename,
                source = %source.display(),
                "rebuilding payload from cached source"
            );
            return match self.processor.recreate(&source, file, dest) {
                Ok(()) => PluginOutcome::Handled,
                Err(e) => PluginOutcome::Failed(format!(
                    "delta recreate failed for {}: {e}",
                    file.target_filename
                )),
            };
        }
        PluginOutcome::Fallback
    }

    /// Seed the cache with the payloads that just landed, keyed by their
    /// hex digest, then enforce the size budget.
    fn on_update_workflow_completed(&self, view: &WorkflowView<'_>) -> Result<()> {
        let provider = &view.deployment.update_id.provider;
        for file in &view.deployment.files {
            let path = view.file_path(file);
            if !path.is_file() {
                continue;
            }
            let hash = verify::file_sha256_hex(&path)
                .map_err(|e| anyhow::anyhow!("failed to hash {}: {e}", path.display()))?;
            self.cache.move_in(&path, provider, &hash, "sha256")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    use tempfile::tempdir;

    use super::*;
    use crate::criteria::CriteriaLedger;
    use crate::download::Downloader;
    use crate::types::{Deployment, FileHash, RelatedFile, UpdateId, UpdateType};

    fn deployment_with_file(file: FileEntity) -> Deployment {
        Deployment {
            workflow_id: "w1".into(),
            update_id: UpdateId {
                provider: "contoso".into(),
                name: "camera-fw".into(),
                version: "2.0".into(),
            },
            update_type: UpdateType::new("microsoft/swupdate:1"),
            installed_criteria: "2.0".into(),
            files: vec![file],
            content_protection: None,
            steps: None,
        }
    }

    fn delta_file(source_hash: &str) -> FileEntity {
        FileEntity {
            file_id: "f1".into(),
            target_filename: "image.swu".into(),
            size_in_bytes: 0,
            hashes: vec![FileHash {
                hash_type: "sha256".into(),
                value: "unused".into(),
            }],
            download_uri: "http://updates.example/image.swu".into(),
            related_files: vec![RelatedFile {
                source_hash: source_hash.into(),
                hash_algorithm: "sha256".into(),
                download_handler_id: Some("overair/delta:1".into()),
            }],
            download_handler_id: Some("overair/delta:1".into()),
        }
    }

    struct ViewParts {
        deployment: Deployment,
        work_folder: PathBuf,
        cancel: AtomicBool,
        criteria: CriteriaLedger,
        downloader: Downloader,
        plugins: PluginRegistry,
        device_key_file: PathBuf,
    }

    impl ViewParts {
        fn new(root: &Path, deployment: Deployment) -> Self {
            let work_folder = root.join("sandbox");
            fs::create_dir_all(&work_folder).expect("sandbox");
            Self {
                deployment,
                work_folder,
                cancel: AtomicBool::new(false),
                criteria: CriteriaLedger::new(root.join("installedcriteria")),
                downloader: Downloader::new(
                    overair_retry::RetryPolicy::transient_network(),
                    overair_retry::RetryPolicy::cloud_throttled(),
                )
                .expect("downloader"),
                plugins: PluginRegistry::new(),
                device_key_file: root.join("device.key"),
            }
        }

        fn view(&self) -> WorkflowView<'_> {
            WorkflowView {
                deployment: &self.deployment,
                work_folder: &self.work_folder,
                cancel: &self.cancel,
                criteria: &self.criteria,
                downloader: &self.downloader,
                plugins: &self.plugins,
                device_key_file: &self.device_key_file,
            }
        }
    }

    #[test]
    fn cache_hit_is_handled_without_network() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        let staged = td.path().join("staged");
        fs::write(&staged, b"source payload").expect("stage");
        cache
            .move_in(&staged, "contoso", "srchash", "sha256")
            .expect("seed cache");

        let parts = ViewParts::new(td.path(), deployment_with_file(delta_file("srchash")));
        let plugin = DeltaDownloadPlugin::new(cache, Box::new(PassthroughProcessor));

        let file = parts.deployment.files[0].clone();
        let dest = parts.work_folder.join("image.swu");
        let outcome = plugin.process_update(&parts.view(), &file, &dest);

        assert_eq!(outcome, PluginOutcome::Handled);
        assert_eq!(fs::read(&dest).expect("read"), b"source payload");
    }

    #[test]
    fn cache_miss_falls_back() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        let parts = ViewParts::new(td.path(), deployment_with_file(delta_file("absent")));
        let plugin = DeltaDownloadPlugin::new(cache, Box::new(PassthroughProcessor));

        let file = parts.deployment.files[0].clone();
        let dest = parts.work_folder.join("image.swu");
        assert_eq!(
            plugin.process_update(&parts.view(), &file, &dest),
            PluginOutcome::Fallback
        );
    }

    #[test]
    fn processor_failure_is_reported() {
        struct FailingProcessor;
        impl DeltaProcessor for FailingProcessor {
            fn recreate(&self, _source: &Path, _file: &FileEntity, _dest: &Path) -> Result<()> {
                anyhow::bail!("patch engine exploded")
            }
        }

        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        let staged = td.path().join("staged");
        fs::write(&staged, b"source").expect("stage");
        cache
            .move_in(&staged, "contoso", "srchash", "sha256")
            .expect("seed");

        let parts = ViewParts::new(td.path(), deployment_with_file(delta_file("srchash")));
        let plugin = DeltaDownloadPlugin::new(cache, Box::new(FailingProcessor));

        let file = parts.deployment.files[0].clone();
        let dest = parts.work_folder.join("image.swu");
        assert!(matches!(
            plugin.process_update(&parts.view(), &file, &dest),
            PluginOutcome::Failed(_)
        ));
    }

    #[test]
    fn completion_moves_payloads_into_cache() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        let mut file = delta_file("whatever");
        file.related_files.clear();
        let parts = ViewParts::new(td.path(), deployment_with_file(file));

        let payload = parts.work_folder.join("image.swu");
        fs::write(&payload, b"fresh payload").expect("write payload");
        let expected_hash = verify::file_sha256_hex(&payload).expect("hash");

        let plugin = DeltaDownloadPlugin::new(cache.clone(), Box::new(PassthroughProcessor));
        plugin
            .on_update_workflow_completed(&parts.view())
            .expect("completion");

        assert!(cache.lookup("contoso", &expected_hash, "sha256").is_some());
        assert!(!payload.exists(), "payload ownership moves to the cache");
    }

    #[test]
    fn completion_skips_missing_files() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        let parts = ViewParts::new(td.path(), deployment_with_file(delta_file("x")));

        let plugin = DeltaDownloadPlugin::new(cache, Box::new(PassthroughProcessor));
        plugin
            .on_update_workflow_completed(&parts.view())
            .expect("completion tolerates absent payloads");
    }

    #[test]
    fn registry_lookup_and_fanout() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        let mut registry = PluginRegistry::new();
        registry.register(
            "overair/delta:1",
            Arc::new(DeltaDownloadPlugin::new(cache, Box::new(PassthroughProcessor))),
        );

        assert!(registry.get("overair/delta:1").is_some());
        assert!(registry.get("overair/unknown:1").is_none());

        let parts = ViewParts::new(td.path(), deployment_with_file(delta_file("x")));
        // Fan-out must tolerate plugins with nothing to do.
        registry.notify_workflow_completed(&parts.view());
    }
}
