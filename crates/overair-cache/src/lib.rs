//! Content-addressed cache of previously applied update payloads.
//!
//! Delta download handlers consult this cache for a source payload before
//! touching the network: a hit lets the device rebuild the target payload
//! locally from the cached source. Entries live at
//! `<base>/<provider>/<algorithm>/<hash>` and are evicted oldest-accessed
//! first when the cache exceeds its size budget.
//!
//! # Example
//!
//! ```
//! use overair_cache::SourceCache;
//! # let dir = tempfile::tempdir().unwrap();
//! # let staged = dir.path().join("staged.bin");
//! # std::fs::write(&staged, b"payload").unwrap();
//!
//! let cache = SourceCache::new(dir.path().join("cache"));
//! cache.move_in(&staged, "contoso", "abc123", "sha256").unwrap();
//! assert!(cache.lookup("contoso", "abc123", "sha256").is_some());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// One cache entry as seen by the eviction walk.
#[derive(Debug, Clone)]
struct EntryStat {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

/// Content-addressed store of source payloads under a base directory.
#[derive(Debug, Clone)]
pub struct SourceCache {
    base: PathBuf,
}

impl SourceCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory of the cache.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path a payload with this identity would occupy.
    pub fn entry_path(&self, provider: &str, hash: &str, algorithm: &str) -> Result<PathBuf> {
        Ok(self
            .base
            .join(sanitized(provider)?)
            .join(sanitized(algorithm)?)
            .join(sanitized(hash)?))
    }

    /// Look up a cached payload. Returns its path on a hit.
    pub fn lookup(&self, provider: &str, hash: &str, algorithm: &str) -> Option<PathBuf> {
        let path = self.entry_path(provider, hash, algorithm).ok()?;
        path.is_file().then_some(path)
    }

    /// Move a payload from the sandbox into the cache.
    ///
    /// The rename is atomic and replaces any existing entry; ownership of
    /// `sandbox_path` transfers to the cache.
    pub fn move_in(
        &self,
        sandbox_path: &Path,
        provider: &str,
        hash: &str,
        algorithm: &str,
    ) -> Result<PathBuf> {
        let target = self.entry_path(provider, hash, algorithm)?;
        let parent = target
            .parent()
            .context("cache entry path has no parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        fs::rename(sandbox_path, &target).with_context(|| {
            format!(
                "failed to move {} into cache at {}",
                sandbox_path.display(),
                target.display()
            )
        })?;
        debug!(entry = %target.display(), "payload moved into source cache");
        Ok(target)
    }

    /// Sum of entry sizes, in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Unlink oldest-accessed entries until the cache fits under
    /// `cap_bytes`. Returns the number of evicted entries.
    pub fn evict_until_under(&self, cap_bytes: u64) -> Result<usize> {
        let mut entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= cap_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.accessed);
        let mut evicted = 0;
        for entry in entries {
            if total <= cap_bytes {
                break;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    total = total.saturating_sub(entry.size);
                    evicted += 1;
                    debug!(entry = %entry.path.display(), size = entry.size, "evicted cache entry");
                }
                Err(e) => {
                    warn!(entry = %entry.path.display(), error = %e, "failed to evict cache entry");
                }
            }
        }
        Ok(evicted)
    }

    fn entries(&self) -> Result<Vec<EntryStat>> {
        let mut out = Vec::new();
        if !self.base.is_dir() {
            return Ok(out);
        }
        for provider in read_dirs(&self.base)? {
            for algorithm in read_dirs(&provider)? {
                for file in read_files(&algorithm)? {
                    let meta = fs::metadata(&file)
                        .with_context(|| format!("failed to stat {}", file.display()))?;
                    // Filesystems without atime fall back to mtime.
                    let accessed = meta
                        .accessed()
                        .or_else(|_| meta.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    out.push(EntryStat {
                        path: file,
                        size: meta.len(),
                        accessed,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn sanitized(component: &str) -> Result<&str> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
    {
        bail!("invalid cache path component: {component:?}");
    }
    Ok(component)
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    read_entries(dir, |p| p.is_dir())
}

fn read_files(dir: &Path) -> Result<Vec<PathBuf>> {
    read_entries(dir, |p| p.is_file())
}

fn read_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let iter =
        fs::read_dir(dir).with_context(|| format!("failed to read cache dir {}", dir.display()))?;
    for entry in iter {
        let path = entry
            .with_context(|| format!("failed to read cache dir entry in {}", dir.display()))?
            .path();
        if keep(&path) {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    fn stage(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).expect("stage file");
        path
    }

    #[test]
    fn move_in_then_lookup_preserves_bytes() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        let staged = stage(td.path(), "staged", b"source payload bytes");

        let entry = cache
            .move_in(&staged, "contoso", "deadbeef", "sha256")
            .expect("move_in");
        assert!(!staged.exists(), "ownership must transfer");

        let found = cache.lookup("contoso", "deadbeef", "sha256").expect("hit");
        assert_eq!(found, entry);
        assert_eq!(fs::read(&found).expect("read"), b"source payload bytes");
    }

    #[test]
    fn lookup_miss_returns_none() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        assert!(cache.lookup("contoso", "cafe", "sha256").is_none());
    }

    #[test]
    fn move_in_replaces_existing_entry() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        let first = stage(td.path(), "first", b"old");
        cache.move_in(&first, "p", "h", "sha256").expect("first");

        let second = stage(td.path(), "second", b"new");
        cache.move_in(&second, "p", "h", "sha256").expect("second");

        let found = cache.lookup("p", "h", "sha256").expect("hit");
        assert_eq!(fs::read(found).expect("read"), b"new");
    }

    #[test]
    fn entry_path_rejects_traversal() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path());
        assert!(cache.entry_path("..", "h", "sha256").is_err());
        assert!(cache.entry_path("p", "../../etc/passwd", "sha256").is_err());
        assert!(cache.entry_path("p", "h", "").is_err());
    }

    #[test]
    fn total_size_sums_entries() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));
        assert_eq!(cache.total_size().expect("size"), 0);

        let a = stage(td.path(), "a", &[0u8; 100]);
        let b = stage(td.path(), "b", &[0u8; 50]);
        cache.move_in(&a, "p", "ha", "sha256").expect("a");
        cache.move_in(&b, "p", "hb", "sha256").expect("b");

        assert_eq!(cache.total_size().expect("size"), 150);
    }

    #[test]
    fn eviction_removes_oldest_accessed_first() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        let old = stage(td.path(), "old", &[0u8; 100]);
        cache.move_in(&old, "p", "old", "sha256").expect("old");
        sleep(Duration::from_millis(50));
        let fresh = stage(td.path(), "fresh", &[0u8; 100]);
        cache.move_in(&fresh, "p", "fresh", "sha256").expect("fresh");

        let evicted = cache.evict_until_under(100).expect("evict");
        assert_eq!(evicted, 1);
        assert!(cache.lookup("p", "old", "sha256").is_none());
        assert!(cache.lookup("p", "fresh", "sha256").is_some());
    }

    #[test]
    fn eviction_is_a_noop_under_cap() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        let a = stage(td.path(), "a", &[0u8; 10]);
        cache.move_in(&a, "p", "ha", "sha256").expect("a");

        assert_eq!(cache.evict_until_under(1_000).expect("evict"), 0);
        assert!(cache.lookup("p", "ha", "sha256").is_some());
    }

    #[test]
    fn eviction_stops_once_under_cap() {
        let td = tempdir().expect("tempdir");
        let cache = SourceCache::new(td.path().join("cache"));

        for (i, name) in ["h0", "h1", "h2"].iter().enumerate() {
            let staged = stage(td.path(), name, &[0u8; 100]);
            cache.move_in(&staged, "p", name, "sha256").expect("move");
            if i < 2 {
                sleep(Duration::from_millis(30));
            }
        }

        cache.evict_until_under(200).expect("evict");
        assert!(cache.total_size().expect("size") <= 200);
        // Newest entry always survives.
        assert!(cache.lookup("p", "h2", "sha256").is_some());
    }
}
