//! Version registry: label -> scanned version, behind one reader/writer lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IoResultExt, PatchError, Result};
use crate::manifest::{KeyFileInfo, Manifest};
use crate::progress::ProgressObserver;
use crate::scanner::{self, ScanOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub label: String,
    /// Absolute location of the tree.
    pub location: PathBuf,
    pub key_file: KeyFileInfo,
    pub manifest: Manifest,
    pub registered_at: DateTime<Utc>,
    pub last_scan: DateTime<Utc>,
}

/// Persistence for previously computed manifests. Implemented outside the core.
pub trait ManifestCache: Send + Sync {
    fn load_cached_manifest(&self, label: &str, location: &Path) -> Option<Version>;
    fn store_manifest(&self, version: &Version) -> Result<()>;
}

pub struct VersionRegistry {
    versions: RwLock<HashMap<String, Version>>,
    workers: usize,
}

impl VersionRegistry {
    /// `workers` is the hashing pool size used for every scan this registry runs.
    pub fn new(workers: usize) -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
            workers,
        }
    }

    /// Scan `location` and register it under `label`.
    pub fn register(
        &self,
        label: &str,
        location: &Path,
        key_file: &str,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<Version> {
        self.register_with_cache(label, location, key_file, None, progress)
    }

    /// Like [`register`](Self::register), but reuse a cached manifest when the
    /// live key file still matches it, and store fresh scans back.
    pub fn register_with_cache(
        &self,
        label: &str,
        location: &Path,
        key_file: &str,
        cache: Option<&dyn ManifestCache>,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<Version> {
        if label.trim().is_empty() {
            return Err(PatchError::Validation("Version label must not be empty".into()));
        }
        if self.read().contains_key(label) {
            return Err(PatchError::Validation(format!(
                "Version {label} is already registered"
            )));
        }

        let location = location.canonicalize().at(location)?;
        let key = KeyFileInfo::from(&scanner::find_file(&location, key_file)?);

        let cached = cache
            .and_then(|c| c.load_cached_manifest(label, &location))
            .and_then(|mut cached| {
                let fresh =
                    cached.key_file.checksum == key.checksum && cached.key_file.path == key.path;
                if !fresh {
                    warn!(version = label, "Cached manifest is stale, rescanning");
                    return None;
                }
                if let Err(e) = cached.manifest.normalize() {
                    warn!(
                        version = label,
                        error = %e,
                        "Cached manifest is inconsistent, rescanning"
                    );
                    return None;
                }
                Some(cached)
            });

        let version = match cached {
            Some(mut version) => {
                info!(version = label, "Using cached manifest");
                version.label = label.to_string();
                version.location = location;
                version.registered_at = Utc::now();
                version
            }
            None => {
                let now = Utc::now();
                let manifest = self.scan_manifest(label, &location, key.clone(), progress)?;
                let version = Version {
                    label: label.to_string(),
                    location,
                    key_file: key,
                    manifest,
                    registered_at: now,
                    last_scan: now,
                };
                if let Some(cache) = cache {
                    cache.store_manifest(&version)?;
                }
                version
            }
        };

        let mut versions = self.write();
        if versions.contains_key(label) {
            return Err(PatchError::Validation(format!(
                "Version {label} is already registered"
            )));
        }
        versions.insert(label.to_string(), version.clone());
        info!(
            version = label,
            files = version.manifest.total_files,
            bytes = version.manifest.total_size,
            "Registered version"
        );
        Ok(version)
    }

    /// Re-scan a registered version, replacing its manifest wholesale.
    pub fn rescan(&self, label: &str, progress: Option<&dyn ProgressObserver>) -> Result<Version> {
        let current = self
            .get(label)
            .ok_or_else(|| PatchError::Validation(format!("Unknown version: {label}")))?;

        let key_entry = scanner::find_file(&current.location, &current.key_file.path)?;
        let key = KeyFileInfo::from(&key_entry);
        let manifest = self.scan_manifest(label, &current.location, key.clone(), progress)?;

        let mut versions = self.write();
        let version = versions
            .get_mut(label)
            .ok_or_else(|| {
                PatchError::Validation(format!("Version {label} was unregistered during rescan"))
            })?;
        version.key_file = key;
        version.manifest = manifest;
        version.last_scan = Utc::now();
        info!(version = label, "Rescanned version");
        Ok(version.clone())
    }

    pub fn unregister(&self, label: &str) -> Option<Version> {
        let removed = self.write().remove(label);
        if removed.is_some() {
            info!(version = label, "Unregistered version");
        }
        removed
    }

    pub fn get(&self, label: &str) -> Option<Version> {
        self.read().get(label).cloned()
    }

    /// Registered labels, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn scan_manifest(
        &self,
        label: &str,
        location: &Path,
        key: KeyFileInfo,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<Manifest> {
        let options = ScanOptions {
            workers: self.workers,
            progress,
        };
        let scan = scanner::scan(location, &options)?;
        Manifest::build(label, key, scan)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Version>> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Version>> {
        self.versions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MemoryCache {
        stored: Mutex<HashMap<String, Version>>,
        stores: AtomicUsize,
    }

    impl ManifestCache for MemoryCache {
        fn load_cached_manifest(&self, label: &str, _location: &Path) -> Option<Version> {
            self.stored.lock().unwrap().get(label).cloned()
        }

        fn store_manifest(&self, version: &Version) -> Result<()> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.stored
                .lock()
                .unwrap()
                .insert(version.label.clone(), version.clone());
            Ok(())
        }
    }

    fn make_tree(root: &Path, app: &[u8]) {
        std::fs::create_dir_all(root.join("res")).unwrap();
        std::fs::write(root.join("app.exe"), app).unwrap();
        std::fs::write(root.join("res/strings.txt"), b"hello").unwrap();
    }

    #[test]
    fn test_register_get_list_unregister() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");

        let registry = VersionRegistry::new(2);
        let version = registry.register("1.0", dir.path(), "app.exe", None).unwrap();
        assert_eq!(version.manifest.total_files, 2);
        assert_eq!(version.key_file.path, "app.exe");
        assert!(version.location.is_absolute());

        assert!(registry.register("1.0", dir.path(), "app.exe", None).is_err());
        assert_eq!(registry.list(), vec!["1.0".to_string()]);
        assert!(registry.get("1.0").is_some());
        assert!(registry.unregister("1.0").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_key_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        let registry = VersionRegistry::new(1);
        let err = registry.register("1.0", dir.path(), "nope.exe", None).unwrap_err();
        assert!(matches!(err, PatchError::MissingFile(_)));
    }

    #[test]
    fn test_cache_hit_and_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        let cache = MemoryCache::default();

        let registry = VersionRegistry::new(1);
        registry
            .register_with_cache("1.0", dir.path(), "app.exe", Some(&cache), None)
            .unwrap();
        assert_eq!(cache.stores.load(Ordering::SeqCst), 1);

        // Same key file: served from the cache, no new store.
        let second = VersionRegistry::new(1);
        second
            .register_with_cache("1.0", dir.path(), "app.exe", Some(&cache), None)
            .unwrap();
        assert_eq!(cache.stores.load(Ordering::SeqCst), 1);

        // Key file changed: cache entry is ignored and replaced.
        std::fs::write(dir.path().join("app.exe"), b"v2").unwrap();
        let third = VersionRegistry::new(1);
        let version = third
            .register_with_cache("1.0", dir.path(), "app.exe", Some(&cache), None)
            .unwrap();
        assert_eq!(cache.stores.load(Ordering::SeqCst), 2);
        assert_eq!(version.key_file.checksum, crate::util::sha256_bytes(b"v2"));
    }

    #[test]
    fn test_unsorted_cached_manifest_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        let cache = MemoryCache::default();
        VersionRegistry::new(1)
            .register_with_cache("1.0", dir.path(), "app.exe", Some(&cache), None)
            .unwrap();

        // A cache that hands back files out of path order.
        cache
            .stored
            .lock()
            .unwrap()
            .get_mut("1.0")
            .unwrap()
            .manifest
            .files_mut()
            .reverse();

        let registry = VersionRegistry::new(1);
        let version = registry
            .register_with_cache("1.0", dir.path(), "app.exe", Some(&cache), None)
            .unwrap();
        assert_eq!(cache.stores.load(Ordering::SeqCst), 1);
        assert_eq!(version.manifest.files()[0].path, "app.exe");
        assert!(version.manifest.file("res/strings.txt").is_some());
        assert!(version.manifest.file("app.exe").is_some());
    }

    #[test]
    fn test_parallel_registration_with_ignore_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/today.log"), b"noise").unwrap();
        std::fs::write(dir.path().join("crash.dmp"), b"noise").unwrap();
        std::fs::write(dir.path().join(".patchignore"), "logs/\n*.dmp\n").unwrap();
        for i in 0..24 {
            let asset = dir.path().join(format!("res/asset{i:02}.bin"));
            std::fs::write(asset, vec![i as u8; 64]).unwrap();
        }

        let seen = Mutex::new(Vec::new());
        let observer = |current: u64, total: u64, _label: &str| {
            seen.lock().unwrap().push((current, total));
        };
        let registry = VersionRegistry::new(4);
        let version = registry
            .register_with_cache("1.0", dir.path(), "app.exe", None, Some(&observer))
            .unwrap();

        assert_eq!(version.manifest.total_files, 26);
        assert!(version.manifest.file("logs/today.log").is_none());
        assert!(version.manifest.file("crash.dmp").is_none());
        assert!(!version.manifest.has_directory("logs"));

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let expected: Vec<_> = (1..=26).map(|i| (i, 26)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_rescan_replaces_manifest() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        let registry = VersionRegistry::new(1);
        let before = registry.register("1.0", dir.path(), "app.exe", None).unwrap();

        std::fs::write(dir.path().join("res/extra.txt"), b"more").unwrap();
        let after = registry.rescan("1.0", None).unwrap();
        assert_eq!(after.manifest.total_files, 3);
        assert_ne!(before.manifest.checksum, after.manifest.checksum);
        assert!(registry.rescan("2.0", None).is_err());
    }

    #[test]
    fn test_concurrent_readers() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), b"v1");
        let registry = Arc::new(VersionRegistry::new(1));
        registry.register("1.0", dir.path(), "app.exe", None).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("1.0").map(|v| v.manifest.total_files))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(2));
        }
    }
}
