//! Manifests: immutable fingerprints of a scanned version.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::scanner::{self, ScanResult};
use crate::util;

/// One regular file inside a scanned tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Tree-relative, forward-slash separated.
    pub path: String,
    pub size: u64,
    /// SHA-256, lowercase hex.
    pub checksum: String,
    pub modified: DateTime<Utc>,
    pub executable: bool,
}

/// The file used to cheaply confirm which version a tree holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFileInfo {
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

impl From<&FileEntry> for KeyFileInfo {
    fn from(entry: &FileEntry) -> Self {
        Self {
            path: entry.path.clone(),
            checksum: entry.checksum.clone(),
            size: entry.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub key_file: KeyFileInfo,
    /// Sorted by path, unique.
    files: Vec<FileEntry>,
    /// Sorted, unique.
    directories: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub total_size: u64,
    pub total_files: u64,
    pub checksum: String,
}

impl Manifest {
    /// Build a manifest from a finished scan. Empty trees are rejected.
    pub fn build(version: &str, key_file: KeyFileInfo, scan: ScanResult) -> Result<Self> {
        let ScanResult {
            mut files,
            mut directories,
        } = scan;

        if files.is_empty() {
            return Err(PatchError::Validation(format!(
                "Version {version} contains no files"
            )));
        }

        sort_unique(&mut files, &mut directories)?;

        let total_size = files.iter().map(|f| f.size).sum();
        let checksum = aggregate_checksum(&files);
        debug!(
            version,
            files = files.len(),
            checksum = %crate::error::short_hash(&checksum),
            "Built manifest"
        );

        Ok(Self {
            version: version.to_string(),
            key_file,
            total_files: files.len() as u64,
            files,
            directories,
            created_at: Utc::now(),
            total_size,
            checksum,
        })
    }

    /// Restore the sorted, duplicate-free layout that lookups rely on, and
    /// check the totals and aggregate checksum still describe the file list.
    /// Manifests that did not come from [`Manifest::build`], such as cached
    /// ones, go through this before use.
    pub fn normalize(&mut self) -> Result<()> {
        sort_unique(&mut self.files, &mut self.directories)?;
        if self.total_files != self.files.len() as u64 {
            return Err(PatchError::integrity(
                format!("manifest {} file count", self.version),
                &self.total_files.to_string(),
                &self.files.len().to_string(),
            ));
        }
        let checksum = aggregate_checksum(&self.files);
        if checksum != self.checksum {
            return Err(PatchError::integrity(
                format!("manifest {}", self.version),
                &self.checksum,
                &checksum,
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn files_mut(&mut self) -> &mut Vec<FileEntry> {
        &mut self.files
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.directories.binary_search_by(|d| d.as_str().cmp(path)).is_ok()
    }

    /// Path-keyed lookup used for comparisons.
    pub fn file_map(&self) -> HashMap<&str, &FileEntry> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }

    /// Re-hash every file of this manifest under `root` and report differences.
    /// Files present on disk but absent from the manifest are not reported.
    pub fn verify_tree(&self, root: &Path) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for entry in &self.files {
            report.checked += 1;
            match scanner::find_file(root, &entry.path) {
                Ok(actual) if actual.checksum == entry.checksum => {}
                Ok(actual) => report.mismatched.push(Mismatch {
                    path: entry.path.clone(),
                    expected: entry.checksum.clone(),
                    actual: actual.checksum,
                }),
                Err(PatchError::MissingFile(_)) => report.missing.push(entry.path.clone()),
                Err(e) => return Err(e),
            }
        }
        for dir in &self.directories {
            if !util::resolve_in(root, dir)?.is_dir() {
                report.missing.push(format!("{dir}/"));
            }
        }
        Ok(report)
    }
}

fn sort_unique(files: &mut [FileEntry], directories: &mut Vec<String>) -> Result<()> {
    files.sort_by(|a, b| a.path.cmp(&b.path));
    if let Some(pair) = files.windows(2).find(|w| w[0].path == w[1].path) {
        return Err(PatchError::Validation(format!(
            "Duplicate path in manifest: {}",
            pair[0].path
        )));
    }
    directories.sort();
    directories.dedup();
    Ok(())
}

/// SHA-256 over the concatenated hex checksums, ordered by path.
pub fn aggregate_checksum(files: &[FileEntry]) -> String {
    let mut ordered: Vec<&FileEntry> = files.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for entry in ordered {
        hasher.update(entry.checksum.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub mismatched: Vec<Mismatch>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.mismatched.len() + self.missing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanOptions;

    fn entry(path: &str, checksum: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            checksum: checksum.to_string(),
            modified: Utc::now(),
            executable: false,
        }
    }

    fn key() -> KeyFileInfo {
        KeyFileInfo {
            path: "app".into(),
            checksum: "aa".into(),
            size: 1,
        }
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let err = Manifest::build("1.0", key(), ScanResult::default()).unwrap_err();
        assert!(matches!(err, PatchError::Validation(_)));
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let a = vec![entry("b", "22", 1), entry("a", "11", 2)];
        let b = vec![entry("a", "11", 2), entry("b", "22", 1)];
        assert_eq!(aggregate_checksum(&a), aggregate_checksum(&b));
        assert_eq!(aggregate_checksum(&a), util::sha256_bytes(b"1122"));
    }

    #[test]
    fn test_build_totals_and_lookup() {
        let scan = ScanResult {
            files: vec![entry("z.txt", "ff", 10), entry("a/b.txt", "ee", 5)],
            directories: vec!["a".into()],
        };
        let manifest = Manifest::build("2.0", key(), scan).unwrap();
        assert_eq!(manifest.total_files, 2);
        assert_eq!(manifest.total_size, 15);
        assert_eq!(manifest.files()[0].path, "a/b.txt");
        assert_eq!(manifest.file("z.txt").unwrap().checksum, "ff");
        assert!(manifest.file("missing").is_none());
        assert!(manifest.has_directory("a"));
    }

    #[test]
    fn test_normalize_restores_lookup_order() {
        let scan = ScanResult {
            files: vec![entry("a", "11", 1), entry("m", "22", 1), entry("z", "33", 1)],
            directories: vec![],
        };
        let mut manifest = Manifest::build("1", key(), scan).unwrap();
        manifest.files_mut().reverse();
        manifest.normalize().unwrap();
        assert_eq!(manifest.file("a").unwrap().checksum, "11");
        assert_eq!(manifest.file("z").unwrap().checksum, "33");

        manifest.files_mut()[0].checksum = "99".into();
        let err = manifest.normalize().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let scan = ScanResult {
            files: vec![entry("x", "11", 1), entry("x", "22", 1)],
            directories: vec![],
        };
        assert!(Manifest::build("1", key(), scan).is_err());
    }

    #[test]
    fn test_verify_unmodified_tree_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("app"), b"main").unwrap();
        std::fs::write(dir.path().join("sub/lib.so"), b"lib").unwrap();

        let scan = scanner::scan(dir.path(), &ScanOptions::sequential()).unwrap();
        let key = KeyFileInfo::from(&scan.files[0]);
        let manifest = Manifest::build("1.0", key, scan).unwrap();

        for _ in 0..2 {
            let report = manifest.verify_tree(dir.path()).unwrap();
            assert!(report.is_clean());
            assert_eq!(report.checked, 2);
        }

        std::fs::write(dir.path().join("sub/lib.so"), b"tampered").unwrap();
        std::fs::remove_file(dir.path().join("app")).unwrap();
        let report = manifest.verify_tree(dir.path()).unwrap();
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.missing, vec!["app".to_string()]);
        assert_eq!(report.problem_count(), 2);
    }
}
