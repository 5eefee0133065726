//! Directory scanning with SHA-256 fingerprinting.
//!
//! A scan first enumerates the tree (respecting `.patchignore` and the
//! reserved backup directory), then hashes every file. Hashing runs either
//! inline or on a bounded rayon pool; each job only produces the entry for its
//! own index, so results need no locking and keep enumeration order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{IoResultExt, PatchError, Result};
use crate::ignore::IgnoreRules;
use crate::manifest::FileEntry;
use crate::progress::{self, ProgressObserver};
use crate::util;

/// Directory name reserved for apply-time backups; never scanned.
pub const BACKUP_DIR_NAME: &str = ".patch_backup";

#[derive(Clone, Copy, Default)]
pub struct ScanOptions<'a> {
    /// Hashing threads. 0 or 1 hashes sequentially on the calling thread.
    pub workers: usize,
    pub progress: Option<&'a dyn ProgressObserver>,
}

impl<'a> ScanOptions<'a> {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel(workers: usize) -> Self {
        Self {
            workers,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressObserver) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Sorted by path.
    pub files: Vec<FileEntry>,
    /// Sorted, forward-slash relative directory paths.
    pub directories: Vec<String>,
}

impl ScanResult {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

struct ScanJob {
    relative: String,
    full: PathBuf,
}

/// Scan the tree under `root`.
pub fn scan(root: &Path, options: &ScanOptions<'_>) -> Result<ScanResult> {
    let root = root.canonicalize().at(root)?;
    if !root.is_dir() {
        return Err(PatchError::Validation(format!(
            "Not a directory: {}",
            root.display()
        )));
    }

    let rules = IgnoreRules::load(&root)?;
    let (jobs, mut directories) = enumerate(&root, &rules)?;
    let total = jobs.len() as u64;
    debug!(
        root = %root.display(),
        files = jobs.len(),
        directories = directories.len(),
        ignore_rules = rules.len(),
        "Enumerated tree"
    );

    let done = AtomicU64::new(0);
    let hash_job = |job: &ScanJob| -> Result<FileEntry> {
        let entry = hash_entry(&job.full, job.relative.clone())?;
        let current = done.fetch_add(1, Ordering::Relaxed) + 1;
        progress::report(options.progress, current, total, &job.relative);
        Ok(entry)
    };

    let mut files = if options.workers <= 1 {
        jobs.iter().map(hash_job).collect::<Result<Vec<_>>>()?
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .map_err(|e| PatchError::Validation(format!("Failed to start scan workers: {e}")))?;
        pool.install(|| jobs.par_iter().map(hash_job).collect::<Result<Vec<_>>>())?
    };

    files.sort_by(|a, b| a.path.cmp(&b.path));
    directories.sort();

    let result = ScanResult { files, directories };
    info!(
        root = %root.display(),
        files = result.files.len(),
        bytes = result.total_size(),
        workers = options.workers.max(1),
        "Scan complete"
    );
    Ok(result)
}

/// Look up a single file by relative path without walking the tree.
pub fn find_file(root: &Path, relative: &str) -> Result<FileEntry> {
    let relative = relative.trim_start_matches("./");
    #[cfg(windows)]
    let relative = relative.replace('\\', "/");
    let relative = relative.to_string();
    let full = util::resolve_in(root, &relative)?;
    match std::fs::metadata(&full) {
        Ok(meta) if meta.is_file() => hash_entry(&full, relative),
        Ok(_) => Err(PatchError::Validation(format!("Not a regular file: {relative}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PatchError::MissingFile(relative))
        }
        Err(e) => Err(PatchError::io(&full, e)),
    }
}

fn enumerate(root: &Path, rules: &IgnoreRules) -> Result<(Vec<ScanJob>, Vec<String>)> {
    let mut jobs = Vec::new();
    let mut directories = Vec::new();

    let mut walker = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            PatchError::io(&path, e.into())
        })?;
        let is_dir = entry.file_type().is_dir();

        if entry.file_name() == BACKUP_DIR_NAME {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        let relative = util::relative_path_string(root, entry.path())?;
        if rules.is_ignored(&relative, is_dir) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        if is_dir {
            directories.push(relative);
        } else if entry.file_type().is_file() {
            jobs.push(ScanJob {
                relative,
                full: entry.into_path(),
            });
        } else {
            debug!(path = %relative, "Skipping non-regular file");
        }
    }

    Ok((jobs, directories))
}

fn hash_entry(full: &Path, relative: String) -> Result<FileEntry> {
    let meta = std::fs::metadata(full).at(full)?;
    let checksum = util::sha256_file(full)?;
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(FileEntry {
        path: relative,
        size: meta.len(),
        checksum,
        modified,
        executable: util::is_executable(&meta),
    })
}
