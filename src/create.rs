use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binary_diff::{self, DEFAULT_LARGE_FILE_THRESHOLD};
use crate::error::{IoResultExt, PatchError, Result};
use crate::manifest::{FileEntry, Manifest};
use crate::patch_format::{FileRequirement, OperationKind, Patch, PatchOperation, Payload};
use crate::registry::{Version, VersionRegistry};
use crate::util;

/// How Modify operations carry the new contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModifyStrategy {
    /// Ship the whole new file.
    #[default]
    FullReplacement,
    /// Ship a binary diff when it is smaller than the file and neither side is large.
    BinaryDiff,
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorOptions {
    pub skip_identical: bool,
    pub modify_strategy: ModifyStrategy,
    pub large_file_threshold: u64,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            skip_identical: true,
            modify_strategy: ModifyStrategy::default(),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
        }
    }
}

/// Path-level differences between two manifests. Every list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// In both manifests with the same checksum.
    pub unchanged: Vec<String>,
    pub added_dirs: Vec<String>,
    pub deleted_dirs: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.added_dirs.is_empty()
            && self.deleted_dirs.is_empty()
    }
}

/// Classify every path of `from` and `to`. Pure.
pub fn compare_manifests(from: &Manifest, to: &Manifest) -> ManifestDiff {
    let from_files = from.file_map();
    let to_files = to.file_map();
    let mut diff = ManifestDiff::default();

    for entry in to.files() {
        match from_files.get(entry.path.as_str()) {
            None => diff.added.push(entry.path.clone()),
            Some(old) if old.checksum != entry.checksum => diff.modified.push(entry.path.clone()),
            Some(_) => diff.unchanged.push(entry.path.clone()),
        }
    }
    for entry in from.files() {
        if !to_files.contains_key(entry.path.as_str()) {
            diff.deleted.push(entry.path.clone());
        }
    }

    diff.added_dirs = to
        .directories()
        .iter()
        .filter(|d| !from.has_directory(d))
        .cloned()
        .collect();
    diff.deleted_dirs = from
        .directories()
        .iter()
        .filter(|d| !to.has_directory(d))
        .cloned()
        .collect();

    // Manifests keep files and directories sorted, so the lists already are.
    diff
}

/// Generate a patch between two versions held in `registry`.
pub fn generate_patch(
    registry: &VersionRegistry,
    from_label: &str,
    to_label: &str,
    options: &GeneratorOptions,
) -> Result<Patch> {
    let from = registry
        .get(from_label)
        .ok_or_else(|| PatchError::Validation(format!("Unknown version: {from_label}")))?;
    let to = registry
        .get(to_label)
        .ok_or_else(|| PatchError::Validation(format!("Unknown version: {to_label}")))?;
    generate(&from, &to, options)
}

/// Generate the patch that turns `from` into `to`. Reads file contents from
/// both version locations and fails if any file drifted since its scan.
pub fn generate(from: &Version, to: &Version, options: &GeneratorOptions) -> Result<Patch> {
    let diff = compare_manifests(&from.manifest, &to.manifest);
    info!(
        from = %from.label,
        to = %to.label,
        added = diff.added.len(),
        modified = diff.modified.len(),
        deleted = diff.deleted.len(),
        added_dirs = diff.added_dirs.len(),
        deleted_dirs = diff.deleted_dirs.len(),
        "Compared manifests"
    );

    let mut patch = Patch::new(
        &from.label,
        &to.label,
        from.key_file.clone(),
        to.key_file.clone(),
    );

    patch.required_files = from
        .manifest
        .files()
        .iter()
        .map(|f| FileRequirement {
            path: f.path.clone(),
            checksum: f.checksum.clone(),
            size: f.size,
            required: true,
        })
        .collect();

    let mut added_dirs = diff.added_dirs.clone();
    util::sort_dirs_parent_first(&mut added_dirs);

    // A file replaced by a directory of the same name has to go first.
    let (blocking, deferred): (Vec<&String>, Vec<&String>) = diff
        .deleted
        .iter()
        .partition(|path| added_dirs.iter().any(|d| d == *path || is_under(d, path)));
    for path in &blocking {
        patch.operations.push(delete_op(&from.manifest, path)?);
    }
    for dir in &added_dirs {
        patch.operations.push(PatchOperation::add_dir(dir.as_str()));
    }
    for path in &deferred {
        patch.operations.push(delete_op(&from.manifest, path)?);
    }

    let mut deleted_dirs = diff.deleted_dirs.clone();
    util::sort_dirs_deepest_first(&mut deleted_dirs);
    for dir in &deleted_dirs {
        patch.operations.push(PatchOperation::delete_dir(dir.as_str()));
    }

    for path in &diff.added {
        let entry = manifest_entry(&to.manifest, path)?;
        let data = read_verified(&to.location, entry, options.large_file_threshold)?;
        debug!(path = %path, bytes = data.len(), mapped = data.is_mapped(), "add");
        patch
            .operations
            .push(PatchOperation::add(path.as_str(), data, &entry.checksum, entry.executable));
    }

    let mut modified: Vec<&String> = diff.modified.iter().collect();
    if !options.skip_identical {
        modified.extend(&diff.unchanged);
        modified.sort();
    }
    for path in modified {
        let old = manifest_entry(&from.manifest, path)?;
        let new = manifest_entry(&to.manifest, path)?;
        patch.operations.push(modify_op(from, to, old, new, options)?);
    }

    // The target key file is written first, or right after the directories
    // it needs when it is new.
    let is_key_write = |op: &PatchOperation| {
        op.path == to.key_file.path && matches!(op.kind, OperationKind::Add | OperationKind::Modify)
    };
    if let Some(pos) = patch.operations.iter().position(is_key_write) {
        let op = patch.operations.remove(pos);
        let at = match op.kind {
            OperationKind::Modify => 0,
            _ => blocking.len() + added_dirs.len(),
        };
        patch.operations.insert(at, op);
    }

    patch.validate()?;
    let summary = patch.summary();
    info!(
        from = %from.label,
        to = %to.label,
        operations = summary.total(),
        required = patch.required_files.len(),
        "Generated patch"
    );
    Ok(patch)
}

fn modify_op(
    from: &Version,
    to: &Version,
    old: &FileEntry,
    new: &FileEntry,
    options: &GeneratorOptions,
) -> Result<PatchOperation> {
    let large = binary_diff::is_large_file(old.size, options.large_file_threshold)
        || binary_diff::is_large_file(new.size, options.large_file_threshold);
    let new_data = read_verified(&to.location, new, options.large_file_threshold)?;

    if options.modify_strategy == ModifyStrategy::BinaryDiff && !large {
        let old_path = util::resolve_in(&from.location, &old.path)?;
        let old_data = util::mmap_file(&old_path)?;
        if util::sha256_bytes(&old_data) != old.checksum {
            return Err(PatchError::integrity(
                format!("source file {}", old.path),
                &old.checksum,
                &util::sha256_bytes(&old_data),
            ));
        }
        let delta = binary_diff::diff(&old_data, &new_data)?;
        if delta.len() < new_data.len() {
            debug!(path = %new.path, diff = delta.len(), full = new_data.len(), "modify (diff)");
            return Ok(PatchOperation::modify_diff(
                new.path.as_str(),
                &old.checksum,
                delta,
                &new.checksum,
                new.size,
                new.executable,
            ));
        }
    } else if large {
        debug!(path = %new.path, bytes = new.size, "Large file, shipping full replacement");
    }

    debug!(path = %new.path, bytes = new_data.len(), "modify (full)");
    Ok(PatchOperation::modify_full(
        new.path.as_str(),
        &old.checksum,
        new_data,
        &new.checksum,
        new.executable,
    ))
}

fn delete_op(manifest: &Manifest, path: &str) -> Result<PatchOperation> {
    let entry = manifest_entry(manifest, path)?;
    Ok(PatchOperation::delete(path, &entry.checksum, entry.size))
}

fn manifest_entry<'a>(manifest: &'a Manifest, path: &str) -> Result<&'a FileEntry> {
    manifest
        .file(path)
        .ok_or_else(|| {
            PatchError::Validation(format!("{path} is not in manifest {}", manifest.version))
        })
}

/// Read a file and confirm it still matches its manifest entry. Files above
/// the large-file threshold are memory-mapped rather than copied onto the heap.
fn read_verified(root: &Path, entry: &FileEntry, large_file_threshold: u64) -> Result<Payload> {
    let full = util::resolve_in(root, &entry.path)?;
    let data = if binary_diff::is_large_file(entry.size, large_file_threshold) {
        Payload::Mapped(Arc::new(util::mmap_file(&full)?))
    } else {
        Payload::Bytes(std::fs::read(&full).at(&full)?)
    };
    let actual = util::sha256_bytes(&data);
    if actual != entry.checksum {
        return Err(PatchError::integrity(
            format!("{} (changed since scan)", entry.path),
            &entry.checksum,
            &actual,
        ));
    }
    Ok(data)
}

fn is_under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
