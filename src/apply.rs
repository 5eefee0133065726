//! Transactional application of a patch to a target tree.
//!
//! Pre-verify, back up the whole tree next to it, apply operations strictly in
//! patch order, post-verify, then drop the backup. Any failure once the backup
//! exists restores it; the target is either fully patched or left as it was.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::binary_diff;
use crate::error::{IoResultExt, PatchError, Result};
use crate::patch_format::{ApplySummary, OperationKind, Patch, PatchOperation};
use crate::progress::{self, ProgressObserver};
use crate::scanner::BACKUP_DIR_NAME;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    PreVerify,
    Backup,
    Applying,
    PostVerify,
    Cleanup,
    Completed,
    Rollback,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Run the pre-verification and report what would change, touching nothing.
    pub dry_run: bool,
    /// Without a backup, a failure leaves the target partially patched.
    pub create_backup: bool,
    pub verify_after: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            create_backup: true,
            verify_after: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub from_version: String,
    pub to_version: String,
    pub summary: ApplySummary,
    pub dry_run: bool,
    pub verified: bool,
}

pub struct Applier<'a> {
    options: ApplyOptions,
    progress: Option<&'a dyn ProgressObserver>,
    state: ApplyState,
}

impl<'a> Applier<'a> {
    pub fn new(options: ApplyOptions) -> Self {
        Self {
            options,
            progress: None,
            state: ApplyState::Idle,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressObserver) -> Self {
        self.progress = Some(progress);
        self
    }

    /// State reached by the last [`apply`](Self::apply) call.
    pub fn state(&self) -> ApplyState {
        self.state
    }

    fn enter(&mut self, state: ApplyState) {
        debug!(from = ?self.state, to = ?state, "Applier state");
        self.state = state;
    }

    pub fn apply(&mut self, patch: &Patch, target: &Path) -> Result<ApplyReport> {
        self.state = ApplyState::Idle;
        if !target.is_dir() {
            self.enter(ApplyState::Failed);
            return Err(PatchError::Validation(format!(
                "Target directory does not exist: {}",
                target.display()
            )));
        }
        let target = target.canonicalize().at(target)?;

        self.enter(ApplyState::PreVerify);
        if let Err(e) = pre_verify(patch, &target) {
            self.enter(ApplyState::Failed);
            return Err(e);
        }
        info!(
            from = %patch.from_version,
            to = %patch.to_version,
            target = %target.display(),
            "Target matches patch preconditions"
        );

        let mut report = ApplyReport {
            from_version: patch.from_version.clone(),
            to_version: patch.to_version.clone(),
            summary: ApplySummary::default(),
            dry_run: self.options.dry_run,
            verified: false,
        };
        if self.options.dry_run {
            report.summary = patch.summary();
            self.enter(ApplyState::Completed);
            return Ok(report);
        }

        let backup = if self.options.create_backup {
            self.enter(ApplyState::Backup);
            match create_backup(&target, self.progress) {
                Ok(path) => Some(path),
                Err(e) => {
                    self.enter(ApplyState::Failed);
                    return Err(e);
                }
            }
        } else {
            warn!(
                target = %target.display(),
                "Applying without a backup; failures cannot be rolled back"
            );
            None
        };

        let outcome = self.apply_and_verify(patch, &target, &mut report);
        match (outcome, backup) {
            (Ok(()), backup) => {
                self.enter(ApplyState::Cleanup);
                if let Some(backup) = backup {
                    discard_backup(&backup);
                }
                self.enter(ApplyState::Completed);
                info!(
                    to = %patch.to_version,
                    operations = report.summary.total(),
                    "Patch applied"
                );
                Ok(report)
            }
            (Err(e), Some(backup)) => {
                self.enter(ApplyState::Rollback);
                warn!(error = %e, "Patch failed, restoring backup");
                match restore_backup(&target, &backup, self.progress) {
                    Ok(()) => {
                        self.enter(ApplyState::RolledBack);
                        info!(target = %target.display(), "Target restored");
                        Err(e)
                    }
                    Err(reason) => {
                        self.enter(ApplyState::Failed);
                        error!(
                            backup = %backup.display(),
                            %reason,
                            original = %e,
                            "Rollback failed"
                        );
                        Err(PatchError::Unrecoverable {
                            backup,
                            reason: format!("{reason} (after: {e})"),
                        })
                    }
                }
            }
            (Err(e), None) => {
                self.enter(ApplyState::Failed);
                Err(e)
            }
        }
    }

    fn apply_and_verify(
        &mut self,
        patch: &Patch,
        target: &Path,
        report: &mut ApplyReport,
    ) -> Result<()> {
        self.enter(ApplyState::Applying);
        let total = patch.operations.len() as u64;
        for (index, op) in patch.operations.iter().enumerate() {
            apply_operation(target, op).map_err(|source| PatchError::Apply {
                index,
                path: op.path.clone(),
                source: Box::new(source),
            })?;
            report.summary.record(op.kind);
            progress::report(self.progress, index as u64 + 1, total, &op.path);
        }

        if self.options.verify_after {
            self.enter(ApplyState::PostVerify);
            post_verify(patch, target)?;
            report.verified = true;
        }
        Ok(())
    }
}

/// One-shot apply without progress reporting.
pub fn apply_patch(patch: &Patch, target: &Path, options: ApplyOptions) -> Result<ApplyReport> {
    Applier::new(options).apply(patch, target)
}

/// `<parent>/.patch_backup/<target name>`
pub fn backup_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| PatchError::Validation(format!("Cannot back up {}", target.display())))?;
    let parent = target
        .parent()
        .ok_or_else(|| PatchError::Validation(format!("Cannot back up {}", target.display())))?;
    Ok(parent.join(BACKUP_DIR_NAME).join(name))
}

fn pre_verify(patch: &Patch, target: &Path) -> Result<()> {
    patch.validate()?;

    let key = &patch.from_key_file;
    let key_path = util::resolve_in(target, &key.path)?;
    if !key_path.is_file() {
        return Err(PatchError::MissingFile(key.path.clone()));
    }
    let actual = util::sha256_file(&key_path)?;
    if actual != key.checksum {
        return Err(PatchError::precondition(&key.path, &key.checksum, &actual));
    }

    for requirement in &patch.required_files {
        let full = util::resolve_in(target, &requirement.path)?;
        if !full.is_file() {
            if requirement.required {
                return Err(PatchError::MissingFile(requirement.path.clone()));
            }
            continue;
        }
        let actual = util::sha256_file(&full)?;
        if actual != requirement.checksum {
            return Err(PatchError::precondition(&requirement.path, &requirement.checksum, &actual));
        }
    }
    debug!(required = patch.required_files.len(), "Pre-verification passed");
    Ok(())
}

fn create_backup(target: &Path, progress: Option<&dyn ProgressObserver>) -> Result<PathBuf> {
    let backup = backup_path(target)?;
    if backup.exists() {
        warn!(backup = %backup.display(), "Removing stale backup");
        util::remove_tree(&backup)?;
    }
    let bytes = util::copy_tree(target, &backup, progress)?;
    info!(backup = %backup.display(), bytes, "Backed up target");
    Ok(backup)
}

fn discard_backup(backup: &Path) {
    if let Err(e) = util::remove_tree(backup) {
        warn!(backup = %backup.display(), error = %e, "Could not remove backup");
        return;
    }
    // Only succeeds when no other backups share the directory.
    if let Some(root) = backup.parent() {
        let _ = std::fs::remove_dir(root);
    }
}

/// Replace the target with the backup. Returns a description of the failure.
fn restore_backup(
    target: &Path,
    backup: &Path,
    progress: Option<&dyn ProgressObserver>,
) -> std::result::Result<(), String> {
    util::remove_tree(target).map_err(|e| format!("could not clear target: {e}"))?;
    if std::fs::rename(backup, target).is_err() {
        util::copy_tree(backup, target, progress)
            .map_err(|e| format!("could not copy backup: {e}"))?;
        util::remove_tree(backup)
            .map_err(|e| format!("restored, but could not remove backup: {e}"))?;
    }
    if let Some(root) = backup.parent() {
        let _ = std::fs::remove_dir(root);
    }
    Ok(())
}

fn apply_operation(target: &Path, op: &PatchOperation) -> Result<()> {
    let full = util::resolve_in(target, &op.path)?;
    match op.kind {
        OperationKind::AddDir => {
            std::fs::create_dir_all(&full).at(&full)?;
        }
        OperationKind::DeleteDir => match std::fs::remove_dir(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %op.path, "Directory already gone");
            }
            // Untracked or ignored files are never deleted on the patch's behalf.
            Err(_) if has_entries(&full) => {
                warn!(
                    path = %op.path,
                    "Directory still holds untracked files, leaving it in place"
                );
            }
            Err(e) => return Err(PatchError::io(&full, e)),
        },
        OperationKind::Delete => {
            let expected = op.old_checksum.as_deref().unwrap_or_default();
            check_existing(&full, &op.path, expected)?;
            std::fs::remove_file(&full).at(&full)?;
        }
        OperationKind::Add => {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            let data = op.data.as_deref().unwrap_or_default();
            std::fs::write(&full, data).at(&full)?;
            finish_write(&full, op)?;
        }
        OperationKind::Modify => {
            let expected = op.old_checksum.as_deref().unwrap_or_default();
            match (&op.diff, &op.data) {
                (Some(diff), _) => {
                    // The map must be gone before the file is rewritten.
                    let new_data = {
                        let old = util::mmap_file(&full)?;
                        let actual = util::sha256_bytes(&old);
                        if actual != expected {
                            return Err(PatchError::precondition(&op.path, expected, &actual));
                        }
                        binary_diff::apply(&old, diff)?
                    };
                    std::fs::write(&full, &new_data).at(&full)?;
                }
                (None, Some(data)) => {
                    check_existing(&full, &op.path, expected)?;
                    std::fs::write(&full, data).at(&full)?;
                }
                (None, None) => {
                    return Err(PatchError::Validation(format!(
                        "{}: modify without contents",
                        op.path
                    )));
                }
            }
            finish_write(&full, op)?;
        }
    }
    debug!(kind = %op.kind, path = %op.path, "Applied");
    Ok(())
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

fn check_existing(full: &Path, path: &str, expected: &str) -> Result<()> {
    if !full.is_file() {
        return Err(PatchError::MissingFile(path.to_string()));
    }
    let actual = util::sha256_file(full)?;
    if actual != expected {
        return Err(PatchError::precondition(path, expected, &actual));
    }
    Ok(())
}

/// Set the executable bit and confirm the written bytes hash as expected.
fn finish_write(full: &Path, op: &PatchOperation) -> Result<()> {
    util::set_executable(full, op.executable)?;
    let expected = op.new_checksum.as_deref().unwrap_or_default();
    let actual = util::sha256_file(full)?;
    if actual != expected {
        return Err(PatchError::integrity(format!("written file {}", op.path), expected, &actual));
    }
    Ok(())
}

fn post_verify(patch: &Patch, target: &Path) -> Result<()> {
    let key = &patch.to_key_file;
    let key_path = util::resolve_in(target, &key.path)?;
    if !key_path.is_file() {
        return Err(PatchError::MissingFile(key.path.clone()));
    }
    let actual = util::sha256_file(&key_path)?;
    if actual != key.checksum {
        return Err(PatchError::integrity(format!("key file {}", key.path), &key.checksum, &actual));
    }

    let mut checked = 0usize;
    for op in &patch.operations {
        if !matches!(op.kind, OperationKind::Add | OperationKind::Modify) {
            continue;
        }
        let full = util::resolve_in(target, &op.path)?;
        let expected = op.new_checksum.as_deref().unwrap_or_default();
        let actual = util::sha256_file(&full)?;
        if actual != expected {
            return Err(PatchError::integrity(
                format!("patched file {}", op.path),
                expected,
                &actual,
            ));
        }
        checked += 1;
    }
    debug!(checked, "Post-verification passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::KeyFileInfo;
    use crate::patch_format::FileRequirement;
    use std::fs;

    fn key(contents: &[u8]) -> KeyFileInfo {
        KeyFileInfo {
            path: "app.bin".into(),
            checksum: util::sha256_bytes(contents),
            size: contents.len() as u64,
        }
    }

    /// Target holding app.bin = "v1" and notes.txt = "keep".
    fn setup() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("game");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("app.bin"), b"v1").unwrap();
        fs::write(target.join("notes.txt"), b"keep").unwrap();
        (root, target)
    }

    fn upgrade() -> Patch {
        let mut patch = Patch::new("1", "2", key(b"v1"), key(b"v2"));
        patch.required_files = vec![
            FileRequirement {
                path: "app.bin".into(),
                checksum: util::sha256_bytes(b"v1"),
                size: 2,
                required: true,
            },
            FileRequirement {
                path: "notes.txt".into(),
                checksum: util::sha256_bytes(b"keep"),
                size: 4,
                required: true,
            },
        ];
        patch.operations = vec![
            PatchOperation::add_dir("levels"),
            PatchOperation::add(
                "levels/one.map",
                b"map".to_vec(),
                util::sha256_bytes(b"map"),
                false,
            ),
            PatchOperation::modify_full(
                "app.bin",
                util::sha256_bytes(b"v1"),
                b"v2".to_vec(),
                util::sha256_bytes(b"v2"),
                true,
            ),
        ];
        patch
    }

    #[test]
    fn test_apply_success_cleans_backup() {
        let (root, target) = setup();
        let mut applier = Applier::new(ApplyOptions::default());
        let report = applier.apply(&upgrade(), &target).unwrap();

        assert_eq!(applier.state(), ApplyState::Completed);
        assert!(report.verified);
        assert_eq!(report.summary.dirs_created, 1);
        assert_eq!(report.summary.files_added, 1);
        assert_eq!(report.summary.files_modified, 1);
        assert_eq!(fs::read(target.join("app.bin")).unwrap(), b"v2");
        assert_eq!(fs::read(target.join("levels/one.map")).unwrap(), b"map");
        assert!(!root.path().join(BACKUP_DIR_NAME).exists());
    }

    #[test]
    fn test_precondition_mismatch_touches_nothing() {
        let (root, target) = setup();
        fs::write(target.join("notes.txt"), b"edited").unwrap();

        let mut applier = Applier::new(ApplyOptions::default());
        let err = applier.apply(&upgrade(), &target).unwrap_err();
        assert!(matches!(err, PatchError::Precondition { .. }));
        assert_eq!(applier.state(), ApplyState::Failed);
        assert_eq!(fs::read(target.join("app.bin")).unwrap(), b"v1");
        assert!(!target.join("levels").exists());
        assert!(!root.path().join(BACKUP_DIR_NAME).exists());
    }

    #[test]
    fn test_missing_required_file() {
        let (_root, target) = setup();
        fs::remove_file(target.join("notes.txt")).unwrap();
        let err = apply_patch(&upgrade(), &target, ApplyOptions::default()).unwrap_err();
        assert!(matches!(err, PatchError::MissingFile(ref p) if p == "notes.txt"));
    }

    #[test]
    fn test_failure_mid_patch_rolls_back() {
        let (root, target) = setup();
        let mut patch = upgrade();
        // Third op fails: recorded checksum does not match notes.txt.
        patch.operations.insert(2, PatchOperation::delete("notes.txt", "f".repeat(64), 4));

        let mut applier = Applier::new(ApplyOptions::default());
        let err = applier.apply(&patch, &target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Apply);
        assert!(matches!(err, PatchError::Apply { index: 2, .. }));
        assert_eq!(applier.state(), ApplyState::RolledBack);

        assert_eq!(fs::read(target.join("app.bin")).unwrap(), b"v1");
        assert_eq!(fs::read(target.join("notes.txt")).unwrap(), b"keep");
        assert!(!target.join("levels").exists());
        assert!(!root.path().join(BACKUP_DIR_NAME).exists());
    }

    #[test]
    fn test_post_verify_failure_rolls_back() {
        let (_root, target) = setup();
        let mut patch = upgrade();
        patch.to_key_file.checksum = "0".repeat(64);

        let mut applier = Applier::new(ApplyOptions::default());
        let err = applier.apply(&patch, &target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(applier.state(), ApplyState::RolledBack);
        assert_eq!(fs::read(target.join("app.bin")).unwrap(), b"v1");
    }

    #[test]
    fn test_dry_run_reports_without_mutation() {
        let (_root, target) = setup();
        let options = ApplyOptions {
            dry_run: true,
            ..ApplyOptions::default()
        };
        let report = apply_patch(&upgrade(), &target, options).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.summary.total(), 3);
        assert_eq!(fs::read(target.join("app.bin")).unwrap(), b"v1");
        assert!(!target.join("levels").exists());
    }

    #[test]
    fn test_stale_backup_is_replaced() {
        let (root, target) = setup();
        let stale = backup_path(&target.canonicalize().unwrap()).unwrap();
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("junk"), b"old").unwrap();

        apply_patch(&upgrade(), &target, ApplyOptions::default()).unwrap();
        assert!(!root.path().join(BACKUP_DIR_NAME).exists());
    }

    #[test]
    fn test_delete_dir_keeps_untracked_contents() {
        let (_root, target) = setup();
        fs::create_dir_all(target.join("cache/deep")).unwrap();
        fs::create_dir_all(target.join("cache/empty")).unwrap();
        fs::write(target.join("cache/deep/saved.dat"), b"user data").unwrap();

        let mut patch = upgrade();
        patch.operations.push(PatchOperation::delete_dir("cache/empty"));
        patch.operations.push(PatchOperation::delete_dir("cache/deep"));
        patch.operations.push(PatchOperation::delete_dir("cache"));
        let mut applier = Applier::new(ApplyOptions::default());
        let report = applier.apply(&patch, &target).unwrap();

        assert_eq!(applier.state(), ApplyState::Completed);
        assert_eq!(report.summary.dirs_deleted, 3);
        assert!(!target.join("cache/empty").exists());
        assert_eq!(fs::read(target.join("cache/deep/saved.dat")).unwrap(), b"user data");
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_restore_is_unrecoverable() {
        let (root, target) = setup();
        let backup = backup_path(&target.canonicalize().unwrap()).unwrap();
        let displaced = root.path().join("displaced");

        // Once the first file is written, swap the target directory for a
        // plain file: the next operation fails and the target cannot be cleared.
        let observer = |_current: u64, _total: u64, label: &str| {
            if label == "levels/one.map" {
                fs::rename(&target, &displaced).unwrap();
                fs::write(&target, b"not a directory").unwrap();
            }
        };
        let mut applier = Applier::new(ApplyOptions::default()).with_progress(&observer);
        let err = applier.apply(&upgrade(), &target).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        match &err {
            PatchError::Unrecoverable { backup: reported, reason } => {
                assert_eq!(reported, &backup);
                assert!(reason.contains("could not clear target"), "{reason}");
            }
            other => panic!("expected an unrecoverable failure, got {other}"),
        }
        assert_eq!(applier.state(), ApplyState::Failed);
        // The backup is left where the error says it is.
        assert_eq!(fs::read(backup.join("app.bin")).unwrap(), b"v1");
        assert_eq!(fs::read(backup.join("notes.txt")).unwrap(), b"keep");
    }

    #[test]
    fn test_missing_target() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        let err = apply_patch(&upgrade(), &missing, ApplyOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_modify_with_binary_diff() {
        let (_root, target) = setup();
        let old: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
        let mut new = old.clone();
        new[5000..5010].copy_from_slice(b"0123456789");
        fs::write(target.join("data.pak"), &old).unwrap();

        let mut patch = upgrade();
        patch.operations.push(PatchOperation::modify_diff(
            "data.pak",
            util::sha256_bytes(&old),
            binary_diff::diff(&old, &new).unwrap(),
            util::sha256_bytes(&new),
            new.len() as u64,
            false,
        ));
        apply_patch(&patch, &target, ApplyOptions::default()).unwrap();
        assert_eq!(fs::read(target.join("data.pak")).unwrap(), new);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_applied() {
        use std::os::unix::fs::PermissionsExt;
        let (_root, target) = setup();
        apply_patch(&upgrade(), &target, ApplyOptions::default()).unwrap();
        let mode = fs::metadata(target.join("app.bin")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
