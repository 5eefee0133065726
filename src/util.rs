use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::binary_diff::{self, DEFAULT_CHUNK_SIZE};
use crate::error::{IoResultExt, PatchError, Result};
use crate::progress::ProgressObserver;

/// Read buffer for streaming hashes. 256 KB keeps syscall count low on large trees.
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// Stream-hash a file with SHA-256, returning lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).at(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).at(path)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).at(path)?;
    // SAFETY: read-only mapping; the applier owns the target tree exclusively.
    unsafe { Mmap::map(&file).at(path) }
}

/// Convert a path relative to a tree root into the forward-slash form used in manifests.
///
/// Components are joined with `/` as they are, so a Unix file name that
/// contains a backslash or a colon keeps it. Names that [`resolve_in`] would
/// refuse are refused here too, at scan time.
pub fn relative_path_string(root: &Path, full: &Path) -> Result<String> {
    let relative = full.strip_prefix(root).map_err(|_| {
        PatchError::Validation(format!(
            "{} is not inside {}",
            full.display(),
            root.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return Err(PatchError::Validation(format!(
                "Unexpected component in {}",
                relative.display()
            )));
        };
        let name = name.to_str().ok_or_else(|| {
            PatchError::Validation(format!("Non-UTF8 path: {}", relative.display()))
        })?;
        check_component(name, &relative.display().to_string())?;
        parts.push(name);
    }
    Ok(parts.join("/"))
}

/// Reject a single path component that could leave the tree root.
///
/// On Windows a separator or drive marker inside a component would be
/// reinterpreted by the OS, so those are refused as well.
pub fn check_component(part: &str, path: &str) -> Result<()> {
    if part == ".." {
        return Err(PatchError::Validation(format!("Path escapes the tree root: {path}")));
    }
    #[cfg(windows)]
    if part.contains('\\') || part.contains(':') {
        return Err(PatchError::Validation(format!("Illegal path component in {path}")));
    }
    Ok(())
}

/// Resolve a manifest path under `root`, rejecting anything that could escape it.
pub fn resolve_in(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.starts_with('/') {
        return Err(PatchError::Validation(format!("Absolute path in manifest: {relative}")));
    }
    let mut full = root.to_path_buf();
    for component in relative.split('/') {
        match component {
            "" | "." => continue,
            part => {
                check_component(part, relative)?;
                full.push(part);
            }
        }
    }
    Ok(full)
}

/// Number of `/`-separated components.
pub fn path_depth(path: &str) -> usize {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).count()
}

/// Sort directory paths so parents come before children.
pub fn sort_dirs_parent_first(dirs: &mut [String]) {
    dirs.sort_by(|a, b| path_depth(a).cmp(&path_depth(b)).then_with(|| a.cmp(b)));
}

/// Sort directory paths so children come before parents (for deletion).
pub fn sort_dirs_deepest_first(dirs: &mut [String]) {
    dirs.sort_by(|a, b| path_depth(b).cmp(&path_depth(a)).then_with(|| b.cmp(a)));
}

/// Copy a directory tree into `dst`, directory by directory. Files are
/// streamed in fixed chunks so memory stays flat for very large trees.
pub fn copy_tree(src: &Path, dst: &Path, progress: Option<&dyn ProgressObserver>) -> Result<u64> {
    std::fs::create_dir_all(dst).at(dst)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
            PatchError::io(&path, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            PatchError::Validation(format!("{} escaped {}", entry.path().display(), src.display()))
        })?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).at(&target)?;
        } else {
            copied +=
                binary_diff::copy_chunked(entry.path(), &target, DEFAULT_CHUNK_SIZE, progress)?;
            let metadata = entry
                .metadata()
                .map_err(|e| PatchError::io(entry.path(), e.into()))?;
            let permissions = metadata.permissions();
            std::fs::set_permissions(&target, permissions).at(&target)?;
        }
    }

    Ok(copied)
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PatchError::io(path, e)),
    }
}

/// Set or clear the executable bits on Unix. No-op elsewhere.
#[cfg(unix)]
pub fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path).at(path)?.permissions();
    let mode = permissions.mode();
    let new_mode = if executable { mode | 0o111 } else { mode & !0o111 };
    if new_mode != mode {
        permissions.set_mode(new_mode);
        std::fs::set_permissions(path, permissions).at(path)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data = vec![7u8; 300 * 1024];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(&data));
    }

    #[test]
    fn test_sort_dirs_deepest_first() {
        let mut dirs: Vec<String> = ["a", "a/b/c", "z", "a/b"].map(String::from).to_vec();
        sort_dirs_deepest_first(&mut dirs);
        assert_eq!(dirs, vec!["a/b/c", "a/b", "z", "a"]);
    }

    #[test]
    fn test_sort_dirs_parent_first() {
        let mut dirs: Vec<String> = ["a/b/c", "b", "a", "a/b"].map(String::from).to_vec();
        sort_dirs_parent_first(&mut dirs);
        assert_eq!(dirs, vec!["a", "b", "a/b", "a/b/c"]);
    }

    #[test]
    fn test_resolve_in_rejects_escape() {
        let root = Path::new("/srv/app");
        assert_eq!(resolve_in(root, "bin/tool").unwrap(), root.join("bin").join("tool"));
        assert!(resolve_in(root, "../etc/passwd").is_err());
        assert!(resolve_in(root, "a/../../b").is_err());
        assert!(resolve_in(root, "/etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_names_with_colon_and_backslash() {
        let root = Path::new("/srv/app");
        assert_eq!(
            resolve_in(root, "logs/report-12:00.log").unwrap(),
            root.join("logs").join("report-12:00.log")
        );
        assert_eq!(resolve_in(root, "a\\b.txt").unwrap(), root.join("a\\b.txt"));

        let full = root.join("logs").join("a\\b.txt");
        assert_eq!(relative_path_string(root, &full).unwrap(), "logs/a\\b.txt");
        let full = root.join("report-12:00.log");
        assert_eq!(relative_path_string(root, &full).unwrap(), "report-12:00.log");
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested/empty")).unwrap();
        std::fs::write(src.join("top.txt"), b"top").unwrap();
        std::fs::write(src.join("nested/inner.bin"), vec![1u8; 5000]).unwrap();

        let dst = dir.path().join("dst");
        let copied = copy_tree(&src, &dst, None).unwrap();
        assert_eq!(copied, 5003);
        assert_eq!(std::fs::read(dst.join("top.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.join("nested/inner.bin")).unwrap(), vec![1u8; 5000]);
        assert!(dst.join("nested/empty").is_dir());
    }
}
