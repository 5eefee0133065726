//! Error types for scanning, generating and applying patches

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Number of hex characters shown when a checksum appears in an error.
const DISPLAY_HASH_LEN: usize = 12;

/// Coarse classification of a [`PatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Format,
    Integrity,
    Io,
    Apply,
    Unrecoverable,
}

#[derive(Error, Debug)]
pub enum PatchError {
    /// Malformed or incomplete input (patch, manifest, registry request).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A file in the target tree does not match what the patch expects.
    #[error("Precondition failed for {path}: expected {expected}, found {actual}")]
    Precondition {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Required file is missing: {0}")]
    MissingFile(String),

    /// Bytes that could not be decoded (artifact, compression, diff payload).
    #[error("Format error: {0}")]
    Format(String),

    #[error("Integrity check failed for {what}: expected {expected}, found {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single operation failed while the target was being mutated.
    #[error("Operation {index} ({path}) failed: {source}")]
    Apply {
        index: usize,
        path: String,
        #[source]
        source: Box<PatchError>,
    },

    #[error(
        "Rollback failed, manual intervention required (backup retained at {}): {reason}",
        backup.display()
    )]
    Unrecoverable { backup: PathBuf, reason: String },
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::Validation(_)
            | PatchError::Precondition { .. }
            | PatchError::MissingFile(_) => ErrorKind::Validation,
            PatchError::Format(_) => ErrorKind::Format,
            PatchError::Integrity { .. } => ErrorKind::Integrity,
            PatchError::Io { .. } => ErrorKind::Io,
            PatchError::Apply { .. } => ErrorKind::Apply,
            PatchError::Unrecoverable { .. } => ErrorKind::Unrecoverable,
        }
    }

    pub fn precondition(path: impl Into<String>, expected: &str, actual: &str) -> Self {
        PatchError::Precondition {
            path: path.into(),
            expected: short_hash(expected).to_string(),
            actual: short_hash(actual).to_string(),
        }
    }

    pub fn integrity(what: impl Into<String>, expected: &str, actual: &str) -> Self {
        PatchError::Integrity {
            what: what.into(),
            expected: short_hash(expected).to_string(),
            actual: short_hash(actual).to_string(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<bincode::Error> for PatchError {
    fn from(err: bincode::Error) -> Self {
        PatchError::Format(format!("bincode: {err}"))
    }
}

/// Result type alias for treepatch operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Attach the offending path to `std::io::Error`s.
pub trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| PatchError::io(path, e))
    }
}

/// Truncate a hex checksum for display.
pub fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(DISPLAY_HASH_LEN) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash(""), "");
    }

    #[test]
    fn test_precondition_truncates_hashes() {
        let err = PatchError::precondition("bin/app", &"a".repeat(64), &"b".repeat(64));
        let msg = err.to_string();
        assert!(msg.contains("bin/app"));
        assert!(msg.contains(&"a".repeat(12)));
        assert!(!msg.contains(&"a".repeat(13)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(PatchError::Format("x".into()).kind(), ErrorKind::Format);
        assert_eq!(
            PatchError::integrity("part 2", "aa", "bb").kind(),
            ErrorKind::Integrity
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Result<()> = Err(io).at("/tmp/missing");
        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("/tmp/missing"));

        let apply = PatchError::Apply {
            index: 3,
            path: "a.txt".into(),
            source: Box::new(PatchError::MissingFile("a.txt".into())),
        };
        assert_eq!(apply.kind(), ErrorKind::Apply);
        assert!(apply.to_string().starts_with("Operation 3 (a.txt) failed"));
    }

    #[test]
    fn test_unrecoverable_mentions_backup() {
        let err = PatchError::Unrecoverable {
            backup: PathBuf::from("/srv/.patch_backup/app"),
            reason: "permission denied".into(),
        };
        assert!(err.to_string().contains("/srv/.patch_backup/app"));
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
    }
}
