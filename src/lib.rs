//! treepatch - versioned directory-tree patching
//!
//! Scan two versions of a tree, generate a patch that turns one into the
//! other, optionally split it into parts, and apply it transactionally with a
//! full backup and rollback.

pub mod apply;
pub mod binary_diff;
pub mod config;
pub mod create;
pub mod error;
pub mod ignore;
pub mod manifest;
pub mod multipart;
pub mod patch_format;
pub mod progress;
pub mod registry;
pub mod scanner;
pub mod util;

mod rolling_hash;

pub use apply::{apply_patch, Applier, ApplyOptions, ApplyReport, ApplyState};
pub use config::PatchConfig;
pub use create::{
    compare_manifests, generate, generate_patch, GeneratorOptions, ManifestDiff, ModifyStrategy,
};
pub use error::{ErrorKind, PatchError, Result};
pub use manifest::{FileEntry, KeyFileInfo, Manifest, VerifyReport};
pub use multipart::{load_patch_set, write_patch_set};
pub use patch_format::{ApplySummary, Compression, OperationKind, Patch, PatchOperation, Payload};
pub use progress::ProgressObserver;
pub use registry::{ManifestCache, Version, VersionRegistry};
pub use scanner::{scan, ScanOptions, ScanResult};
