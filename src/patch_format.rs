//! Patch artifact: data model, validation and the on-disk encoding.
//!
//! On disk a patch is `MAGIC` followed by the bincode-encoded [`Patch`],
//! optionally wrapped whole in a zstd or gzip stream. The header checksum is
//! SHA-256 over the bincode encoding with the checksum field left blank.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::ops::Deref;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::binary_diff;
use crate::error::{IoResultExt, PatchError, Result};
use crate::manifest::KeyFileInfo;
use crate::util;

pub const MAGIC: &[u8; 8] = b"TPATCH01";
pub const FORMAT_VERSION: u32 = 1;
pub const PATCH_EXTENSION: &str = "patch";

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
            Compression::Gzip => "gzip",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Compression::None),
            "zstd" | "zst" => Ok(Compression::Zstd),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(PatchError::Validation(format!("Unknown compression: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchHeader {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub compression: Compression,
    /// Length of the canonical (uncompressed, checksum-blank) encoding.
    pub patch_size: u64,
    pub checksum: String,
    pub signature: Option<String>,
}

impl Default for PatchHeader {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            compression: Compression::default(),
            patch_size: 0,
            checksum: String::new(),
            signature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequirement {
    pub path: String,
    pub checksum: String,
    pub size: u64,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Modify,
    Delete,
    AddDir,
    DeleteDir,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Modify => "modify",
            OperationKind::Delete => "delete",
            OperationKind::AddDir => "add-dir",
            OperationKind::DeleteDir => "delete-dir",
        };
        f.write_str(name)
    }
}

/// File contents carried by an operation.
///
/// `Mapped` payloads borrow a memory-mapped source file, so a large file is
/// streamed from the page cache straight into the encoder. The file must not
/// change while the patch is alive. Decoding always yields `Bytes`.
#[derive(Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Mapped(Arc<Mmap>),
}

impl Payload {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Payload::Mapped(_))
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Mapped(map) => map,
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

// Same wire layout as `Vec<u8>`: a u64 length followed by the bytes.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(PayloadVisitor)
    }
}

struct PayloadVisitor;

impl<'de> Visitor<'de> for PayloadVisitor {
    type Value = Payload;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("file contents")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> std::result::Result<Payload, E> {
        Ok(Payload::Bytes(bytes.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> std::result::Result<Payload, E> {
        Ok(Payload::Bytes(bytes))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Payload, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1 << 20));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(Payload::Bytes(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub kind: OperationKind,
    pub path: String,
    /// Binary diff against the old file (Modify only).
    pub diff: Option<Vec<u8>>,
    /// Full new contents (Add, and Modify when replacing whole).
    pub data: Option<Payload>,
    pub old_checksum: Option<String>,
    pub new_checksum: Option<String>,
    /// Size of the resulting file (Add/Modify) or of the removed file (Delete).
    pub size: u64,
    pub executable: bool,
}

impl PatchOperation {
    fn bare(kind: OperationKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            diff: None,
            data: None,
            old_checksum: None,
            new_checksum: None,
            size: 0,
            executable: false,
        }
    }

    pub fn add_dir(path: impl Into<String>) -> Self {
        Self::bare(OperationKind::AddDir, path)
    }

    pub fn delete_dir(path: impl Into<String>) -> Self {
        Self::bare(OperationKind::DeleteDir, path)
    }

    pub fn delete(path: impl Into<String>, old_checksum: impl Into<String>, size: u64) -> Self {
        Self {
            old_checksum: Some(old_checksum.into()),
            size,
            ..Self::bare(OperationKind::Delete, path)
        }
    }

    pub fn add(
        path: impl Into<String>,
        data: impl Into<Payload>,
        new_checksum: impl Into<String>,
        executable: bool,
    ) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            data: Some(data),
            new_checksum: Some(new_checksum.into()),
            executable,
            ..Self::bare(OperationKind::Add, path)
        }
    }

    pub fn modify_full(
        path: impl Into<String>,
        old_checksum: impl Into<String>,
        data: impl Into<Payload>,
        new_checksum: impl Into<String>,
        executable: bool,
    ) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            data: Some(data),
            old_checksum: Some(old_checksum.into()),
            new_checksum: Some(new_checksum.into()),
            executable,
            ..Self::bare(OperationKind::Modify, path)
        }
    }

    pub fn modify_diff(
        path: impl Into<String>,
        old_checksum: impl Into<String>,
        diff: Vec<u8>,
        new_checksum: impl Into<String>,
        new_size: u64,
        executable: bool,
    ) -> Self {
        Self {
            size: new_size,
            diff: Some(diff),
            old_checksum: Some(old_checksum.into()),
            new_checksum: Some(new_checksum.into()),
            executable,
            ..Self::bare(OperationKind::Modify, path)
        }
    }

    /// Bytes of payload carried by this operation.
    pub fn payload_len(&self) -> u64 {
        let diff = self.diff.as_ref().map_or(0, Vec::len);
        let data = self.data.as_ref().map_or(0, |d| d.len());
        (diff + data) as u64
    }

    fn validate(&self, index: usize) -> Result<()> {
        let fail = |what: &str| {
            Err(PatchError::Validation(format!(
                "Operation {index} ({} {}): {what}",
                self.kind, self.path
            )))
        };
        let present = |value: &Option<String>| value.as_deref().is_some_and(|s| !s.is_empty());

        if self.path.trim_matches('/').is_empty() {
            return fail("missing path");
        }
        if self.path.starts_with('/') || self.path.split('/').any(|c| c == "..") {
            return fail("path must stay inside the tree");
        }

        match self.kind {
            OperationKind::Add => {
                if self.data.is_none() {
                    return fail("missing file data");
                }
                if !present(&self.new_checksum) {
                    return fail("missing new checksum");
                }
            }
            OperationKind::Modify => {
                if !present(&self.old_checksum) || !present(&self.new_checksum) {
                    return fail("missing old or new checksum");
                }
                if self.diff.is_none() && self.data.is_none() {
                    return fail("carries neither a diff nor file data");
                }
                if let Some(diff) = &self.diff {
                    if !binary_diff::is_diff_payload(diff) {
                        return Err(PatchError::Format(format!(
                            "Operation {index} ({}): binary diff lacks its magic header",
                            self.path
                        )));
                    }
                }
            }
            OperationKind::Delete => {
                if !present(&self.old_checksum) {
                    return fail("missing old checksum");
                }
            }
            OperationKind::AddDir | OperationKind::DeleteDir => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHash {
    pub part_number: u32,
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPartInfo {
    pub is_multi_part: bool,
    /// 1-based.
    pub part_number: u32,
    pub total_parts: u32,
    pub max_part_size: u64,
    /// Only populated on part 1.
    pub part_hashes: Vec<PartHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub header: PatchHeader,
    pub from_version: String,
    pub to_version: String,
    pub from_key_file: KeyFileInfo,
    pub to_key_file: KeyFileInfo,
    pub required_files: Vec<FileRequirement>,
    /// Application order is significant.
    pub operations: Vec<PatchOperation>,
    pub multi_part: Option<MultiPartInfo>,
}

/// Operation counts, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

impl ApplySummary {
    pub fn record(&mut self, kind: OperationKind) {
        match kind {
            OperationKind::AddDir => self.dirs_created += 1,
            OperationKind::Add => self.files_added += 1,
            OperationKind::Modify => self.files_modified += 1,
            OperationKind::Delete => self.files_deleted += 1,
            OperationKind::DeleteDir => self.dirs_deleted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.dirs_created
            + self.files_added
            + self.files_modified
            + self.files_deleted
            + self.dirs_deleted
    }
}

impl Patch {
    pub fn new(
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        from_key_file: KeyFileInfo,
        to_key_file: KeyFileInfo,
    ) -> Self {
        Self {
            header: PatchHeader::default(),
            from_version: from_version.into(),
            to_version: to_version.into(),
            from_key_file,
            to_key_file,
            required_files: Vec::new(),
            operations: Vec::new(),
            multi_part: None,
        }
    }

    /// Structural validation. Must pass before a patch is written or applied.
    pub fn validate(&self) -> Result<()> {
        if self.from_version.trim().is_empty() || self.to_version.trim().is_empty() {
            return Err(PatchError::Validation("Patch is missing its from/to version".into()));
        }
        if self.from_key_file.checksum.is_empty() || self.to_key_file.checksum.is_empty() {
            return Err(PatchError::Validation("Patch is missing a key-file checksum".into()));
        }
        if self.operations.is_empty() {
            return Err(PatchError::Validation("Patch contains no operations".into()));
        }
        for (index, op) in self.operations.iter().enumerate() {
            op.validate(index)?;
        }
        let incomplete = |r: &&FileRequirement| r.path.is_empty() || r.checksum.is_empty();
        if let Some(req) = self.required_files.iter().find(incomplete) {
            return Err(PatchError::Validation(format!(
                "Incomplete file requirement: '{}'",
                req.path
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for op in &self.operations {
            summary.record(op.kind);
        }
        summary
    }

    pub fn is_multi_part(&self) -> bool {
        self.multi_part.as_ref().is_some_and(|m| m.is_multi_part)
    }

    /// Fill in compression, size and checksum, then return the on-disk bytes.
    pub fn encode(&mut self, compression: Compression, level: i32) -> Result<Vec<u8>> {
        self.seal(compression)?;
        let mut bytes = Vec::new();
        self.write_stream(&mut bytes, compression, level)
            .map_err(|e| PatchError::Format(format!("{compression} encoding failed: {e}")))?;
        Ok(bytes)
    }

    /// Record compression, canonical size and checksum in the header. The
    /// canonical encoding is hashed as it is produced, never buffered.
    fn seal(&mut self, compression: Compression) -> Result<()> {
        self.header.compression = compression;
        self.header.checksum.clear();
        self.header.patch_size = bincode::serialized_size(&*self)?;
        self.header.checksum = self.canonical_digest()?;
        Ok(())
    }

    fn canonical_digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        bincode::serialize_into(&mut hasher, self)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Stream `MAGIC` + bincode through the compressor into `writer`.
    fn write_stream<W: Write>(
        &self,
        writer: W,
        compression: Compression,
        level: i32,
    ) -> io::Result<()> {
        match compression {
            Compression::None => self.write_document(writer).map(drop),
            Compression::Zstd => {
                let encoder = zstd::stream::Encoder::new(writer, level)?;
                self.write_document(encoder)?.finish().map(drop)
            }
            Compression::Gzip => {
                let level = flate2::Compression::new(level.clamp(0, 9) as u32);
                let encoder = flate2::write::GzEncoder::new(writer, level);
                self.write_document(encoder)?.finish().map(drop)
            }
        }
    }

    fn write_document<W: Write>(&self, mut writer: W) -> io::Result<W> {
        writer.write_all(MAGIC)?;
        bincode::serialize_into(&mut writer, self).map_err(into_io_error)?;
        Ok(writer)
    }

    /// Decode an artifact regardless of how it was compressed, then check its
    /// format version, checksum and structure.
    pub fn decode(bytes: &[u8]) -> Result<Patch> {
        let mut patch = Self::decode_unverified(bytes)?;
        if patch.header.format_version != FORMAT_VERSION {
            return Err(PatchError::Format(format!(
                "Unsupported patch version: {} (expected {})",
                patch.header.format_version, FORMAT_VERSION
            )));
        }
        patch.verify_checksum()?;
        patch.validate()?;
        Ok(patch)
    }

    fn decode_unverified(bytes: &[u8]) -> Result<Patch> {
        if bytes.starts_with(MAGIC) {
            return bincode::deserialize(&bytes[MAGIC.len()..])
                .map_err(|e| PatchError::Format(format!("Undecodable patch: {e}")));
        }

        let mut failures = Vec::new();
        match zstd::Decoder::new(bytes).map_err(stream_error).and_then(read_document) {
            Ok(patch) => return Ok(patch),
            Err(e) => failures.push(format!("zstd: {e}")),
        }
        match read_document(flate2::read::GzDecoder::new(bytes)) {
            Ok(patch) => return Ok(patch),
            Err(e) => failures.push(format!("gzip: {e}")),
        }
        Err(PatchError::Format(format!(
            "Unrecognized patch encoding ({})",
            failures.join("; ")
        )))
    }

    fn verify_checksum(&mut self) -> Result<()> {
        let recorded = std::mem::take(&mut self.header.checksum);
        let measured = bincode::serialized_size(&*self)
            .map_err(PatchError::from)
            .and_then(|size| Ok((size, self.canonical_digest()?)));
        self.header.checksum = recorded;
        let (size, actual) = measured?;

        if size != self.header.patch_size {
            return Err(PatchError::integrity(
                "patch size",
                &self.header.patch_size.to_string(),
                &size.to_string(),
            ));
        }
        if actual != self.header.checksum {
            return Err(PatchError::integrity("patch checksum", &self.header.checksum, &actual));
        }
        Ok(())
    }

    /// Encode straight into `path` through a buffered writer. Returns the
    /// number of bytes written.
    pub fn save(&mut self, path: &Path, compression: Compression, level: i32) -> Result<u64> {
        self.validate()?;
        self.seal(compression)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).at(parent)?;
        }

        let file = File::create(path).at(path)?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        self.write_stream(&mut out, compression, level).at(path)?;
        out.flush().at(path)?;
        drop(out);

        let written = std::fs::metadata(path).at(path)?.len();
        debug!(path = %path.display(), bytes = written, %compression, "Wrote patch");
        Ok(written)
    }

    pub fn load(path: &Path) -> Result<Patch> {
        let raw = util::mmap_file(path)?;
        Self::decode(&raw)
    }
}

fn stream_error(err: io::Error) -> PatchError {
    PatchError::Format(err.to_string())
}

fn into_io_error(err: bincode::Error) -> io::Error {
    match *err {
        bincode::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Read `MAGIC` + bincode from a decompressing reader.
fn read_document<R: Read>(mut reader: R) -> Result<Patch> {
    let mut magic = [0u8; MAGIC.len()];
    reader.read_exact(&mut magic).map_err(stream_error)?;
    if &magic != MAGIC {
        return Err(PatchError::Format("missing patch magic".into()));
    }
    Ok(bincode::deserialize_from(reader)?)
}
