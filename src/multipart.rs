//! Splitting oversized patches into parts and reassembling them.
//!
//! Parts are named `<base>.01.patch`, `<base>.02.patch`, … Part 1 records the
//! SHA-256 and size of every later part file; a merge refuses to use any part
//! whose bytes disagree with that list.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{IoResultExt, PatchError, Result};
use crate::patch_format::{
    Compression, MultiPartInfo, PartHash, Patch, PatchHeader, PatchOperation, MAGIC,
    PATCH_EXTENSION,
};
use crate::util;

/// Encoded size of one [`PartHash`]: number, length-prefixed hex digest, size.
const PART_HASH_ENCODED_LEN: u64 = 4 + 8 + 64 + 8;

pub fn single_file_name(base: &str) -> String {
    format!("{base}.{PATCH_EXTENSION}")
}

pub fn part_file_name(base: &str, part: u32) -> String {
    format!("{base}.{part:02}.{PATCH_EXTENSION}")
}

/// Split `patch` into parts whose encoded (uncompressed) size stays within
/// `max_part_size` where possible. Operations keep their order; an operation
/// that alone exceeds the budget becomes a part of its own.
pub fn split(patch: Patch, max_part_size: u64) -> Result<Vec<Patch>> {
    if max_part_size == 0 {
        return Err(PatchError::Validation("Maximum part size must be positive".into()));
    }
    patch.validate()?;

    let Patch {
        header,
        from_version,
        to_version,
        from_key_file,
        to_key_file,
        required_files,
        operations,
        ..
    } = patch;

    let mut skeleton = Patch {
        header: PatchHeader {
            checksum: "0".repeat(64),
            ..header
        },
        from_version,
        to_version,
        from_key_file,
        to_key_file,
        required_files,
        operations: Vec::new(),
        multi_part: Some(MultiPartInfo {
            is_multi_part: true,
            part_number: 1,
            total_parts: 1,
            max_part_size,
            part_hashes: Vec::new(),
        }),
    };
    let overhead = MAGIC.len() as u64 + bincode::serialized_size(&skeleton)?;

    let sizes = operations
        .iter()
        .map(bincode::serialized_size)
        .collect::<std::result::Result<Vec<u64>, _>>()?;

    // Part 1 carries one PartHash per later part. Re-pack with a larger
    // reserve until the reserve covers the part count it produced.
    let mut reserve = 0u64;
    let (counts, budget) = loop {
        let budget = max_part_size.saturating_sub(overhead + reserve).max(1);
        let counts = pack(&sizes, budget);
        let needed = PART_HASH_ENCODED_LEN * (counts.len() as u64).saturating_sub(1);
        if needed <= reserve {
            break (counts, budget);
        }
        reserve = needed;
    };

    let mut operations = operations.into_iter();
    let groups: Vec<Vec<PatchOperation>> = counts
        .iter()
        .map(|&count| operations.by_ref().take(count).collect())
        .collect();

    let total = groups.len() as u32;
    skeleton.header.checksum.clear();
    let parts = groups
        .into_iter()
        .enumerate()
        .map(|(i, ops)| {
            let mut part = Patch {
                header: skeleton.header.clone(),
                from_version: skeleton.from_version.clone(),
                to_version: skeleton.to_version.clone(),
                from_key_file: skeleton.from_key_file.clone(),
                to_key_file: skeleton.to_key_file.clone(),
                required_files: skeleton.required_files.clone(),
                operations: ops,
                multi_part: None,
            };
            part.multi_part = Some(MultiPartInfo {
                is_multi_part: true,
                part_number: i as u32 + 1,
                total_parts: total,
                max_part_size,
                part_hashes: Vec::new(),
            });
            part
        })
        .collect::<Vec<_>>();

    debug!(parts = parts.len(), budget, reserve, "Split patch");
    Ok(parts)
}

/// Greedy contiguous packing. Returns how many operations go in each part.
fn pack(sizes: &[u64], budget: u64) -> Vec<usize> {
    let mut counts = Vec::new();
    let (mut count, mut used) = (0usize, 0u64);
    for &size in sizes {
        if count > 0 && used + size > budget {
            counts.push(count);
            count = 0;
            used = 0;
        }
        count += 1;
        used += size;
    }
    if count > 0 {
        counts.push(count);
    }
    counts
}

/// Write `patch` to `dir`. When `max_part_size` is set and the uncompressed
/// encoding is larger, it is split into numbered parts with the hash chain in
/// part 1. Every file is streamed to disk. Returns the written paths, part 1
/// first.
pub fn write_patch_set(
    mut patch: Patch,
    dir: &Path,
    base: &str,
    max_part_size: Option<u64>,
    compression: Compression,
    level: i32,
) -> Result<Vec<PathBuf>> {
    patch.validate()?;
    std::fs::create_dir_all(dir).at(dir)?;

    let encoded_len = MAGIC.len() as u64 + bincode::serialized_size(&patch)?;
    let limit = match max_part_size {
        Some(limit) if encoded_len > limit => limit,
        _ => {
            let path = dir.join(single_file_name(base));
            let written = patch.save(&path, compression, level)?;
            info!(path = %path.display(), bytes = written, "Wrote patch");
            return Ok(vec![path]);
        }
    };

    let mut parts = split(patch, limit)?;
    let mut paths = Vec::with_capacity(parts.len());
    let mut hashes = Vec::with_capacity(parts.len().saturating_sub(1));

    for part in parts.iter_mut().skip(1) {
        let number = part.multi_part.as_ref().map_or(0, |m| m.part_number);
        let path = dir.join(part_file_name(base, number));
        let size = part.save(&path, compression, level)?;
        hashes.push(PartHash {
            part_number: number,
            checksum: util::sha256_file(&path)?,
            size,
        });
        debug!(path = %path.display(), bytes = size, "Wrote part");
        paths.push(path);
    }

    let first = &mut parts[0];
    if let Some(info) = first.multi_part.as_mut() {
        info.part_hashes = hashes;
    }
    let first_path = dir.join(part_file_name(base, 1));
    first.save(&first_path, compression, level)?;
    paths.insert(0, first_path);

    info!(parts = paths.len(), dir = %dir.display(), base, "Wrote multi-part patch");
    Ok(paths)
}

/// Load a patch from `path`. A multi-part set is reassembled from its
/// siblings after each part's bytes are checked against part 1.
pub fn load_patch_set(path: &Path) -> Result<Patch> {
    let mut first = Patch::load(path)?;
    let info = match first.multi_part.take() {
        Some(info) if info.is_multi_part => info,
        _ => return Ok(first),
    };
    if info.part_number != 1 {
        return Err(PatchError::Validation(format!(
            "{} is part {} of {}; load part 1 instead",
            path.display(),
            info.part_number,
            info.total_parts
        )));
    }

    let base = part_base(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for number in 2..=info.total_parts {
        let expected = info
            .part_hashes
            .iter()
            .find(|h| h.part_number == number)
            .ok_or_else(|| {
                PatchError::integrity(format!("part {number} hash entry"), "present", "missing")
            })?;

        let part_path = dir.join(part_file_name(&base, number));
        let size = std::fs::metadata(&part_path).at(&part_path)?.len();
        if size != expected.size {
            return Err(PatchError::integrity(
                format!("part {number} size"),
                &expected.size.to_string(),
                &size.to_string(),
            ));
        }
        let actual = util::sha256_file(&part_path)?;
        if actual != expected.checksum {
            return Err(PatchError::integrity(
                format!("part {number}"),
                &expected.checksum,
                &actual,
            ));
        }

        let part = Patch::load(&part_path)?;
        let consistent = part.from_version == first.from_version
            && part.to_version == first.to_version
            && part
                .multi_part
                .as_ref()
                .is_some_and(|m| m.part_number == number && m.total_parts == info.total_parts);
        if !consistent {
            return Err(PatchError::integrity(
                format!("part {number} metadata"),
                &format!("{} -> {}", first.from_version, first.to_version),
                &format!("{} -> {}", part.from_version, part.to_version),
            ));
        }
        debug!(part = number, operations = part.operations.len(), "Verified part");
        first.operations.extend(part.operations);
    }

    first.validate()?;
    info!(
        parts = info.total_parts,
        operations = first.operations.len(),
        "Merged multi-part patch"
    );
    Ok(first)
}

/// `<dir>/<base>.01.patch` -> `<base>`
fn part_base(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PatchError::Validation(format!("Bad part file name: {}", path.display())))?;
    name.strip_suffix(&format!(".01.{PATCH_EXTENSION}"))
        .map(str::to_string)
        .ok_or_else(|| {
            PatchError::Validation(format!(
                "Part 1 must be named <base>.01.{PATCH_EXTENSION}: {}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::KeyFileInfo;

    fn big_patch(ops: usize, payload: usize) -> Patch {
        let key = |c: &str| KeyFileInfo {
            path: "app".into(),
            checksum: c.into(),
            size: 1,
        };
        let mut patch = Patch::new("1.0", "2.0", key("aa"), key("bb"));
        patch.operations.push(PatchOperation::add_dir("assets"));
        let mut state = 0x2545_f491_u32;
        for i in 0..ops {
            // xorshift noise so compression cannot shrink parts below the limit
            let data: Vec<u8> = (0..payload)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect();
            let checksum = util::sha256_bytes(&data);
            patch
                .operations
                .push(PatchOperation::add(format!("assets/{i}.bin"), data, checksum, false));
        }
        patch
    }

    #[test]
    fn test_file_names() {
        assert_eq!(part_file_name("game-1.1", 3), "game-1.1.03.patch");
        assert_eq!(single_file_name("game-1.1"), "game-1.1.patch");
        assert_eq!(part_base(Path::new("/x/game-1.1.01.patch")).unwrap(), "game-1.1");
        assert!(part_base(Path::new("/x/game-1.1.02.patch")).is_err());
    }

    #[test]
    fn test_split_preserves_order_and_oversized_ops() {
        let patch = big_patch(6, 1000);
        let original = patch.operations.clone();
        let parts = split(patch, 2500).unwrap();
        assert!(parts.len() >= 3);

        let rejoined: Vec<_> = parts.iter().flat_map(|p| p.operations.clone()).collect();
        assert_eq!(rejoined, original);
        for (i, part) in parts.iter().enumerate() {
            let info = part.multi_part.as_ref().unwrap();
            assert_eq!(info.part_number as usize, i + 1);
            assert_eq!(info.total_parts as usize, parts.len());
            assert!(!part.operations.is_empty());
        }

        // Every op is larger than a tiny budget: one op per part.
        let parts = split(big_patch(3, 1000), 10).unwrap();
        assert_eq!(parts.len(), 4);
    }

    #[test]
    fn test_write_and_merge_equivalence() {
        let dir = tempfile::tempdir().unwrap();
        let patch = big_patch(8, 4096);
        let original = patch.operations.clone();

        let paths =
            write_patch_set(patch, dir.path(), "rel", Some(10_000), Compression::None, 0).unwrap();
        assert!(paths.len() > 1);
        assert!(paths[0].ends_with("rel.01.patch"));

        let merged = load_patch_set(&paths[0]).unwrap();
        assert_eq!(merged.operations, original);
        assert!(merged.multi_part.is_none());
    }

    #[test]
    fn test_small_patch_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let patch = big_patch(2, 10);
        let limit = Some(1 << 20);
        let paths =
            write_patch_set(patch, dir.path(), "tiny", limit, Compression::Zstd, 3).unwrap();
        assert_eq!(paths, vec![dir.path().join("tiny.patch")]);
        let loaded = load_patch_set(&paths[0]).unwrap();
        assert_eq!(loaded.operations.len(), 3);
    }

    #[test]
    fn test_tampered_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let patch = big_patch(8, 4096);
        let paths =
            write_patch_set(patch, dir.path(), "rel", Some(10_000), Compression::Zstd, 3).unwrap();
        assert!(paths.len() > 2);

        let victim = &paths[2];
        let mut bytes = std::fs::read(victim).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(victim, &bytes).unwrap();

        let err = load_patch_set(&paths[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_missing_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let patch = big_patch(8, 4096);
        let paths =
            write_patch_set(patch, dir.path(), "rel", Some(10_000), Compression::None, 0).unwrap();
        std::fs::remove_file(paths.last().unwrap()).unwrap();
        let err = load_patch_set(&paths[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_loading_later_part_directly_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let patch = big_patch(8, 4096);
        let paths =
            write_patch_set(patch, dir.path(), "rel", Some(10_000), Compression::None, 0).unwrap();
        assert!(load_patch_set(&paths[1]).is_err());
    }

    #[test]
    fn test_parts_stay_within_limit_including_hash_list() {
        // Sizes around half a part leave parts underfilled and push the
        // part count, and so part 1's hash list, past a size-based estimate.
        for payload in (3000..=4600).step_by(100) {
            let dir = tempfile::tempdir().unwrap();
            let patch = big_patch(20, payload);
            let original = patch.operations.clone();
            let paths = write_patch_set(patch, dir.path(), "p", Some(10_000), Compression::None, 0)
                .unwrap();
            assert!(paths.len() > 2, "payload {payload}");

            for path in &paths {
                let len = std::fs::metadata(path).unwrap().len();
                assert!(len <= 10_000, "payload {payload}: {} is {len} bytes", path.display());
            }
            assert_eq!(load_patch_set(&paths[0]).unwrap().operations, original);
        }
    }

    #[test]
    fn test_pack_is_greedy_and_contiguous() {
        assert_eq!(pack(&[4, 4, 4, 9, 1, 1], 8), vec![2, 1, 1, 2]);
        assert_eq!(pack(&[20], 8), vec![1]);
    }
}
