//! Binary deltas in the bsdiff family layout, plus large-file helpers.
//!
//! Payload:
//!
//! ```text
//! "BSDIFF4" | ctrl_len: u64 LE | diff_len: u64 LE | new_size: u64 LE
//! zstd(control) | zstd(diff) | zstd(extra)
//! ```
//!
//! The control block is a list of `(add, extra, seek)` triples, each encoded
//! as three sign-magnitude 64-bit integers. Applying a triple adds `add` bytes
//! of the diff block to the old file at the current old position, appends
//! `extra` bytes from the extra block, then moves the old position by `seek`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{IoResultExt, PatchError, Result};
use crate::progress::{self, ProgressObserver};
use crate::rolling_hash::{block_digest, RollingWindow};

pub const DIFF_MAGIC: &[u8; 7] = b"BSDIFF4";
pub const HEADER_LEN: usize = DIFF_MAGIC.len() + 3 * 8;

/// Files above this size are replaced whole instead of diffed in memory.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 1 << 30;
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

const MIN_BLOCK_SIZE: usize = 64;
const MAX_BLOCK_SIZE: usize = 4096;
const BLOCK_COMPRESSION_LEVEL: i32 = 3;
const CONTROL_ENTRY_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    add: u64,
    extra: u64,
    seek: i64,
}

#[derive(Debug, Clone, Copy)]
struct Match {
    old_start: usize,
    new_start: usize,
    len: usize,
}

/// Compute a patch turning `old` into `new`.
pub fn diff(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let matches = find_matches(old, new);

    let mut controls = Vec::with_capacity(matches.len() + 1);
    let mut diff_block = Vec::new();
    let mut extra_block = Vec::new();

    // A zero-length match at the origin carries any unmatched prefix.
    let origin = Match {
        old_start: 0,
        new_start: 0,
        len: 0,
    };
    let segments: Vec<Match> = std::iter::once(origin).chain(matches).collect();

    for (i, m) in segments.iter().enumerate() {
        diff_block.extend(
            new[m.new_start..m.new_start + m.len]
                .iter()
                .zip(&old[m.old_start..m.old_start + m.len])
                .map(|(n, o)| n.wrapping_sub(*o)),
        );

        let new_end = m.new_start + m.len;
        let old_end = m.old_start + m.len;
        let (next_new, next_old) = match segments.get(i + 1) {
            Some(next) => (next.new_start, next.old_start),
            None => (new.len(), old_end),
        };
        extra_block.extend_from_slice(&new[new_end..next_new]);

        controls.push(Control {
            add: m.len as u64,
            extra: (next_new - new_end) as u64,
            seek: next_old as i64 - old_end as i64,
        });
    }

    let mut control_block = Vec::with_capacity(controls.len() * CONTROL_ENTRY_LEN);
    for c in &controls {
        control_block.extend_from_slice(&encode_offset(c.add as i64));
        control_block.extend_from_slice(&encode_offset(c.extra as i64));
        control_block.extend_from_slice(&encode_offset(c.seek));
    }

    let control_z = compress_block(&control_block)?;
    let diff_z = compress_block(&diff_block)?;
    let extra_z = compress_block(&extra_block)?;

    let mut out = Vec::with_capacity(HEADER_LEN + control_z.len() + diff_z.len() + extra_z.len());
    out.extend_from_slice(DIFF_MAGIC);
    out.extend_from_slice(&(control_z.len() as u64).to_le_bytes());
    out.extend_from_slice(&(diff_z.len() as u64).to_le_bytes());
    out.extend_from_slice(&(new.len() as u64).to_le_bytes());
    out.extend_from_slice(&control_z);
    out.extend_from_slice(&diff_z);
    out.extend_from_slice(&extra_z);
    Ok(out)
}

/// Rebuild the new file from `old` and a patch produced by [`diff`].
pub fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() < HEADER_LEN {
        return Err(PatchError::Format(format!(
            "Binary diff truncated: {} bytes, header needs {}",
            patch.len(),
            HEADER_LEN
        )));
    }
    if !is_diff_payload(patch) {
        return Err(PatchError::Format("Binary diff is missing its magic header".into()));
    }

    let read_u64 = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&patch[at..at + 8]);
        u64::from_le_bytes(buf)
    };
    let control_len = read_u64(DIFF_MAGIC.len()) as usize;
    let diff_len = read_u64(DIFF_MAGIC.len() + 8) as usize;
    let new_size = read_u64(DIFF_MAGIC.len() + 16);

    let body = &patch[HEADER_LEN..];
    if control_len.checked_add(diff_len).map_or(true, |n| n > body.len()) {
        return Err(PatchError::Format("Binary diff block lengths exceed payload".into()));
    }
    let control_block = decompress_block(&body[..control_len], "control")?;
    let diff_block = decompress_block(&body[control_len..control_len + diff_len], "diff")?;
    let extra_block = decompress_block(&body[control_len + diff_len..], "extra")?;

    if control_block.len() % CONTROL_ENTRY_LEN != 0 {
        return Err(PatchError::Format("Binary diff control block is misaligned".into()));
    }

    let corrupt = |what: &str| PatchError::Format(format!("Binary diff is corrupt: {what}"));
    // Every output byte comes from the diff or extra block.
    let capacity = new_size.min((diff_block.len() + extra_block.len()) as u64);
    let mut out: Vec<u8> = Vec::with_capacity(capacity as usize);
    let mut old_pos: i64 = 0;
    let mut diff_pos = 0usize;
    let mut extra_pos = 0usize;

    for entry in control_block.chunks_exact(CONTROL_ENTRY_LEN) {
        let add = decode_offset(&entry[0..8]);
        let extra = decode_offset(&entry[8..16]);
        let seek = decode_offset(&entry[16..24]);
        if add < 0 || extra < 0 {
            return Err(corrupt("negative length"));
        }
        let (add, extra) = (add as usize, extra as usize);

        if (out.len() as u64).saturating_add(add as u64).saturating_add(extra as u64) > new_size {
            return Err(corrupt("output overruns declared size"));
        }
        if old_pos < 0
            || (old_pos as usize).saturating_add(add) > old.len()
            || diff_pos.saturating_add(add) > diff_block.len()
        {
            return Err(corrupt("add range out of bounds"));
        }
        let start = old_pos as usize;
        out.extend(
            diff_block[diff_pos..diff_pos + add]
                .iter()
                .zip(&old[start..start + add])
                .map(|(d, o)| d.wrapping_add(*o)),
        );
        diff_pos += add;

        if extra_pos.saturating_add(extra) > extra_block.len() {
            return Err(corrupt("extra range out of bounds"));
        }
        out.extend_from_slice(&extra_block[extra_pos..extra_pos + extra]);
        extra_pos += extra;

        old_pos = old_pos
            .checked_add(add as i64)
            .and_then(|p| p.checked_add(seek))
            .ok_or_else(|| corrupt("seek overflow"))?;
    }

    if out.len() as u64 != new_size {
        return Err(corrupt("output shorter than declared size"));
    }
    Ok(out)
}

/// Whether `data` starts with the binary diff magic.
pub fn is_diff_payload(data: &[u8]) -> bool {
    data.len() >= DIFF_MAGIC.len() && &data[..DIFF_MAGIC.len()] == DIFF_MAGIC
}

/// Whether a file of `size` bytes should bypass in-memory diffing.
pub fn is_large_file(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Stream `src` into `dst` in `chunk_size` pieces, reporting bytes copied so far.
pub fn copy_chunked(
    src: &Path,
    dst: &Path,
    chunk_size: usize,
    progress: Option<&dyn ProgressObserver>,
) -> Result<u64> {
    let mut input = File::open(src).at(src)?;
    let total = input.metadata().at(src)?.len();
    let mut output = BufWriter::new(File::create(dst).at(dst)?);
    let label = dst.display().to_string();

    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;
    loop {
        let n = input.read(&mut buffer).at(src)?;
        if n == 0 {
            break;
        }
        output.write_all(&buffer[..n]).at(dst)?;
        copied += n as u64;
        progress::report(progress, copied, total, &label);
    }
    output.flush().at(dst)?;
    Ok(copied)
}

fn block_size_for(old_len: usize) -> usize {
    (old_len / 16_384).next_power_of_two().clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Find ascending, non-overlapping runs of `new` that also occur in `old`.
fn find_matches(old: &[u8], new: &[u8]) -> Vec<Match> {
    let block = block_size_for(old.len());
    if old.len() < block || new.len() < block {
        return prefix_suffix_matches(old, new);
    }

    // Signatures of the non-overlapping old blocks, keyed by weak digest.
    let mut table: HashMap<u32, Vec<(usize, blake3::Hash)>> =
        HashMap::with_capacity(old.len() / block);
    for offset in (0..=old.len() - block).step_by(block) {
        let bytes = &old[offset..offset + block];
        table
            .entry(block_digest(bytes))
            .or_default()
            .push((offset, blake3::hash(bytes)));
    }

    let mut matches: Vec<Match> = Vec::new();
    let mut window = RollingWindow::new(new, 0, block);
    let mut scan_floor = 0usize;

    loop {
        let new_pos = window.start();
        let expected_old = matches.last().map(|m| m.old_start + m.len);

        let hit = table.get(&window.digest()).and_then(|candidates| {
            let strong = blake3::hash(window.bytes());
            let mut equal = candidates.iter().filter(|(_, h)| *h == strong).map(|(o, _)| *o);
            let first = equal.next()?;
            // Prefer the block that continues the previous match.
            Some(
                std::iter::once(first)
                    .chain(equal)
                    .find(|o| Some(*o) == expected_old)
                    .unwrap_or(first),
            )
        });

        match hit {
            Some(old_offset) => {
                let mut m = Match {
                    old_start: old_offset,
                    new_start: new_pos,
                    len: block,
                };
                while m.old_start + m.len < old.len()
                    && m.new_start + m.len < new.len()
                    && old[m.old_start + m.len] == new[m.new_start + m.len]
                {
                    m.len += 1;
                }
                while m.new_start > scan_floor
                    && m.old_start > 0
                    && old[m.old_start - 1] == new[m.new_start - 1]
                {
                    m.old_start -= 1;
                    m.new_start -= 1;
                    m.len += 1;
                }

                scan_floor = m.new_start + m.len;
                matches.push(m);
                if scan_floor + block > new.len() {
                    break;
                }
                window.jump(scan_floor);
            }
            None => {
                if !window.slide() {
                    break;
                }
            }
        }
    }

    matches
}

fn prefix_suffix_matches(old: &[u8], new: &[u8]) -> Vec<Match> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let mut matches = Vec::new();
    if prefix > 0 {
        matches.push(Match {
            old_start: 0,
            new_start: 0,
            len: prefix,
        });
    }
    if suffix > 0 {
        matches.push(Match {
            old_start: old.len() - suffix,
            new_start: new.len() - suffix,
            len: suffix,
        });
    }
    matches
}

fn encode_offset(value: i64) -> [u8; 8] {
    let mut bytes = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        bytes[7] |= 0x80;
    }
    bytes
}

fn decode_offset(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    let negative = buf[7] & 0x80 != 0;
    buf[7] &= 0x7F;
    let magnitude = u64::from_le_bytes(buf) as i64;
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn compress_block(data: &[u8]) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, BLOCK_COMPRESSION_LEVEL)
        .map_err(|e| PatchError::Format(format!("Failed to compress diff block: {e}")))
}

fn decompress_block(data: &[u8], name: &str) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data)
        .map_err(|e| PatchError::Format(format!("Binary diff {name} block is undecodable: {e}")))
}
