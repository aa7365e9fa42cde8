//! Binary persistence for a volume index.
//!
//! Single little-endian file per volume:
//!
//! | offset | field                    | size |
//! |--------|--------------------------|------|
//! | 0      | magic `"VIDX"`           | 4    |
//! | 4      | version                  | 4    |
//! | 8      | drive byte + padding     | 8    |
//! | 16     | usn_journal_id           | 8    |
//! | 24     | last_usn (bit pattern)   | 8    |
//! | 32     | built_at (f64)           | 8    |
//! | 40     | record_count             | 8    |
//! | 48     | records block            | var  |
//! | —      | ext_map block            | var  |
//! | —      | ngram_map block          | var  |
//! | —      | mtime_sorted block       | var  |
//! | end-4  | CRC-32 of preceding data | 4    |
//!
//! Records are length-prefixed UTF-8 strings (name, parent dir) followed
//! by fixed-width attributes; the folded name, full path, and extension
//! are derived on load. Posting lists are delta-encoded varints. Any
//! magic/version/CRC failure rejects the whole file; the caller
//! discards it and rebuilds.
//!
//! Tombstones are not persisted: records are renumbered densely on save
//! (the renumbering is monotonic, so posting order is preserved).

use std::path::Path;

use ahash::AHashMap;
use core_types::{FileRecord, RecordId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::VolumeIndex;

const MAGIC: &[u8; 4] = b"VIDX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("not an index file (bad magic)")]
    BadMagic,
    #[error("unsupported index version {0}")]
    Version(u32),
    #[error("index checksum mismatch")]
    Checksum,
    #[error("truncated or corrupt index file")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persist an index. The file is written under a temporary name and
/// atomically renamed; readers never observe a half-written file.
pub fn save_index(index: &VolumeIndex, path: &Path) -> Result<(), PersistError> {
    let bytes = encode(index);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    debug!(volume = %index.drive, bytes = bytes.len(), path = %path.display(), "index persisted");
    Ok(())
}

/// Load a persisted index, verifying magic, version, and CRC before
/// populating anything.
pub fn load_index(path: &Path) -> Result<VolumeIndex, PersistError> {
    let bytes = std::fs::read(path)?;
    match decode(&bytes) {
        Ok(index) => Ok(index),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "rejecting persisted index");
            Err(err)
        }
    }
}

pub(crate) fn encode(index: &VolumeIndex) -> Vec<u8> {
    // Dense renumbering over live records.
    let mut remap: AHashMap<RecordId, RecordId> = AHashMap::new();
    let mut live: Vec<&FileRecord> = Vec::with_capacity(index.live_count());
    for (old_id, rec) in index.iter_live() {
        remap.insert(old_id, live.len() as RecordId);
        live.push(rec);
    }

    let mut out = Vec::with_capacity(HEADER_LEN + live.len() * 96);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(index.drive as u8);
    out.extend_from_slice(&[0u8; 7]);
    out.extend_from_slice(&index.usn_journal_id.to_le_bytes());
    out.extend_from_slice(&(index.last_usn as u64).to_le_bytes());
    out.extend_from_slice(&index.built_at.to_le_bytes());
    out.extend_from_slice(&(live.len() as u64).to_le_bytes());

    for rec in &live {
        write_str(&mut out, &rec.name);
        write_str(&mut out, &rec.parent_dir);
        out.extend_from_slice(&rec.size.to_le_bytes());
        out.extend_from_slice(&rec.mtime.to_le_bytes());
        out.push(u8::from(rec.is_dir));
    }

    write_posting_map(&mut out, &index.ext_map, &remap);
    write_posting_map(&mut out, &index.ngram_map, &remap);

    let live_mtimes: Vec<(f64, RecordId)> = index
        .mtime_sorted
        .iter()
        .filter_map(|&(m, id)| remap.get(&id).map(|&new| (m, new)))
        .collect();
    out.extend_from_slice(&(live_mtimes.len() as u64).to_le_bytes());
    for (m, id) in live_mtimes {
        out.extend_from_slice(&m.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

pub(crate) fn decode(bytes: &[u8]) -> Result<VolumeIndex, PersistError> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(PersistError::Truncated);
    }
    if &bytes[0..4] != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default());
    if version != VERSION {
        return Err(PersistError::Version(version));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap_or_default());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(PersistError::Checksum);
    }

    let mut r = Reader { buf: body, at: 8 };
    let drive = r.u8()? as char;
    r.skip(7)?;
    let usn_journal_id = r.u64()?;
    let last_usn = r.u64()? as i64;
    let built_at = r.f64()?;
    let record_count = r.u64()? as usize;

    let mut index = VolumeIndex::new(drive);
    index.usn_journal_id = usn_journal_id;
    index.last_usn = last_usn;
    index.built_at = built_at;

    index.records.reserve(record_count);
    for id in 0..record_count {
        let name = r.string()?;
        let parent_dir = r.string()?;
        let size = r.u64()?;
        let mtime = r.f64()?;
        let is_dir = r.u8()? != 0;
        let record = FileRecord::new(&name, &parent_dir, is_dir, size, mtime);
        // path_to_id is not stored; it is total over records by
        // construction.
        index
            .path_to_id
            .insert(crate::fold_path(&record.full_path), id as RecordId);
        index.records.push(Some(record));
    }

    index.ext_map = read_posting_map(&mut r, record_count)?;
    index.ngram_map = read_posting_map(&mut r, record_count)?;

    let mtime_count = r.u64()? as usize;
    index.mtime_sorted.reserve(mtime_count);
    for _ in 0..mtime_count {
        let m = r.f64()?;
        let id = r.u32()?;
        if id as usize >= record_count {
            return Err(PersistError::Truncated);
        }
        index.mtime_sorted.push((m, id));
    }

    if r.at != body.len() {
        return Err(PersistError::Truncated);
    }
    Ok(index)
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn write_posting_list(out: &mut Vec<u8>, ids: &[RecordId], remap: &AHashMap<RecordId, RecordId>) {
    let mapped: Vec<RecordId> = ids.iter().filter_map(|id| remap.get(id).copied()).collect();
    write_varint(out, mapped.len() as u64);
    let mut prev = 0u64;
    for (i, id) in mapped.iter().enumerate() {
        let v = u64::from(*id);
        if i == 0 {
            write_varint(out, v);
        } else {
            write_varint(out, v - prev);
        }
        prev = v;
    }
}

fn write_posting_map(
    out: &mut Vec<u8>,
    map: &AHashMap<String, Vec<RecordId>>,
    remap: &AHashMap<RecordId, RecordId>,
) {
    // Sorted keys keep the encoding deterministic.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.extend_from_slice(&(keys.len() as u64).to_le_bytes());
    for key in keys {
        write_str(out, key);
        write_posting_list(out, &map[key], remap);
    }
}

fn read_posting_map(
    r: &mut Reader<'_>,
    record_count: usize,
) -> Result<AHashMap<String, Vec<RecordId>>, PersistError> {
    let entries = r.u64()? as usize;
    let mut map = AHashMap::with_capacity(entries);
    for _ in 0..entries {
        let key = r.string()?;
        let len = r.varint()? as usize;
        let mut ids = Vec::with_capacity(len);
        let mut acc = 0u64;
        for i in 0..len {
            let delta = r.varint()?;
            acc = if i == 0 { delta } else { acc + delta };
            if acc as usize >= record_count {
                return Err(PersistError::Truncated);
            }
            ids.push(acc as RecordId);
        }
        map.insert(key, ids);
    }
    Ok(map)
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PersistError> {
        if self.at + n > self.buf.len() {
            return Err(PersistError::Truncated);
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), PersistError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, PersistError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PersistError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap_or_default()))
    }

    fn u64(&mut self) -> Result<u64, PersistError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap_or_default()))
    }

    fn f64(&mut self) -> Result<f64, PersistError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap_or_default()))
    }

    fn varint(&mut self) -> Result<u64, PersistError> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            v |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(PersistError::Truncated);
            }
        }
    }

    fn string(&mut self) -> Result<String, PersistError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PersistError::Truncated)
    }
}
