//! Per-volume in-memory index: the dense records array plus the posting
//! structures that answer substring, prefix, extension, and time-range
//! queries.
//!
//! Records are referenced by their 32-bit slot index (`RecordId`).
//! Removal tombstones the slot: ids held by a concurrent reader stay
//! valid and `fetch` simply returns `None` for them, while the posting
//! lists are pruned eagerly so every surviving posting entry refers to a
//! live record. Callers serialize mutations behind a per-volume
//! reader-writer lock; the index itself is a plain data structure.

use ahash::AHashMap;
use core_types::{FileRecord, RecordId, Usn};
use tracing::debug;

pub mod mutator;
pub mod ngram;
pub mod persist;

pub use mutator::{apply_events, MutationOutcome};
pub use persist::{load_index, save_index, PersistError};

/// Point-in-time summary of one volume's index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub drive: char,
    pub records: usize,
    pub built_at: f64,
    pub build_duration: f64,
    pub usn_journal_id: u64,
    pub last_usn: Usn,
}

#[derive(Debug, Default)]
pub struct VolumeIndex {
    pub(crate) drive: char,
    pub usn_journal_id: u64,
    pub last_usn: Usn,
    pub built_at: f64,
    pub build_duration: f64,
    pub(crate) records: Vec<Option<FileRecord>>,
    pub(crate) dead: usize,
    pub(crate) ext_map: AHashMap<String, Vec<RecordId>>,
    pub(crate) ngram_map: AHashMap<String, Vec<RecordId>>,
    pub(crate) mtime_sorted: Vec<(f64, RecordId)>,
    pub(crate) path_to_id: AHashMap<String, RecordId>,
}

impl VolumeIndex {
    pub fn new(drive: char) -> Self {
        Self {
            drive: drive.to_ascii_uppercase(),
            ..Self::default()
        }
    }

    /// Cold-build an index from a reconstructed record set.
    pub fn from_records(drive: char, records: Vec<FileRecord>) -> Self {
        let mut index = Self::new(drive);
        index.records.reserve(records.len());
        for record in records {
            index.insert(record);
        }
        debug!(volume = %index.drive, records = index.live_count(), "index built");
        index
    }

    pub fn drive(&self) -> char {
        self.drive
    }

    /// Total slots, tombstones included. Valid `RecordId`s are `0..len`.
    pub fn slot_count(&self) -> usize {
        self.records.len()
    }

    pub fn live_count(&self) -> usize {
        self.records.len() - self.dead
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            drive: self.drive,
            records: self.live_count(),
            built_at: self.built_at,
            build_duration: self.build_duration,
            usn_journal_id: self.usn_journal_id,
            last_usn: self.last_usn,
        }
    }

    /// Insert a record, or update in place when the path is already
    /// indexed (`full_path` is the uniqueness key).
    pub fn insert(&mut self, record: FileRecord) -> RecordId {
        let key = fold_path(&record.full_path);
        if let Some(&id) = self.path_to_id.get(&key) {
            self.update(id, record);
            return id;
        }
        let id = self.records.len() as RecordId;
        self.add_postings(id, &record);
        self.path_to_id.insert(key, id);
        self.records.push(Some(record));
        id
    }

    /// Replace the record in slot `id`, fixing up every posting.
    pub fn update(&mut self, id: RecordId, record: FileRecord) {
        let Some(old) = self.records.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        self.path_to_id.remove(&fold_path(&old.full_path));
        self.strip_postings(id, &old);
        self.add_postings(id, &record);
        self.path_to_id.insert(fold_path(&record.full_path), id);
        self.records[id as usize] = Some(record);
    }

    /// Remove the record at `full_path` and, when it is a directory,
    /// every descendant under `full_path` + separator. Returns how many
    /// records were removed.
    pub fn remove(&mut self, full_path: &str) -> usize {
        let key = fold_path(full_path);
        let mut doomed: Vec<RecordId> = Vec::new();
        if let Some(&id) = self.path_to_id.get(&key) {
            doomed.push(id);
        }
        // Descendant cascade; match either separator so records produced
        // by the walk fallback and the native path both cascade.
        let prefixes = [format!("{key}\\"), format!("{key}/")];
        for (path, &id) in &self.path_to_id {
            if prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                doomed.push(id);
            }
        }
        for &id in &doomed {
            self.remove_id(id);
        }
        doomed.len()
    }

    fn remove_id(&mut self, id: RecordId) {
        let Some(record) = self.records.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        self.path_to_id.remove(&fold_path(&record.full_path));
        self.strip_postings(id, &record);
        self.dead += 1;
    }

    pub fn fetch(&self, id: RecordId) -> Option<&FileRecord> {
        self.records.get(id as usize).and_then(Option::as_ref)
    }

    pub fn contains_path(&self, full_path: &str) -> bool {
        self.path_to_id.contains_key(&fold_path(full_path))
    }

    pub fn id_of(&self, full_path: &str) -> Option<RecordId> {
        self.path_to_id.get(&fold_path(full_path)).copied()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (RecordId, &FileRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|rec| (i as RecordId, rec)))
    }

    /// Candidates whose folded name (or, with `match_paths`, full path)
    /// contains `pattern`. Results arrive in ascending id order.
    ///
    /// Grams cover names only. A path hit therefore rides on an ancestor
    /// directory whose name matched: matching directories expand to
    /// their whole subtree before verification.
    pub fn search_contains(
        &self,
        pattern: &str,
        limit: usize,
        match_paths: bool,
    ) -> Vec<RecordId> {
        let p = pattern.to_lowercase();
        if p.is_empty() || limit == 0 {
            return Vec::new();
        }
        let verify = |rec: &FileRecord| {
            rec.name_lower.contains(&p) || (match_paths && fold_path(&rec.full_path).contains(&p))
        };
        match ngram::query_grams(&p) {
            Some(grams) => {
                let mut candidates = self.intersect_grams(&grams);
                if match_paths {
                    self.expand_dir_subtrees(&p, &mut candidates);
                }
                self.verify_candidates(candidates, limit, verify)
            }
            // Too short to seed from the gram index: scan.
            None => self.scan_verify(limit, verify),
        }
    }

    /// Grow a candidate set with every record under a candidate
    /// directory whose name contains `pattern`. A pattern spanning a
    /// separator cannot be seeded this way; it only matches through
    /// name-seeded candidates.
    fn expand_dir_subtrees(&self, pattern: &str, candidates: &mut Vec<RecordId>) {
        let prefixes: Vec<String> = candidates
            .iter()
            .filter_map(|&id| self.fetch(id))
            .filter(|rec| rec.is_dir && rec.name_lower.contains(pattern))
            .flat_map(|rec| {
                let base = fold_path(&rec.full_path);
                [format!("{base}\\"), format!("{base}/")]
            })
            .collect();
        if prefixes.is_empty() {
            return;
        }
        for (path, &id) in &self.path_to_id {
            if prefixes.iter().any(|pre| path.starts_with(pre.as_str())) {
                candidates.push(id);
            }
        }
        candidates.sort_unstable();
        candidates.dedup();
    }

    /// Candidates whose folded name starts with `prefix`.
    pub fn search_prefix(&self, prefix: &str, limit: usize) -> Vec<RecordId> {
        let p = prefix.to_lowercase();
        if p.is_empty() || limit == 0 {
            return Vec::new();
        }
        let verify = |rec: &FileRecord| rec.name_lower.starts_with(&p);
        match ngram::query_grams(&p) {
            Some(grams) => self.verify_candidates(self.intersect_grams(&grams), limit, verify),
            None => self.scan_verify(limit, verify),
        }
    }

    /// Exact-extension posting list (normalized to a lowercase dotted
    /// form), truncated to `limit`.
    pub fn search_by_ext(&self, ext: &str, limit: usize) -> Vec<RecordId> {
        let key = normalize_ext(ext);
        match self.ext_map.get(&key) {
            Some(ids) => ids.iter().copied().take(limit).collect(),
            None => Vec::new(),
        }
    }

    /// Records with `min <= mtime <= max`, inclusive on both ends.
    pub fn search_by_mtime_range(&self, min: f64, max: f64, limit: usize) -> Vec<RecordId> {
        let start = self
            .mtime_sorted
            .partition_point(|(m, _)| m.total_cmp(&min) == std::cmp::Ordering::Less);
        let mut out = Vec::new();
        for &(m, id) in &self.mtime_sorted[start..] {
            if m.total_cmp(&max) == std::cmp::Ordering::Greater {
                break;
            }
            out.push(id);
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    fn intersect_grams(&self, grams: &[String]) -> Vec<RecordId> {
        let mut lists: Vec<&Vec<RecordId>> = Vec::with_capacity(grams.len());
        for gram in grams {
            match self.ngram_map.get(gram) {
                Some(list) => lists.push(list),
                // A gram absent from the map means no record can contain
                // the pattern at all.
                None => return Vec::new(),
            }
        }
        lists.sort_by_key(|l| l.len());
        let (first, rest) = match lists.split_first() {
            Some(split) => split,
            None => return Vec::new(),
        };
        first
            .iter()
            .copied()
            .filter(|id| rest.iter().all(|l| l.binary_search(id).is_ok()))
            .collect()
    }

    fn verify_candidates<F>(&self, candidates: Vec<RecordId>, limit: usize, verify: F) -> Vec<RecordId>
    where
        F: Fn(&FileRecord) -> bool,
    {
        let mut out = Vec::new();
        for id in candidates {
            if let Some(rec) = self.fetch(id) {
                if verify(rec) {
                    out.push(id);
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }
        out
    }

    fn scan_verify<F>(&self, limit: usize, verify: F) -> Vec<RecordId>
    where
        F: Fn(&FileRecord) -> bool,
    {
        let mut out = Vec::new();
        for (id, rec) in self.iter_live() {
            if verify(rec) {
                out.push(id);
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    fn add_postings(&mut self, id: RecordId, record: &FileRecord) {
        if !record.extension.is_empty() {
            insert_sorted(self.ext_map.entry(record.extension.clone()).or_default(), id);
        }
        for gram in ngram::grams_of(&record.name_lower) {
            insert_sorted(self.ngram_map.entry(gram).or_default(), id);
        }
        let at = self.mtime_sorted.partition_point(|&(m, i)| {
            m.total_cmp(&record.mtime) == std::cmp::Ordering::Less
                || (m.total_cmp(&record.mtime) == std::cmp::Ordering::Equal && i < id)
        });
        self.mtime_sorted.insert(at, (record.mtime, id));
    }

    fn strip_postings(&mut self, id: RecordId, record: &FileRecord) {
        if !record.extension.is_empty() {
            if let Some(list) = self.ext_map.get_mut(&record.extension) {
                remove_sorted(list, id);
                if list.is_empty() {
                    self.ext_map.remove(&record.extension);
                }
            }
        }
        for gram in ngram::grams_of(&record.name_lower) {
            if let Some(list) = self.ngram_map.get_mut(&gram) {
                remove_sorted(list, id);
                if list.is_empty() {
                    self.ngram_map.remove(&gram);
                }
            }
        }
        if let Some(at) = self.mtime_slot(record.mtime, id) {
            self.mtime_sorted.remove(at);
        }
    }

    fn mtime_slot(&self, mtime: f64, id: RecordId) -> Option<usize> {
        let start = self
            .mtime_sorted
            .partition_point(|(m, _)| m.total_cmp(&mtime) == std::cmp::Ordering::Less);
        self.mtime_sorted[start..]
            .iter()
            .take_while(|(m, _)| m.total_cmp(&mtime) == std::cmp::Ordering::Equal)
            .position(|&(_, i)| i == id)
            .map(|off| start + off)
    }
}

/// Case fold used for the path map and path matching; NTFS names are
/// case-preserving but case-insensitive.
pub fn fold_path(path: &str) -> String {
    path.to_lowercase()
}

/// Lowercase an extension and guarantee the leading dot.
pub fn normalize_ext(ext: &str) -> String {
    let lower = ext.to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

fn insert_sorted(list: &mut Vec<RecordId>, id: RecordId) {
    if let Err(at) = list.binary_search(&id) {
        list.insert(at, id);
    }
}

fn remove_sorted(list: &mut Vec<RecordId>, id: RecordId) {
    if let Ok(at) = list.binary_search(&id) {
        list.remove(at);
    }
}

/// Seconds since the Unix epoch, as the index stores timestamps.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
