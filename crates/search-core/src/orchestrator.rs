//! The search pipeline: scope resolution, per-volume seed selection,
//! predicate verification, and streaming batch emission with O(1)
//! cancellation.
//!
//! Results stream in posting-list order, not ranked order; ranking is
//! client-side so cancellation stays safe at any batch boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use core_types::{skip, FileRecord, RecordId};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;
use volume_index::VolumeIndex;

use crate::query::Query;
use crate::{ContentProbe, ResultBatch, SearchSink, MAX_BATCH};

/// Per-drive safety cap when a query degenerates to a full scan.
pub const SCAN_CAP: usize = 100_000;

/// How many zero-mtime candidates a time-filtered search will stat
/// before giving up on the rest.
const BACKFILL_CAP: usize = 10_000;

/// Search scope: a set of drive roots (`D:`) and/or directory targets
/// (`C:\Users\me\Documents`). A directory target restricts its drive to
/// that prefix.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub targets: Vec<String>,
}

impl Scope {
    pub fn drives(drives: impl IntoIterator<Item = char>) -> Self {
        Self {
            targets: drives
                .into_iter()
                .map(|d| format!("{}:", d.to_ascii_uppercase()))
                .collect(),
        }
    }

    /// Resolve to (drive, prefix set); `None` prefixes means the whole
    /// drive. Sorted by drive letter for deterministic fan-out order.
    pub(crate) fn resolve(&self) -> Vec<(char, Option<Vec<String>>)> {
        let mut map: Vec<(char, Option<Vec<String>>)> = Vec::new();
        for raw in &self.targets {
            let t = raw.trim();
            let mut chars = t.chars();
            let (Some(letter), Some(':')) = (chars.next(), chars.next()) else {
                continue;
            };
            if !letter.is_ascii_alphabetic() {
                continue;
            }
            let drive = letter.to_ascii_uppercase();
            let rest = t[2..].trim_matches(['\\', '/']);
            let entry = match map.iter_mut().find(|(d, _)| *d == drive) {
                Some(e) => e,
                None => {
                    map.push((drive, Some(Vec::new())));
                    map.last_mut().unwrap_or_else(|| unreachable!())
                }
            };
            if rest.is_empty() {
                entry.1 = None; // whole drive wins
            } else if let Some(prefixes) = entry.1.as_mut() {
                prefixes.push(t.to_lowercase().trim_end_matches(['\\', '/']).to_string());
            }
        }
        map.sort_by_key(|(d, _)| *d);
        map
    }
}

/// Everything a single search run needs, borrowed from the engine.
pub struct SearchContext<'a> {
    pub volumes: &'a [(char, Arc<RwLock<VolumeIndex>>)],
    pub everything_mode: bool,
    pub system_drive: char,
    /// Lowercased allowlist roots gating the system drive.
    pub allowed_roots_lower: Vec<String>,
    pub content_probe: Option<Arc<dyn ContentProbe>>,
    pub batch_size: usize,
}

impl<'a> SearchContext<'a> {
    fn allow_for(&self, drive: char) -> Option<&[String]> {
        (drive == self.system_drive && !self.allowed_roots_lower.is_empty())
            .then_some(self.allowed_roots_lower.as_slice())
    }
}

/// Execute one search, streaming batches into `sink` until exhaustion or
/// cancellation. Cancellation is silent: the current partial batch is
/// delivered and the stream just stops.
pub fn run_search(
    ctx: &SearchContext<'_>,
    query: &Query,
    scope: &Scope,
    cancel: &AtomicBool,
    sink: &dyn SearchSink,
    search_id: Uuid,
) {
    let started = Instant::now();
    let batch_cap = ctx.batch_size.clamp(1, MAX_BATCH);

    // Empty query matches nothing, NOT-only queries included.
    if !query.has_candidates() {
        sink.on_finished(started.elapsed().as_secs_f64());
        return;
    }

    let resolved = scope.resolve();
    let scoped: Vec<(char, Option<Vec<String>>, Arc<RwLock<VolumeIndex>>)> = resolved
        .into_iter()
        .filter_map(|(drive, prefixes)| {
            match ctx.volumes.iter().find(|(d, _)| *d == drive) {
                Some((_, lock)) => Some((drive, prefixes, lock.clone())),
                None => {
                    warn!(volume = %drive, "scoped volume has no index; skipping");
                    None
                }
            }
        })
        .collect();

    if scoped.is_empty() {
        sink.on_error("engine unavailable: no indexed volume in scope");
        return;
    }

    let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_cap);
    let mut seq: u64 = 0;

    let emit = |records: &mut Vec<FileRecord>, seq: &mut u64| {
        if records.is_empty() {
            return;
        }
        sink.on_batch(ResultBatch {
            search_id,
            seq: *seq,
            records: std::mem::take(records),
        });
        *seq += 1;
        // Let the UI thread breathe between batches.
        std::thread::yield_now();
    };

    for (drive, prefixes, lock) in &scoped {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let seed = {
            let idx = lock.read();
            select_seed(&idx, query, ctx.everything_mode)
        };
        debug!(volume = %drive, candidates = seed.len(), "seed selected");

        if query.filters.mtime_after.is_some() || query.filters.mtime_before.is_some() {
            backfill_zero_mtimes(lock, &seed);
        }

        let idx = lock.read();
        let allow = ctx.allow_for(*drive);
        for id in seed {
            if cancel.load(Ordering::Relaxed) {
                emit(&mut batch, &mut seq);
                return;
            }
            let Some(rec) = idx.fetch(id) else {
                continue; // tombstoned since the seed scan
            };
            if !verify(ctx, query, *drive, id, rec, prefixes.as_deref(), allow) {
                continue;
            }
            batch.push(rec.clone());
            if batch.len() >= batch_cap {
                emit(&mut batch, &mut seq);
            }
        }
    }

    emit(&mut batch, &mut seq);
    if !cancel.load(Ordering::Relaxed) {
        sink.on_finished(started.elapsed().as_secs_f64());
    }
}

/// Pick the cheapest candidate source, in order of preference: keyword
/// n-gram intersection, OR-keyword union, time-range seed, extension
/// seed, then the capped full scan.
fn select_seed(idx: &VolumeIndex, query: &Query, everything_mode: bool) -> Vec<RecordId> {
    if let Some(kw) = query.seed_keyword() {
        return idx.search_contains(kw, SCAN_CAP, everything_mode);
    }

    let or_seedable = !query.keywords_or.is_empty()
        && query.keywords_or.iter().all(|k| !k.contains(['*', '?']));
    if or_seedable {
        let mut ids: Vec<RecordId> = query
            .keywords_or
            .iter()
            .flat_map(|k| idx.search_contains(k, SCAN_CAP, everything_mode))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.truncate(SCAN_CAP);
        return ids;
    }

    if let Some(after) = query.filters.mtime_after {
        let before = query.filters.mtime_before.unwrap_or(f64::MAX);
        // Zero-mtime records are "unknown, pending backfill", not old;
        // they ride along and are resolved before verification.
        let mut ids = idx.search_by_mtime_range(after, before, SCAN_CAP);
        let mut zeros = idx.search_by_mtime_range(0.0, 0.0, SCAN_CAP.saturating_sub(ids.len()));
        ids.append(&mut zeros);
        ids.sort_unstable();
        ids.dedup();
        return ids;
    }

    if !query.filters.ext_any_of.is_empty() {
        let mut ids: Vec<RecordId> = query
            .filters
            .ext_any_of
            .iter()
            .flat_map(|ext| idx.search_by_ext(ext, SCAN_CAP))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.truncate(SCAN_CAP);
        return ids;
    }

    idx.iter_live().map(|(id, _)| id).take(SCAN_CAP).collect()
}

/// Stat zero-mtime candidates (bounded) and write fresh metadata back
/// into the index; the persisted index stays authoritative without any
/// side store.
fn backfill_zero_mtimes(lock: &RwLock<VolumeIndex>, seed: &[RecordId]) {
    let needy: Vec<(RecordId, String)> = {
        let idx = lock.read();
        seed.iter()
            .filter_map(|&id| {
                let rec = idx.fetch(id)?;
                (rec.mtime == 0.0).then(|| (id, rec.full_path.clone()))
            })
            .take(BACKFILL_CAP)
            .collect()
    };
    if needy.is_empty() {
        return;
    }

    let paths: Vec<String> = needy.iter().map(|(_, p)| p.clone()).collect();
    let stats = ntfs_watcher::stat_pool::stat_paths(&paths);

    let mut idx = lock.write();
    let mut updated = 0usize;
    for ((id, _), stat) in needy.into_iter().zip(stats) {
        let Some((size, mtime)) = stat else {
            continue; // transient stat failure: keep the zeros
        };
        if let Some(rec) = idx.fetch(id) {
            let mut fresh = rec.clone();
            if !fresh.is_dir {
                fresh.size = size;
            }
            fresh.mtime = mtime;
            idx.update(id, fresh);
            updated += 1;
        }
    }
    debug!(updated, "mtime backfill written back to index");
}

fn keyword_text(rec: &FileRecord, everything_mode: bool) -> String {
    if everything_mode {
        format!("{}\n{}", rec.name_lower, volume_index::fold_path(&rec.full_path))
    } else {
        rec.name_lower.clone()
    }
}

#[allow(clippy::too_many_arguments)]
fn verify(
    ctx: &SearchContext<'_>,
    query: &Query,
    drive: char,
    id: RecordId,
    rec: &FileRecord,
    prefixes: Option<&[String]>,
    allow: Option<&[String]>,
) -> bool {
    let path_lower = volume_index::fold_path(&rec.full_path);

    // Keyword layer: the compiled predicate is authoritative when
    // present; otherwise the flat lists apply.
    if let Some(pred) = &query.predicate {
        if !pred.matches(&keyword_text(rec, ctx.everything_mode)) {
            return false;
        }
    } else {
        let text = keyword_text(rec, ctx.everything_mode);
        if !query.keywords_and.iter().all(|k| text.contains(k.as_str())) {
            return false;
        }
        if !query.keywords_or.is_empty()
            && !query.keywords_or.iter().any(|k| text.contains(k.as_str()))
        {
            return false;
        }
        if query.keywords_not.iter().any(|k| text.contains(k.as_str())) {
            return false;
        }
    }

    // Structured filters.
    let f = &query.filters;
    if !f.ext_any_of.is_empty() && !f.ext_any_of.iter().any(|e| *e == rec.extension) {
        return false;
    }
    if f.is_dir_only && !rec.is_dir {
        return false;
    }
    if f.is_file_only && rec.is_dir {
        return false;
    }
    if let Some(min) = f.size_min {
        if rec.size <= min {
            return false;
        }
    }
    if let Some(max) = f.size_max {
        if rec.size >= max {
            return false;
        }
    }
    // Zero mtime is "unknown": surfaced rather than silently dropped.
    if let Some(after) = f.mtime_after {
        if rec.mtime != 0.0 && rec.mtime < after {
            return false;
        }
    }
    if let Some(before) = f.mtime_before {
        if rec.mtime != 0.0 && rec.mtime > before {
            return false;
        }
    }
    if let Some(fragment) = &f.path_contains {
        if !path_lower.contains(fragment.as_str()) {
            return false;
        }
    }
    let path_chars = rec.full_path.chars().count();
    if f.path_len_min.is_some_and(|min| path_chars <= min) {
        return false;
    }
    if f.path_len_max.is_some_and(|max| path_chars >= max) {
        return false;
    }

    // Scope prefixes for directory-shaped targets.
    if let Some(prefixes) = prefixes {
        if !prefixes.is_empty() && !skip::is_in_allowed_roots(&path_lower, prefixes) {
            return false;
        }
    }

    // System-drive allowlist gate.
    if let Some(roots) = allow {
        if !skip::is_in_allowed_roots(&path_lower, roots) {
            return false;
        }
    }

    // Universal skip rules, re-applied against stale records.
    if skip::should_skip_path(&path_lower, allow) {
        return false;
    }
    if rec.is_dir {
        if skip::should_skip_dir(&rec.name_lower, &path_lower, allow) {
            return false;
        }
    } else if skip::skip_ext(&rec.extension) {
        return false;
    }

    // Content probe: absent facility matches everything.
    if let Some(phrase) = &query.content_probe {
        if let Some(probe) = &ctx.content_probe {
            if !probe.content_contains(drive, id, phrase) {
                return false;
            }
        }
    }

    true
}
