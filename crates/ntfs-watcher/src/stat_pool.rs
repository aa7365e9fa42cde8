//! Batched metadata backfill.
//!
//! MFT enumeration deliberately leaves `size`/`mtime` at zero; this pool
//! fills them after the fact with parallel `stat` calls. Invoked lazily
//! for the first rendered page of time-filtered results and eagerly in
//! the background once indexing completes. Failures leave the zeros in
//! place; slow disks are best-effort.

use std::time::UNIX_EPOCH;

use core_types::FileRecord;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use tracing::debug;

pub const STAT_WORKERS: usize = 16;
pub const STAT_BATCH: usize = 200;

static POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
    rayon::ThreadPoolBuilder::new()
        .num_threads(STAT_WORKERS)
        .thread_name(|i| format!("stat-worker-{i}"))
        .build()
        .expect("stat pool construction cannot fail")
});

/// Stat a set of paths in parallel. Results align with the input; `None`
/// marks paths that could not be statted.
pub fn stat_paths(paths: &[String]) -> Vec<Option<(u64, f64)>> {
    if paths.is_empty() {
        return Vec::new();
    }
    POOL.install(|| {
        paths
            .par_chunks(STAT_BATCH)
            .flat_map_iter(|chunk| {
                chunk.iter().map(|path| {
                    let meta = std::fs::metadata(path).ok()?;
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0);
                    let size = if meta.is_dir() { 0 } else { meta.len() };
                    Some((size, mtime))
                })
            })
            .collect()
    })
}

/// Fill missing `size`/`mtime` in place for records still carrying zeros.
/// Returns how many records were updated.
pub fn fill_metadata(records: &mut [FileRecord]) -> usize {
    let needy: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.mtime == 0.0 || (!r.is_dir && r.size == 0))
        .map(|(i, _)| i)
        .collect();
    if needy.is_empty() {
        return 0;
    }

    let paths: Vec<String> = needy.iter().map(|&i| records[i].full_path.clone()).collect();
    let stats = stat_paths(&paths);

    let mut updated = 0;
    for (&idx, stat) in needy.iter().zip(stats) {
        if let Some((size, mtime)) = stat {
            let rec = &mut records[idx];
            if !rec.is_dir {
                rec.size = size;
            }
            rec.mtime = mtime;
            updated += 1;
        }
    }
    debug!(requested = needy.len(), updated, "metadata backfill pass");
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn backfills_only_zeroed_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        fs::write(&path, vec![0u8; 128]).unwrap();

        let parent = tmp.path().to_string_lossy().into_owned();
        let mut records = vec![
            FileRecord::new("data.bin", &parent, false, 0, 0.0),
            FileRecord::new("gone.bin", &parent, false, 0, 0.0),
        ];

        let updated = fill_metadata(&mut records);
        assert_eq!(updated, 1);
        assert_eq!(records[0].size, 128);
        assert!(records[0].mtime > 0.0);
        // Transient stat failure leaves the zeros; the record survives.
        assert_eq!(records[1].size, 0);
        assert_eq!(records[1].mtime, 0.0);
    }

    #[test]
    fn stat_paths_aligns_with_input() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        fs::write(&a, b"12345").unwrap();
        let results = stat_paths(&[
            a.to_string_lossy().into_owned(),
            "/no/such/path".to_string(),
        ]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].unwrap().0, 5);
        assert!(results[1].is_none());
    }

    #[test]
    fn large_batches_cross_chunk_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..(STAT_BATCH + 3) {
            let p = tmp.path().join(format!("f{i}"));
            fs::write(&p, b"x").unwrap();
            paths.push(p.to_string_lossy().into_owned());
        }
        let results = stat_paths(&paths);
        assert_eq!(results.len(), STAT_BATCH + 3);
        assert!(results.iter().all(|r| r.is_some()));
    }
}
