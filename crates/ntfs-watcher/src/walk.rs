//! Recursive directory walk: the slow path.
//!
//! Used when MFT enumeration is unavailable (non-Windows, non-NTFS, or a
//! failed enumeration) and, with tight limits, for the subtree rescan the
//! mutator runs after a directory creation. Applies the same skip rules
//! as the native path.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use core_types::{skip, FileRecord};
use tracing::debug;

/// Bounds on a walk. The subtree rescan uses the tight defaults; a full
/// fallback build lifts them.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_entries: usize,
    pub max_depth: usize,
    pub max_duration: Duration,
}

impl ScanLimits {
    /// Limits for the post-creation subtree rescan.
    pub fn bounded_rescan() -> Self {
        Self {
            max_entries: 200_000,
            max_depth: 15,
            max_duration: Duration::from_millis(500),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_entries: usize::MAX,
            max_depth: usize::MAX,
            max_duration: Duration::MAX,
        }
    }
}

pub(crate) fn mtime_of(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Walk a directory tree breadth-limited by `limits`, emitting records
/// with fresh size/mtime metadata.
///
/// The root itself is not emitted. Unreadable directories are skipped
/// silently; the walk is best-effort by design.
pub fn walk_tree(
    root: &str,
    allowed_roots_lower: Option<&[String]>,
    limits: ScanLimits,
) -> Vec<FileRecord> {
    let started = Instant::now();
    let mut records = Vec::new();
    let mut stack: VecDeque<(String, usize)> = VecDeque::new();
    stack.push_back((root.to_string(), 0));

    while let Some((dir, depth)) = stack.pop_back() {
        if records.len() >= limits.max_entries || started.elapsed() > limits.max_duration {
            debug!(root, scanned = records.len(), "walk hit its limits");
            break;
        }
        if depth > limits.max_depth {
            continue;
        }
        if skip::should_skip_path(&dir.to_lowercase(), allowed_roots_lower) {
            continue;
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            if records.len() >= limits.max_entries || started.elapsed() > limits.max_duration {
                break;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.is_empty() || name.starts_with('.') || name.starts_with('$') {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            if meta.is_dir() {
                let rec = FileRecord::new(&name, &dir, true, 0, mtime_of(&meta));
                if skip::should_skip_dir(
                    &rec.name_lower,
                    &rec.full_path.to_lowercase(),
                    allowed_roots_lower,
                ) {
                    continue;
                }
                stack.push_back((rec.full_path.clone(), depth + 1));
                records.push(rec);
            } else {
                let rec = FileRecord::new(&name, &dir, false, meta.len(), mtime_of(&meta));
                if skip::skip_ext(&rec.extension) {
                    continue;
                }
                records.push(rec);
            }
        }
    }

    records
}

/// Full fallback build over a volume root (or an allowlisted root on the
/// system volume).
pub fn walk_volume(root: &str, allowed_roots_lower: Option<&[String]>) -> Vec<FileRecord> {
    if !Path::new(root).is_dir() {
        return Vec::new();
    }
    walk_tree(root, allowed_roots_lower, ScanLimits::unbounded())
}
