//! Applies change-monitor events to an open index.
//!
//! A batch applies under one writer-lock hold (the caller owns the lock;
//! this module just needs `&mut VolumeIndex`), so readers observe either
//! the pre-batch or post-batch state, never an interleaving. After a
//! batch the index matches the filesystem to within one batch of
//! latency.

use core_types::{basename, parent_of, skip, ChangeEvent, ChangeKind, FileRecord};
use ntfs_watcher::walk::{walk_tree, ScanLimits};
use tracing::debug;

use crate::VolumeIndex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub inserted: usize,
    pub removed: usize,
    pub updated: usize,
}

/// Apply one ordered event batch.
///
/// `allowed_roots_lower` gates events on the system volume: anything
/// outside the allowlist is discarded before dispatch.
pub fn apply_events(
    index: &mut VolumeIndex,
    events: &[ChangeEvent],
    allowed_roots_lower: Option<&[String]>,
) -> MutationOutcome {
    let mut outcome = MutationOutcome::default();

    for event in events {
        let path_lower = event.path.to_lowercase();
        if let Some(roots) = allowed_roots_lower {
            if !skip::is_in_allowed_roots(&path_lower, roots) {
                continue;
            }
        }

        match event.kind {
            ChangeKind::Deleted => {
                outcome.removed += index.remove(&event.path);
            }
            ChangeKind::Created | ChangeKind::Renamed => {
                apply_upsert(index, &event.path, allowed_roots_lower, &mut outcome);
            }
            ChangeKind::Modified => {
                if index.contains_path(&event.path) {
                    refresh_metadata(index, &event.path, &mut outcome);
                } else {
                    // A modification for an unindexed path is a creation
                    // we missed.
                    apply_upsert(index, &event.path, allowed_roots_lower, &mut outcome);
                }
            }
        }
        if event.usn > index.last_usn {
            index.last_usn = event.usn;
        }
    }

    debug!(
        volume = %index.drive(),
        inserted = outcome.inserted,
        removed = outcome.removed,
        updated = outcome.updated,
        "event batch applied"
    );
    outcome
}

fn record_from_disk(path: &str) -> Option<FileRecord> {
    let meta = std::fs::metadata(path).ok()?;
    let name = basename(path);
    let parent = parent_of(path);
    if name.is_empty() {
        return None;
    }
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Some(FileRecord::new(
        name,
        parent,
        meta.is_dir(),
        meta.len(),
        mtime,
    ))
}

fn apply_upsert(
    index: &mut VolumeIndex,
    path: &str,
    allowed_roots_lower: Option<&[String]>,
    outcome: &mut MutationOutcome,
) {
    // The path must still exist; create-then-delete within one batch
    // resolves to nothing.
    let Some(record) = record_from_disk(path) else {
        return;
    };
    let path_lower = record.full_path.to_lowercase();

    if record.is_dir {
        if skip::should_skip_dir(&record.name_lower, &path_lower, allowed_roots_lower) {
            return;
        }
        let existed = index.contains_path(path);
        index.insert(record);
        if existed {
            outcome.updated += 1;
        } else {
            outcome.inserted += 1;
        }
        // Bounded rescan picks up descendants that existed before we saw
        // the event (e.g. a moved-in tree). Whatever the limits cut off
        // is captured by later events or a rebuild.
        for descendant in walk_tree(path, allowed_roots_lower, ScanLimits::bounded_rescan()) {
            if !index.contains_path(&descendant.full_path) {
                index.insert(descendant);
                outcome.inserted += 1;
            }
        }
    } else {
        if skip::should_skip_path(&path_lower, allowed_roots_lower)
            || skip::skip_ext(&record.extension)
        {
            return;
        }
        let existed = index.contains_path(path);
        index.insert(record);
        if existed {
            outcome.updated += 1;
        } else {
            outcome.inserted += 1;
        }
    }
}

fn refresh_metadata(index: &mut VolumeIndex, path: &str, outcome: &mut MutationOutcome) {
    let Some(id) = index.id_of(path) else {
        return;
    };
    let Some(fresh) = record_from_disk(path) else {
        // Raced with a deletion; the Deleted event will follow.
        return;
    };
    index.update(id, fresh);
    outcome.updated += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn ev(kind: ChangeKind, path: &Path, is_dir: bool, usn: i64) -> ChangeEvent {
        ChangeEvent {
            kind,
            path: path.to_string_lossy().into_owned(),
            is_dir,
            usn,
        }
    }

    #[test]
    fn created_file_is_statted_and_inserted() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("fresh.txt");
        fs::write(&file, b"hello").unwrap();

        let mut idx = VolumeIndex::new('D');
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Created, &file, false, 10)], None);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(idx.last_usn, 10);

        let id = idx.id_of(&file.to_string_lossy()).unwrap();
        let rec = idx.fetch(id).unwrap();
        assert_eq!(rec.size, 5);
        assert!(rec.mtime > 0.0);
    }

    #[test]
    fn created_event_for_vanished_path_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let ghost = tmp.path().join("ghost.txt");
        let mut idx = VolumeIndex::new('D');
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Created, &ghost, false, 1)], None);
        assert_eq!(outcome, MutationOutcome::default());
    }

    #[test]
    fn deletion_cascades_through_the_index() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("proj");
        fs::create_dir(&sub).unwrap();
        let a = sub.join("a.txt");
        let b = sub.join("b.txt");
        fs::write(&a, b"1").unwrap();
        fs::write(&b, b"2").unwrap();

        let mut idx = VolumeIndex::new('D');
        apply_events(
            &mut idx,
            &[
                ev(ChangeKind::Created, &sub, true, 1),
                ev(ChangeKind::Created, &a, false, 2),
                ev(ChangeKind::Created, &b, false, 3),
            ],
            None,
        );
        assert_eq!(idx.live_count(), 3);

        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Deleted, &sub, true, 4)], None);
        assert_eq!(outcome.removed, 3);
        assert!(idx.is_empty());
    }

    #[test]
    fn rename_is_delete_then_create() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("a.txt");
        let new = tmp.path().join("b.txt");
        fs::write(&new, b"x").unwrap();

        let mut idx = VolumeIndex::new('D');
        idx.insert(FileRecord::new(
            "a.txt",
            &tmp.path().to_string_lossy(),
            false,
            1,
            1.0,
        ));

        apply_events(
            &mut idx,
            &[
                ev(ChangeKind::Deleted, &old, false, 5),
                ev(ChangeKind::Created, &new, false, 6),
            ],
            None,
        );
        assert!(!idx.contains_path(&old.to_string_lossy()));
        assert!(idx.contains_path(&new.to_string_lossy()));
        assert_eq!(idx.last_usn, 6);
    }

    #[test]
    fn directory_creation_rescans_descendants() {
        let tmp = tempfile::tempdir().unwrap();
        let moved = tmp.path().join("moved-in");
        fs::create_dir_all(moved.join("nested")).unwrap();
        fs::write(moved.join("nested").join("deep.txt"), b"d").unwrap();
        fs::write(moved.join("top.txt"), b"t").unwrap();

        let mut idx = VolumeIndex::new('D');
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Created, &moved, true, 9)], None);
        // moved-in + nested + top.txt + deep.txt
        assert_eq!(outcome.inserted, 4);
        assert_eq!(idx.search_contains("deep.txt", 10, false).len(), 1);
    }

    #[test]
    fn modified_updates_metadata_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("grow.txt");
        fs::write(&file, b"12").unwrap();

        let mut idx = VolumeIndex::new('D');
        apply_events(&mut idx, &[ev(ChangeKind::Created, &file, false, 1)], None);
        let id = idx.id_of(&file.to_string_lossy()).unwrap();
        assert_eq!(idx.fetch(id).unwrap().size, 2);

        fs::write(&file, b"1234567").unwrap();
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Modified, &file, false, 2)], None);
        assert_eq!(outcome.updated, 1);
        assert_eq!(idx.fetch(id).unwrap().size, 7);
        assert_eq!(idx.live_count(), 1);
    }

    #[test]
    fn modified_for_unknown_path_becomes_created() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("surprise.txt");
        fs::write(&file, b"x").unwrap();

        let mut idx = VolumeIndex::new('D');
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Modified, &file, false, 1)], None);
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn allowlist_gates_events_before_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        let inside_root = tmp.path().join("allowed");
        fs::create_dir(&inside_root).unwrap();
        let inside = inside_root.join("in.txt");
        let outside = tmp.path().join("out.txt");
        fs::write(&inside, b"1").unwrap();
        fs::write(&outside, b"2").unwrap();

        let roots = vec![inside_root.to_string_lossy().to_lowercase()];
        let mut idx = VolumeIndex::new('C');
        let outcome = apply_events(
            &mut idx,
            &[
                ev(ChangeKind::Created, &inside, false, 1),
                ev(ChangeKind::Created, &outside, false, 2),
            ],
            Some(&roots),
        );
        assert_eq!(outcome.inserted, 1);
        assert!(idx.contains_path(&inside.to_string_lossy()));
        assert!(!idx.contains_path(&outside.to_string_lossy()));
    }

    #[test]
    fn skipped_extensions_never_enter() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("junk.tmp");
        fs::write(&file, b"x").unwrap();
        let mut idx = VolumeIndex::new('D');
        let outcome = apply_events(&mut idx, &[ev(ChangeKind::Created, &file, false, 1)], None);
        assert_eq!(outcome.inserted, 0);
    }
}
