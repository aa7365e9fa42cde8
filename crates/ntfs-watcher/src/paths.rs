//! Path reconstruction: turn the flat MFT record stream into full paths.
//!
//! Two passes. First a BFS over directories from the volume root
//! (FRN 5) resolves every reachable directory path, pruning skipped
//! subtrees as it goes. Then the file pass composes each file's path from
//! its parent's cached path; files whose parent was pruned or never seen
//! are dropped.
//!
//! On the system volume the skip set inverts into an allowlist: only
//! records under an allowlisted root are retained, though the BFS still
//! walks the ancestors of each root to reach them.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use core_types::{join_path, skip, FileRecord, SEP};
use tracing::debug;

use crate::{RawMftRecord, ROOT_FRN};

/// Output of reconstruction: the records plus the directory-path map the
/// journal tailer needs to resolve change events.
#[derive(Debug, Default)]
pub struct ReconstructedVolume {
    pub records: Vec<FileRecord>,
    /// FRN → absolute directory path, for every traversed directory
    /// (including allowlist ancestors that produced no record).
    pub dir_paths: AHashMap<u64, String>,
}

/// True when the directory may be traversed: either it survives the skip
/// rules, or (system volume) it is an ancestor of an allowlisted root.
fn traversable(name_lower: &str, path_lower: &str, allowed: Option<&[String]>) -> bool {
    match allowed {
        None => {
            !skip::should_skip_dir(name_lower, path_lower, None)
                && !skip::should_skip_path(path_lower, None)
        }
        Some(roots) => {
            if skip::is_in_allowed_roots(path_lower, roots) {
                return true;
            }
            // Ancestor of a root: keep walking toward it.
            let with_sep = format!("{path_lower}{SEP}");
            roots.iter().any(|r| r.starts_with(&with_sep))
        }
    }
}

/// True when a resolved record may be emitted.
fn emittable(path_lower: &str, allowed: Option<&[String]>) -> bool {
    match allowed {
        None => true,
        Some(roots) => skip::is_in_allowed_roots(path_lower, roots),
    }
}

/// Reconstruct full paths for one volume's raw record stream.
///
/// `allowed_roots_lower` carries the system-volume allowlist (lowercased,
/// no trailing separators); `None` means the ordinary deny rules apply.
pub fn reconstruct(
    drive: char,
    raw: Vec<RawMftRecord>,
    allowed_roots_lower: Option<&[String]>,
) -> ReconstructedVolume {
    let root_path = format!("{}:{}", drive.to_ascii_uppercase(), SEP);

    let mut dirs: AHashMap<u64, (String, u64)> = AHashMap::new();
    let mut children: AHashMap<u64, Vec<u64>> = AHashMap::new();
    let mut files: Vec<RawMftRecord> = Vec::new();

    for rec in raw {
        if rec.is_dir() {
            children.entry(rec.parent_frn).or_default().push(rec.frn);
            dirs.insert(rec.frn, (rec.name, rec.parent_frn));
        } else {
            files.push(rec);
        }
    }

    let mut out = ReconstructedVolume::default();
    out.dir_paths.insert(ROOT_FRN, root_path.clone());

    // NTFS guarantees a single parent per FRN, but journal content can be
    // pathological; the visited set keeps the BFS finite regardless.
    let mut visited: AHashSet<u64> = AHashSet::new();
    visited.insert(ROOT_FRN);

    let mut queue: VecDeque<u64> = VecDeque::new();
    queue.push_back(ROOT_FRN);

    while let Some(parent_frn) = queue.pop_front() {
        let parent_path = match out.dir_paths.get(&parent_frn) {
            Some(p) => p.clone(),
            None => continue,
        };
        let Some(kids) = children.get(&parent_frn) else {
            continue;
        };
        for &child_frn in kids {
            if !visited.insert(child_frn) {
                continue;
            }
            let Some((name, _)) = dirs.get(&child_frn) else {
                continue;
            };
            let path = join_path(&parent_path, name);
            let path_lower = path.to_lowercase();
            let name_lower = name.to_lowercase();

            if !traversable(&name_lower, &path_lower, allowed_roots_lower) {
                continue; // prunes the whole subtree
            }

            if emittable(&path_lower, allowed_roots_lower) {
                out.records
                    .push(FileRecord::new(name, &parent_path, true, 0, 0.0));
            }
            out.dir_paths.insert(child_frn, path);
            queue.push_back(child_frn);
        }
    }

    let mut dropped = 0usize;
    for file in files {
        let Some(parent_path) = out.dir_paths.get(&file.parent_frn) else {
            dropped += 1;
            continue; // parent skipped or unreachable
        };
        let record = FileRecord::new(&file.name, parent_path, false, 0, 0.0);
        if skip::skip_ext(&record.extension) {
            continue;
        }
        let path_lower = record.full_path.to_lowercase();
        if !emittable(&path_lower, allowed_roots_lower)
            || skip::should_skip_path(&path_lower, allowed_roots_lower)
        {
            continue;
        }
        out.records.push(record);
    }

    debug!(
        volume = %drive,
        records = out.records.len(),
        dirs = out.dir_paths.len(),
        dropped,
        "path reconstruction complete"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::FileAttributes;

    fn dir(frn: u64, parent: u64, name: &str) -> RawMftRecord {
        RawMftRecord {
            frn,
            parent_frn: parent,
            name: name.into(),
            attributes: FileAttributes::DIRECTORY,
        }
    }

    fn file(frn: u64, parent: u64, name: &str) -> RawMftRecord {
        RawMftRecord {
            frn,
            parent_frn: parent,
            name: name.into(),
            attributes: FileAttributes::ARCHIVE,
        }
    }

    fn paths_of(v: &ReconstructedVolume) -> Vec<String> {
        v.records.iter().map(|r| r.full_path.clone()).collect()
    }

    #[test]
    fn composes_paths_from_parent_links() {
        let raw = vec![
            dir(10, ROOT_FRN, "work"),
            dir(11, 10, "project"),
            file(20, 11, "notes.txt"),
            file(21, ROOT_FRN, "top.md"),
        ];
        let v = reconstruct('D', raw, None);
        let paths = paths_of(&v);
        assert!(paths.contains(&format!("D:{SEP}work")));
        assert!(paths.contains(&format!("D:{SEP}work{SEP}project")));
        assert!(paths.contains(&format!("D:{SEP}work{SEP}project{SEP}notes.txt")));
        assert!(paths.contains(&format!("D:{SEP}top.md")));

        // Every record satisfies full_path == join(parent_dir, name).
        for rec in &v.records {
            assert_eq!(rec.full_path, join_path(&rec.parent_dir, &rec.name));
        }
    }

    #[test]
    fn skipped_directory_prunes_subtree() {
        let raw = vec![
            dir(10, ROOT_FRN, "node_modules"),
            dir(11, 10, "left-pad"),
            file(20, 11, "index.js"),
            file(21, ROOT_FRN, "app.js"),
        ];
        let v = reconstruct('D', raw, None);
        let paths = paths_of(&v);
        assert_eq!(paths, vec![format!("D:{SEP}app.js")]);
    }

    #[test]
    fn orphan_files_are_dropped() {
        let raw = vec![file(20, 999, "lost.txt"), file(21, ROOT_FRN, "found.txt")];
        let v = reconstruct('D', raw, None);
        assert_eq!(paths_of(&v), vec![format!("D:{SEP}found.txt")]);
    }

    #[test]
    fn denied_extensions_never_emit() {
        let raw = vec![file(20, ROOT_FRN, "driver.sys"), file(21, ROOT_FRN, "a.txt")];
        let v = reconstruct('D', raw, None);
        assert_eq!(paths_of(&v), vec![format!("D:{SEP}a.txt")]);
    }

    #[test]
    fn system_volume_allowlist_inverts_rules() {
        let allowed = vec![format!("c:{SEP}users{SEP}me{SEP}documents")];
        let raw = vec![
            dir(10, ROOT_FRN, "Users"),
            dir(11, 10, "me"),
            dir(12, 11, "Documents"),
            dir(13, 11, "Secrets"),
            file(20, 12, "thesis.docx"),
            file(21, 13, "keys.txt"),
            file(22, ROOT_FRN, "pagefile.bin"),
        ];
        let v = reconstruct('C', raw, Some(&allowed));
        let paths = paths_of(&v);
        // Ancestors of the root are traversed but not retained.
        assert!(!paths.iter().any(|p| p.ends_with("Users")));
        assert!(paths.contains(&format!(
            "C:{SEP}Users{SEP}me{SEP}Documents{SEP}thesis.docx"
        )));
        assert!(paths.contains(&format!("C:{SEP}Users{SEP}me{SEP}Documents")));
        assert!(!paths.iter().any(|p| p.contains("Secrets")));
        assert!(!paths.iter().any(|p| p.contains("pagefile")));
    }

    #[test]
    fn parent_link_cycles_terminate() {
        // 10 and 11 point at each other; neither is reachable from the
        // root, so nothing under them is emitted and the BFS still ends.
        let raw = vec![
            dir(10, 11, "a"),
            dir(11, 10, "b"),
            file(20, 10, "in_cycle.txt"),
            file(21, ROOT_FRN, "ok.txt"),
        ];
        let v = reconstruct('D', raw, None);
        assert_eq!(paths_of(&v), vec![format!("D:{SEP}ok.txt")]);
    }

    #[test]
    fn dir_path_map_covers_traversed_dirs() {
        let raw = vec![dir(10, ROOT_FRN, "work"), dir(11, 10, "sub")];
        let v = reconstruct('D', raw, None);
        assert_eq!(v.dir_paths.get(&ROOT_FRN).unwrap(), &format!("D:{SEP}"));
        assert_eq!(
            v.dir_paths.get(&11).unwrap(),
            &format!("D:{SEP}work{SEP}sub")
        );
    }
}
