//! Core identifiers and shared lightweight types for FlashFind.
//!
//! These types intentionally avoid heavy dependencies and aim to be
//! serialization-friendly for the persisted index and for test fixtures.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod skip;

/// Dense index of a record inside its volume's records array.
pub type RecordId = u32;

/// USN journal cursor. Windows USNs are signed 64-bit quantities.
pub type Usn = i64;

/// Path separator used when composing indexed paths.
pub const SEP: char = std::path::MAIN_SEPARATOR;

bitflags::bitflags! {
    /// Subset of FILE_ATTRIBUTE_* bits carried by MFT/USN records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FileAttributes: u32 {
        const READONLY      = 0x0000_0001;
        const HIDDEN        = 0x0000_0002;
        const SYSTEM        = 0x0000_0004;
        const DIRECTORY     = 0x0000_0010;
        const ARCHIVE       = 0x0000_0020;
        const TEMPORARY     = 0x0000_0100;
        const SPARSE        = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED    = 0x0000_0800;
        const OFFLINE       = 0x0000_1000;
    }
}

impl FileAttributes {
    pub fn is_dir(self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

/// The indexed unit: one file or directory on a volume.
///
/// Invariants: `full_path == join(parent_dir, name)`, `name_lower` is the
/// case-folded `name`, and `extension` is the lowercased suffix (with its
/// leading dot) for files and empty for directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub name_lower: String,
    pub parent_dir: String,
    pub full_path: String,
    pub extension: String,
    pub size: u64,
    pub mtime: f64,
    pub is_dir: bool,
}

impl FileRecord {
    /// Build a record from its parts, deriving the folded/composed fields.
    pub fn new(name: &str, parent_dir: &str, is_dir: bool, size: u64, mtime: f64) -> Self {
        let full_path = join_path(parent_dir, name);
        Self {
            name: name.to_string(),
            name_lower: name.to_lowercase(),
            parent_dir: parent_dir.to_string(),
            full_path,
            extension: if is_dir { String::new() } else { extension_of(name) },
            size: if is_dir { 0 } else { size },
            mtime,
            is_dir,
        }
    }

    /// Case-folded full path, used for matching in Everything mode.
    pub fn full_path_lower(&self) -> String {
        self.full_path.to_lowercase()
    }
}

/// What happened to a path, as reported by the change monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Renamed,
    Deleted,
}

/// A single filesystem mutation observed on a volume.
///
/// For a given volume, events are delivered in strictly ascending `usn`
/// order. A rename arrives as Deleted(old path) followed by
/// Created(new path); `Renamed` is the mutator-resolved form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub is_dir: bool,
    pub usn: Usn,
}

/// Join a directory path and a child name with the volume separator.
///
/// A parent ending in the separator (the volume root, `X:\`) does not get
/// a second one.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        return name.to_string();
    }
    if parent.ends_with(SEP) {
        format!("{parent}{name}")
    } else {
        format!("{parent}{SEP}{name}")
    }
}

/// Final component of a path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches(SEP)
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(path)
}

/// Directory part of a path, without a trailing separator (except for a
/// volume root, which keeps it: the parent of `X:\foo` is `X:\`).
pub fn parent_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEP);
    match trimmed.rfind(['\\', '/']) {
        Some(0) => &path[..1],
        Some(idx) => {
            let head = &trimmed[..idx];
            // Keep the separator on drive roots like "C:".
            if head.ends_with(':') {
                &trimmed[..=idx]
            } else {
                head
            }
        }
        None => "",
    }
}

/// Lowercased suffix of a file name, including the leading dot.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!(".{}", ext.to_lowercase())
        }
        _ => String::new(),
    }
}
