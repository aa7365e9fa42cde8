//! NTFS integration layer: volume discovery, bulk MFT enumeration, path
//! reconstruction, and USN journal tailing.
//!
//! The raw Win32 plumbing lives behind `cfg(windows)`; everything that can
//! be expressed as a pure function over bytes or records (USN record
//! parsing, path reconstruction, reason-bit mapping, the poll backoff) is
//! platform-independent and unit-tested everywhere. Non-Windows builds
//! fall back to a recursive directory walk with the same skip rules.

use core_types::FileAttributes;
use thiserror::Error;

pub mod journal;
pub mod mft;
pub mod paths;
pub mod stat_pool;
pub mod volumes;
pub mod walk;

#[cfg(windows)]
pub(crate) mod win;

/// One raw MFT record as surfaced by the enumeration ioctl: no paths yet,
/// just the parent back-link and the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMftRecord {
    /// File reference number, masked to 48 bits.
    pub frn: u64,
    /// Parent directory reference number, masked to 48 bits.
    pub parent_frn: u64,
    pub name: String,
    pub attributes: FileAttributes,
}

impl RawMftRecord {
    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }
}

/// Resume point for USN processing on one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalCursor {
    pub journal_id: u64,
    pub last_usn: core_types::Usn,
}

/// Errors surfaced by the volume layer.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The volume handle could not be opened with the required access
    /// (typically a non-elevated process).
    #[error("access denied opening volume {drive}:")]
    PermissionDenied { drive: char },

    /// Not an NTFS volume, or not a Windows host at all.
    #[error("volume {drive}: does not support MFT/USN enumeration")]
    Unsupported { drive: char },

    /// The change journal was deleted and recreated since our cursor.
    #[error("usn journal rotated on {drive}: (stored {stored:#x}, current {current:#x})")]
    JournalRotated { drive: char, stored: u64, current: u64 },

    /// The volume disappeared mid-operation.
    #[error("volume {drive}: is gone")]
    VolumeGone { drive: char },

    /// A DeviceIoControl call failed with an unexpected status.
    #[error("{op} failed on {drive}: ({message})")]
    Ioctl {
        drive: char,
        op: &'static str,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mask an NTFS file reference number down to the 48-bit record index,
/// discarding the sequence number in the high 16 bits.
pub const fn mask_frn(raw: u64) -> u64 {
    raw & 0x0000_FFFF_FFFF_FFFF
}

/// The MFT record index of an NTFS volume root.
pub const ROOT_FRN: u64 = 5;
