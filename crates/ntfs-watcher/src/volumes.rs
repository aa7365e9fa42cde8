//! Attached-volume discovery.

use core_types::SEP;

/// A fixed drive visible to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub drive: char,
    /// Whether the filesystem reports as NTFS (and therefore supports
    /// the native enumeration and journal paths).
    pub is_ntfs: bool,
}

/// Mount root for a drive letter, e.g. `C:\`.
pub fn drive_root(drive: char) -> String {
    format!("{}:{}", drive.to_ascii_uppercase(), SEP)
}

/// Enumerate fixed drives. Empty on non-Windows hosts, where callers
/// operate on explicit directory roots instead.
pub fn discover_volumes() -> Vec<VolumeDescriptor> {
    imp::discover_volumes()
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tracing::debug;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW,
    };

    const DRIVE_FIXED: u32 = 3;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn is_ntfs(root: &str) -> bool {
        let root_w = wide(root);
        let mut fs_name = [0u16; 32];
        let ok = unsafe {
            GetVolumeInformationW(
                PCWSTR(root_w.as_ptr()),
                None,
                None,
                None,
                None,
                Some(&mut fs_name),
            )
        };
        if ok.is_err() {
            return false;
        }
        let len = fs_name.iter().position(|&c| c == 0).unwrap_or(fs_name.len());
        String::from_utf16_lossy(&fs_name[..len]).eq_ignore_ascii_case("NTFS")
    }

    pub fn discover_volumes() -> Vec<VolumeDescriptor> {
        let mask = unsafe { GetLogicalDrives() };
        let mut out = Vec::new();
        for i in 0..26u32 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let drive = (b'A' + i as u8) as char;
            let root = format!("{drive}:\\");
            let drive_type = unsafe { GetDriveTypeW(PCWSTR(wide(&root).as_ptr())) };
            if drive_type != DRIVE_FIXED {
                continue;
            }
            let ntfs = is_ntfs(&root);
            debug!(volume = %drive, ntfs, "discovered fixed drive");
            out.push(VolumeDescriptor { drive, is_ntfs: ntfs });
        }
        out
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;

    pub fn discover_volumes() -> Vec<VolumeDescriptor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_root_shape() {
        assert_eq!(drive_root('c'), format!("C:{SEP}"));
    }

    #[cfg(not(windows))]
    #[test]
    fn discovery_is_inert_off_windows() {
        assert!(discover_volumes().is_empty());
    }
}
