//! Shared Win32 plumbing: volume handles and journal queries.

use crate::VolumeError;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_FUNCTION, ERROR_JOURNAL_NOT_ACTIVE,
    GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::FSCTL_QUERY_USN_JOURNAL;
use windows::Win32::System::IO::DeviceIoControl;

/// 1 MiB response buffer for enumeration and journal reads.
pub(crate) const ENUM_BUFFER_SIZE: usize = 1 << 20;

/// Owned volume handle, closed on drop.
pub(crate) struct SafeHandle(HANDLE);

impl SafeHandle {
    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for SafeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

// The handle is only used for DeviceIoControl, which is thread-safe.
unsafe impl Send for SafeHandle {}

/// Open `\\.\X:` with backup semantics and full sharing.
pub(crate) fn open_volume(drive: char) -> Result<SafeHandle, VolumeError> {
    let path = format!(r"\\.\{}:", drive.to_ascii_uppercase());
    let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();

    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            GENERIC_READ.0 | GENERIC_WRITE.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            HANDLE::default(),
        )
    };

    match handle {
        Ok(h) => Ok(SafeHandle(h)),
        Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
            Err(VolumeError::PermissionDenied { drive })
        }
        Err(e) => Err(ioctl_err(drive, "CreateFileW", &e)),
    }
}

/// Journal metadata returned by `FSCTL_QUERY_USN_JOURNAL`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JournalData {
    pub journal_id: u64,
    pub next_usn: i64,
    pub lowest_valid_usn: i64,
}

pub(crate) fn query_journal(
    handle: &SafeHandle,
    drive: char,
) -> Result<JournalData, VolumeError> {
    // USN_JOURNAL_DATA_V0 is 56 bytes.
    let mut buf = [0u8; 56];
    let mut bytes_returned = 0u32;

    let result = unsafe {
        DeviceIoControl(
            handle.raw(),
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(buf.as_mut_ptr() as *mut _),
            buf.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
    };

    match result {
        Ok(()) if bytes_returned as usize >= 32 => Ok(JournalData {
            journal_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            next_usn: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            lowest_valid_usn: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }),
        Ok(()) => Err(VolumeError::Ioctl {
            drive,
            op: "FSCTL_QUERY_USN_JOURNAL",
            message: format!("short response ({bytes_returned} bytes)"),
        }),
        Err(e)
            if e.code() == ERROR_JOURNAL_NOT_ACTIVE.to_hresult()
                || e.code() == ERROR_INVALID_FUNCTION.to_hresult() =>
        {
            Err(VolumeError::Unsupported { drive })
        }
        Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
            Err(VolumeError::PermissionDenied { drive })
        }
        Err(e) => Err(ioctl_err(drive, "FSCTL_QUERY_USN_JOURNAL", &e)),
    }
}

pub(crate) fn ioctl_err(drive: char, op: &'static str, e: &windows::core::Error) -> VolumeError {
    VolumeError::Ioctl {
        drive,
        op,
        message: e.message().to_string(),
    }
}
