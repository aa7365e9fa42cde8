//! USN change-journal tailing: one thread per volume turning journal
//! deltas into ordered `ChangeEvent`s.
//!
//! The tailer polls `FSCTL_READ_USN_JOURNAL` from its stored cursor.
//! Polling is adaptive: 100 ms while events flow, multiplying per empty
//! poll up to a 2 s ceiling reached after ten misses. Journal records carry a name and a
//! parent FRN, not a path, so the tailer owns the directory-path map
//! produced by reconstruction and resolves (and maintains) paths from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use core_types::{join_path, ChangeEvent, ChangeKind, FileAttributes};
use crossbeam_channel::Sender;

use crate::mft::{skip_at_source, ParsedUsnRecord};
use crate::{JournalCursor, VolumeError};

pub const REASON_DATA_OVERWRITE: u32 = 0x0000_0001;
pub const REASON_DATA_EXTEND: u32 = 0x0000_0002;
pub const REASON_DATA_TRUNCATION: u32 = 0x0000_0004;
pub const REASON_FILE_CREATE: u32 = 0x0000_0100;
pub const REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const REASON_BASIC_INFO_CHANGE: u32 = 0x0000_8000;

/// Map a USN reason mask to the event kind.
///
/// A rename is two journal records: the old name maps to Deleted, the new
/// name to Created; the mutator resolves the semantics from path state.
pub fn kind_for_reason(reason: u32) -> ChangeKind {
    if reason & (REASON_FILE_DELETE | REASON_RENAME_OLD_NAME) != 0 {
        ChangeKind::Deleted
    } else if reason & (REASON_FILE_CREATE | REASON_RENAME_NEW_NAME) != 0 {
        ChangeKind::Created
    } else {
        // DATA_OVERWRITE / DATA_EXTEND / DATA_TRUNCATION /
        // BASIC_INFO_CHANGE, and any other visible reason.
        ChangeKind::Modified
    }
}

/// Adaptive poll delay: `min` while events flow, multiplied per empty
/// poll, capped at `max`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    empty_polls: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2), 1.35)
    }
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max,
            factor,
            empty_polls: 0,
        }
    }

    /// Record the outcome of a poll and return how long to sleep.
    pub fn next_delay(&mut self, had_events: bool) -> Duration {
        if had_events {
            self.empty_polls = 0;
            return self.min;
        }
        self.empty_polls = self.empty_polls.saturating_add(1);
        let scaled = self.min.as_secs_f64() * self.factor.powi(self.empty_polls.min(10) as i32);
        Duration::from_secs_f64(scaled).min(self.max)
    }
}

/// Messages a tailer thread emits toward the index mutator.
#[derive(Debug)]
pub enum TailerMessage {
    /// Ordered events since the last batch (ascending USN).
    Batch { drive: char, events: Vec<ChangeEvent> },
    /// The journal id changed; all pending state is invalid and the
    /// volume needs a full rebuild.
    Rotated { drive: char, stored: u64, current: u64 },
    /// The volume disappeared; the tailer stopped.
    Gone { drive: char },
}

/// Resolve one journal record into a change event, updating the
/// directory-path map as directories come and go.
///
/// Returns `None` for metadata names and for records whose parent
/// directory is unknown (outside the indexed area).
pub fn resolve_event(
    rec: &ParsedUsnRecord,
    dir_paths: &mut AHashMap<u64, String>,
) -> Option<ChangeEvent> {
    if skip_at_source(&rec.name) {
        return None;
    }
    let parent_path = dir_paths.get(&rec.parent_frn)?.clone();
    let path = join_path(&parent_path, &rec.name);
    let attrs = FileAttributes::from_bits_truncate(rec.attributes);
    let kind = kind_for_reason(rec.reason);

    if attrs.is_dir() {
        match kind {
            ChangeKind::Created => {
                dir_paths.insert(rec.frn, path.clone());
            }
            ChangeKind::Deleted => {
                dir_paths.remove(&rec.frn);
            }
            _ => {}
        }
    }

    Some(ChangeEvent {
        kind,
        path,
        is_dir: attrs.is_dir(),
        usn: rec.usn,
    })
}

/// Running tailer thread for one volume.
pub struct TailerHandle {
    stop: Arc<AtomicBool>,
    join: std::thread::JoinHandle<()>,
}

impl TailerHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Current journal identity and head position for a volume. The cold
/// build stamps this into the index so the tailer can resume from it.
pub fn query_cursor(drive: char) -> Result<JournalCursor, VolumeError> {
    imp::query_cursor(drive)
}

/// Start tailing a volume's journal from `cursor`.
///
/// `dir_paths` is the FRN → path map from reconstruction. On non-Windows
/// hosts the change monitor is inert and this returns `Unsupported`.
pub fn spawn_tailer(
    drive: char,
    cursor: JournalCursor,
    dir_paths: AHashMap<u64, String>,
    tx: Sender<TailerMessage>,
) -> Result<TailerHandle, VolumeError> {
    imp::spawn_tailer(drive, cursor, dir_paths, tx)
}

#[cfg(windows)]
mod imp {
    use super::*;
    use crate::mft::{parse_record_at, ParseStep};
    use crate::win::{ioctl_err, open_volume, query_journal, SafeHandle, ENUM_BUFFER_SIZE};
    use tracing::{info, warn};
    use windows::Win32::Foundation::ERROR_ACCESS_DENIED;
    use windows::Win32::System::Ioctl::FSCTL_READ_USN_JOURNAL;
    use windows::Win32::System::IO::DeviceIoControl;

    /// READ_USN_JOURNAL_DATA_V0.
    #[repr(C)]
    struct ReadUsnJournalData {
        start_usn: i64,
        reason_mask: u32,
        return_only_on_close: u32,
        timeout: u64,
        bytes_to_wait_for: u64,
        usn_journal_id: u64,
    }

    pub fn query_cursor(drive: char) -> Result<JournalCursor, VolumeError> {
        let handle = open_volume(drive)?;
        let journal = query_journal(&handle, drive)?;
        Ok(JournalCursor {
            journal_id: journal.journal_id,
            last_usn: journal.next_usn,
        })
    }

    pub fn spawn_tailer(
        drive: char,
        cursor: JournalCursor,
        dir_paths: AHashMap<u64, String>,
        tx: Sender<TailerMessage>,
    ) -> Result<TailerHandle, VolumeError> {
        let handle = open_volume(drive)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let join = std::thread::Builder::new()
            .name(format!("usn-tailer-{drive}"))
            .spawn(move || run(drive, handle, cursor, dir_paths, tx, stop_flag))
            .map_err(VolumeError::Io)?;

        Ok(TailerHandle { stop, join })
    }

    fn run(
        drive: char,
        handle: SafeHandle,
        mut cursor: JournalCursor,
        mut dir_paths: AHashMap<u64, String>,
        tx: Sender<TailerMessage>,
        stop: Arc<AtomicBool>,
    ) {
        info!(volume = %drive, last_usn = cursor.last_usn, "usn tailer started");
        let mut backoff = PollBackoff::default();
        let mut buffer = vec![0u8; ENUM_BUFFER_SIZE];

        while !stop.load(Ordering::Relaxed) {
            let journal = match query_journal(&handle, drive) {
                Ok(j) => j,
                Err(_) => {
                    warn!(volume = %drive, "journal query failed; assuming volume gone");
                    let _ = tx.send(TailerMessage::Gone { drive });
                    return;
                }
            };
            if journal.journal_id != cursor.journal_id
                || cursor.last_usn < journal.lowest_valid_usn
            {
                info!(volume = %drive, stored = cursor.journal_id, current = journal.journal_id,
                      "journal rotated; scheduling rebuild");
                let _ = tx.send(TailerMessage::Rotated {
                    drive,
                    stored: cursor.journal_id,
                    current: journal.journal_id,
                });
                return;
            }

            let events = match read_once(drive, &handle, &mut cursor, &mut dir_paths, &mut buffer)
            {
                Ok(events) => events,
                Err(err) => {
                    warn!(volume = %drive, error = %err, "journal read failed");
                    let _ = tx.send(TailerMessage::Gone { drive });
                    return;
                }
            };

            let had_events = !events.is_empty();
            if had_events && tx.send(TailerMessage::Batch { drive, events }).is_err() {
                return; // receiver dropped; engine is shutting down
            }

            let delay = backoff.next_delay(had_events);
            // Sleep in short steps so stop requests take effect promptly.
            let mut remaining = delay;
            let step = Duration::from_millis(100);
            while remaining > Duration::ZERO && !stop.load(Ordering::Relaxed) {
                let chunk = remaining.min(step);
                std::thread::sleep(chunk);
                remaining = remaining.saturating_sub(chunk);
            }
        }
    }

    fn read_once(
        drive: char,
        handle: &SafeHandle,
        cursor: &mut JournalCursor,
        dir_paths: &mut AHashMap<u64, String>,
        buffer: &mut [u8],
    ) -> Result<Vec<ChangeEvent>, VolumeError> {
        let input = ReadUsnJournalData {
            start_usn: cursor.last_usn,
            reason_mask: u32::MAX,
            return_only_on_close: 0,
            timeout: 0,
            bytes_to_wait_for: 0,
            usn_journal_id: cursor.journal_id,
        };
        let mut bytes_returned = 0u32;

        let result = unsafe {
            DeviceIoControl(
                handle.raw(),
                FSCTL_READ_USN_JOURNAL,
                Some(&input as *const _ as *const _),
                std::mem::size_of::<ReadUsnJournalData>() as u32,
                Some(buffer.as_mut_ptr() as *mut _),
                buffer.len() as u32,
                Some(&mut bytes_returned),
                None,
            )
        };

        match result {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                return Err(VolumeError::PermissionDenied { drive });
            }
            Err(e) => return Err(ioctl_err(drive, "FSCTL_READ_USN_JOURNAL", &e)),
        }

        if (bytes_returned as usize) < 8 {
            return Ok(Vec::new());
        }
        let buf = &buffer[..bytes_returned as usize];
        cursor.last_usn = i64::from_le_bytes(buf[0..8].try_into().unwrap());

        let mut events = Vec::new();
        let mut offset = 8;
        loop {
            match parse_record_at(buf, offset) {
                ParseStep::Record(rec, next) => {
                    if let Some(ev) = resolve_event(&rec, dir_paths) {
                        events.push(ev);
                    }
                    offset = next;
                }
                ParseStep::Skip(next) => offset = next,
                ParseStep::Done => break,
            }
        }
        Ok(events)
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;

    pub fn query_cursor(drive: char) -> Result<JournalCursor, VolumeError> {
        Err(VolumeError::Unsupported { drive })
    }

    pub fn spawn_tailer(
        drive: char,
        _cursor: JournalCursor,
        _dir_paths: AHashMap<u64, String>,
        _tx: Sender<TailerMessage>,
    ) -> Result<TailerHandle, VolumeError> {
        Err(VolumeError::Unsupported { drive })
    }
}
