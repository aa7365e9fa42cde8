//! Bulk MFT enumeration through the USN enumeration ioctl.
//!
//! `FSCTL_ENUM_USN_DATA` walks every live MFT record on the volume without
//! touching the directory tree: each 1 MiB response carries a leading
//! 8-byte "next FRN" cursor followed by packed USN records. The
//! enumerator extracts `(frn, parent_frn, name, attributes)` tuples and
//! nothing else; sizes and timestamps are filled later by the stat pool.
//!
//! Record parsing is plain byte slicing (no pointer casts) so the exact
//! same code handles journal reads and is testable off-Windows.

use crate::{mask_frn, RawMftRecord, VolumeError};

/// Fields shared by v2 and v3 USN records that we care about.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedUsnRecord {
    pub frn: u64,
    pub parent_frn: u64,
    pub usn: i64,
    pub reason: u32,
    pub attributes: u32,
    pub name: String,
}

pub(crate) enum ParseStep {
    /// A well-formed record and the offset of the next one.
    Record(ParsedUsnRecord, usize),
    /// An unknown-version record; advance to the next offset.
    Skip(usize),
    /// No further record fits in the buffer.
    Done,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4]))
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]))
}

/// Parse one USN record starting at `offset`.
///
/// Version 2 records carry 64-bit reference numbers; version 3 records
/// carry 128-bit ids of which only the low 64 bits are meaningful for
/// MFT-backed volumes.
pub(crate) fn parse_record_at(buf: &[u8], offset: usize) -> ParseStep {
    if offset + 8 > buf.len() {
        return ParseStep::Done;
    }
    let record_length = read_u32(buf, offset) as usize;
    if record_length < 8 || offset + record_length > buf.len() {
        return ParseStep::Done;
    }
    let major = read_u16(buf, offset + 4);

    // Field offsets relative to the record start.
    let (frn, parent_frn, usn_at, header_len) = match major {
        2 => (
            read_u64(buf, offset + 8),
            read_u64(buf, offset + 16),
            offset + 24,
            60,
        ),
        3 => (
            // FILE_ID_128: low 8 bytes hold the FRN on MFT volumes.
            read_u64(buf, offset + 8),
            read_u64(buf, offset + 24),
            offset + 40,
            76,
        ),
        _ => return ParseStep::Skip(offset + record_length),
    };

    if offset + header_len > buf.len() || record_length < header_len {
        return ParseStep::Skip(offset + record_length);
    }

    let usn = read_u64(buf, usn_at) as i64;
    let reason = read_u32(buf, usn_at + 16);
    let attributes = read_u32(buf, usn_at + 28);
    let name_len = read_u16(buf, usn_at + 32) as usize;
    let name_off = read_u16(buf, usn_at + 34) as usize;

    let name_start = offset + name_off;
    let name_end = name_start + name_len;
    if name_len == 0 || name_end > offset + record_length || name_end > buf.len() {
        return ParseStep::Skip(offset + record_length);
    }

    let units: Vec<u16> = buf[name_start..name_end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    // Invalid surrogates become U+FFFD; the record stays searchable by its
    // representable portion.
    let name = String::from_utf16_lossy(&units);

    ParseStep::Record(
        ParsedUsnRecord {
            frn: mask_frn(frn),
            parent_frn: mask_frn(parent_frn),
            usn,
            reason,
            attributes,
            name,
        },
        offset + record_length,
    )
}

/// Parse a full `FSCTL_ENUM_USN_DATA` response buffer: the leading 8-byte
/// continuation cursor, then packed records.
pub(crate) fn parse_enum_buffer(buf: &[u8]) -> (u64, Vec<ParsedUsnRecord>) {
    if buf.len() < 8 {
        return (0, Vec::new());
    }
    let next_frn = read_u64(buf, 0);
    let mut records = Vec::new();
    let mut offset = 8;
    loop {
        match parse_record_at(buf, offset) {
            ParseStep::Record(rec, next) => {
                records.push(rec);
                offset = next;
            }
            ParseStep::Skip(next) => offset = next,
            ParseStep::Done => break,
        }
    }
    (next_frn, records)
}

/// Whether a name is NTFS metadata (or hidden-by-convention) and never
/// enters the index.
pub(crate) fn skip_at_source(name: &str) -> bool {
    name.is_empty() || name.starts_with('$') || name.starts_with('.')
}

/// Enumerate every file and directory record on a volume.
///
/// Completes when the enumeration ioctl reports end-of-file. Partial
/// results are discarded on any other error; callers fall back to the
/// recursive walk.
pub fn enumerate_volume(drive: char) -> Result<Vec<RawMftRecord>, VolumeError> {
    imp::enumerate_volume(drive)
}

#[cfg(windows)]
mod imp {
    use super::*;
    use crate::win::{ioctl_err, open_volume, query_journal, ENUM_BUFFER_SIZE};
    use core_types::FileAttributes;
    use tracing::{debug, info};

    fn to_raw(rec: ParsedUsnRecord) -> RawMftRecord {
        RawMftRecord {
            frn: rec.frn,
            parent_frn: rec.parent_frn,
            attributes: FileAttributes::from_bits_truncate(rec.attributes),
            name: rec.name,
        }
    }
    use windows::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_HANDLE_EOF};
    use windows::Win32::System::Ioctl::FSCTL_ENUM_USN_DATA;
    use windows::Win32::System::IO::DeviceIoControl;

    /// MFT_ENUM_DATA_V1: start FRN, USN window, accepted record versions.
    #[repr(C)]
    struct MftEnumData {
        start_file_reference_number: u64,
        low_usn: i64,
        high_usn: i64,
        min_major_version: u16,
        max_major_version: u16,
    }

    pub fn enumerate_volume(drive: char) -> Result<Vec<RawMftRecord>, VolumeError> {
        let handle = open_volume(drive)?;
        let journal = query_journal(&handle, drive)?;

        let mut enum_data = MftEnumData {
            start_file_reference_number: 0,
            low_usn: 0,
            high_usn: journal.next_usn,
            min_major_version: 2,
            max_major_version: 3,
        };
        let mut buffer = vec![0u8; ENUM_BUFFER_SIZE];
        let mut out: Vec<RawMftRecord> = Vec::with_capacity(1 << 17);

        info!(volume = %drive, "enumerating MFT records");
        loop {
            let mut bytes_returned = 0u32;
            let result = unsafe {
                DeviceIoControl(
                    handle.raw(),
                    FSCTL_ENUM_USN_DATA,
                    Some(&enum_data as *const _ as *const _),
                    std::mem::size_of::<MftEnumData>() as u32,
                    Some(buffer.as_mut_ptr() as *mut _),
                    buffer.len() as u32,
                    Some(&mut bytes_returned),
                    None,
                )
            };

            match result {
                Ok(()) => {}
                Err(e) if e.code() == ERROR_HANDLE_EOF.to_hresult() => break,
                Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                    return Err(VolumeError::PermissionDenied { drive });
                }
                Err(e) => return Err(ioctl_err(drive, "FSCTL_ENUM_USN_DATA", &e)),
            }

            if bytes_returned < 8 {
                break;
            }

            let (next_frn, records) = parse_enum_buffer(&buffer[..bytes_returned as usize]);
            for rec in records {
                if skip_at_source(&rec.name) {
                    continue;
                }
                out.push(to_raw(rec));
            }
            enum_data.start_file_reference_number = next_frn;
        }

        debug!(volume = %drive, records = out.len(), "MFT enumeration complete");
        Ok(out)
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;

    pub fn enumerate_volume(drive: char) -> Result<Vec<RawMftRecord>, VolumeError> {
        Err(VolumeError::Unsupported { drive })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic v2 USN record.
    pub(crate) fn encode_v2(frn: u64, parent: u64, usn: i64, reason: u32, attrs: u32, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = units.len() * 2;
        let mut len = 60 + name_bytes;
        // Records are 8-byte aligned on the wire.
        len = (len + 7) & !7;

        let mut buf = vec![0u8; len];
        buf[0..4].copy_from_slice(&(len as u32).to_le_bytes());
        buf[4..6].copy_from_slice(&2u16.to_le_bytes());
        buf[8..16].copy_from_slice(&frn.to_le_bytes());
        buf[16..24].copy_from_slice(&parent.to_le_bytes());
        buf[24..32].copy_from_slice(&usn.to_le_bytes());
        buf[40..44].copy_from_slice(&reason.to_le_bytes());
        buf[52..56].copy_from_slice(&attrs.to_le_bytes());
        buf[56..58].copy_from_slice(&(name_bytes as u16).to_le_bytes());
        buf[58..60].copy_from_slice(&60u16.to_le_bytes());
        for (i, u) in units.iter().enumerate() {
            buf[60 + i * 2..62 + i * 2].copy_from_slice(&u.to_le_bytes());
        }
        buf
    }

    #[test]
    fn parses_v2_record() {
        let rec = encode_v2(0x1_0000_0000_0042, 5, 100, 0x100, 0x20, "notes.txt");
        match parse_record_at(&rec, 0) {
            ParseStep::Record(parsed, next) => {
                // Sequence bits above 48 are masked off.
                assert_eq!(parsed.frn, 0x42);
                assert_eq!(parsed.parent_frn, 5);
                assert_eq!(parsed.usn, 100);
                assert_eq!(parsed.reason, 0x100);
                assert_eq!(parsed.name, "notes.txt");
                assert_eq!(next, rec.len());
            }
            _ => panic!("expected a record"),
        }
    }

    #[test]
    fn enum_buffer_carries_cursor_and_records() {
        let mut buf = 77u64.to_le_bytes().to_vec();
        buf.extend(encode_v2(10, 5, 1, 0, 0x10, "dir"));
        buf.extend(encode_v2(11, 10, 2, 0, 0x20, "file.bin"));

        let (next, records) = parse_enum_buffer(&buf);
        assert_eq!(next, 77);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "dir");
        assert_eq!(records[1].parent_frn, 10);
    }

    #[test]
    fn unknown_versions_are_skipped() {
        let mut rec = encode_v2(1, 5, 1, 0, 0, "x");
        rec[4..6].copy_from_slice(&9u16.to_le_bytes());
        let mut buf = 0u64.to_le_bytes().to_vec();
        buf.extend(rec);
        buf.extend(encode_v2(2, 5, 2, 0, 0, "kept.txt"));

        let (_, records) = parse_enum_buffer(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "kept.txt");
    }

    #[test]
    fn invalid_utf16_becomes_replacement_char() {
        let mut rec = encode_v2(1, 5, 1, 0, 0, "ab");
        // Overwrite the second unit with an unpaired high surrogate.
        rec[62..64].copy_from_slice(&0xD800u16.to_le_bytes());
        match parse_record_at(&rec, 0) {
            ParseStep::Record(parsed, _) => {
                assert_eq!(parsed.name, format!("a{}", char::REPLACEMENT_CHARACTER));
            }
            _ => panic!("expected a record"),
        }
    }

    #[test]
    fn truncated_buffer_stops_cleanly() {
        let rec = encode_v2(1, 5, 1, 0, 0, "abcdef.txt");
        let mut buf = 0u64.to_le_bytes().to_vec();
        buf.extend(&rec[..rec.len() - 4]); // cut the tail
        let (_, records) = parse_enum_buffer(&buf);
        assert!(records.is_empty());
    }

    #[test]
    fn metadata_names_filtered_at_source() {
        assert!(skip_at_source("$MFT"));
        assert!(skip_at_source(".hidden"));
        assert!(skip_at_source(""));
        assert!(!skip_at_source("report.docx"));
    }
}
