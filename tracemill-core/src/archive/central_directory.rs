//! Zip32 central-directory parsing.
//!
//! Supported: EOCD + central directory, stored (method 0) and deflate
//! (method 8) entries. Zip64 sentinels and multi-disk archives are rejected
//! as corrupt-for-our-purposes; all sizes and offsets are untrusted and
//! validated against the file length before use.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{EngineError, Result};

const SIG_EOCD: u32 = 0x0605_4b50;
const SIG_CDFH: u32 = 0x0201_4b50;
pub(crate) const SIG_LFH: u32 = 0x0403_4b50;

const EOCD_MIN_LEN: u64 = 22;
// 64 KiB max comment plus header margin.
const EOCD_SEARCH_MAX: u64 = 66 * 1024;

const CDFH_LEN: usize = 46;
pub(crate) const LFH_LEN: usize = 30;

/// Compression method of an archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
}

/// One member's index entry: where it lives and how it is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberEntry {
    /// Offset of the local file header, not the payload.
    pub header_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub method: CompressionMethod,
}

/// Parsed index of one archive's members. Immutable for the lifetime of its
/// cache entry.
#[derive(Debug, Clone)]
pub struct CentralDirectory {
    members: HashMap<String, MemberEntry>,
}

impl CentralDirectory {
    pub fn get(&self, name: &str) -> Option<&MemberEntry> {
        self.members.get(name)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn corrupt(archive: &str, reason: impl Into<String>) -> EngineError {
    EngineError::CorruptArchive {
        archive: archive.to_string(),
        reason: reason.into(),
    }
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Locate the EOCD record in the tail window. Returns its offset within the
/// window, skipping false-positive signatures whose comment length does not
/// reach the window end.
fn find_eocd(window: &[u8]) -> Option<usize> {
    if window.len() < EOCD_MIN_LEN as usize {
        return None;
    }
    let mut i = window.len() - 4;
    loop {
        if le_u32(&window[i..i + 4]) == SIG_EOCD && i + EOCD_MIN_LEN as usize <= window.len() {
            let comment_len = le_u16(&window[i + 20..i + 22]) as usize;
            if i + EOCD_MIN_LEN as usize + comment_len == window.len() {
                return Some(i);
            }
        }
        if i == 0 {
            return None;
        }
        i -= 1;
    }
}

/// Parse the central directory of a Zip32 archive.
///
/// `archive` is the archive identity used in error reports.
pub fn parse_central_directory<R: Read + Seek>(
    reader: &mut R,
    archive: &str,
) -> Result<CentralDirectory> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < EOCD_MIN_LEN {
        return Err(corrupt(archive, "shorter than an EOCD record"));
    }

    let window_len = file_len.min(EOCD_SEARCH_MAX);
    let window_off = file_len - window_len;
    reader.seek(SeekFrom::Start(window_off))?;
    let mut window = vec![0u8; window_len as usize];
    reader.read_exact(&mut window)?;

    let eocd_rel = find_eocd(&window).ok_or_else(|| corrupt(archive, "missing EOCD record"))?;
    let eocd = &window[eocd_rel..];

    let disk_no = le_u16(&eocd[4..6]);
    let cd_disk = le_u16(&eocd[6..8]);
    let entries_disk = le_u16(&eocd[8..10]);
    let entries_total = le_u16(&eocd[10..12]);
    let cd_size = le_u32(&eocd[12..16]);
    let cd_off = le_u32(&eocd[16..20]);

    if disk_no != 0 || cd_disk != 0 || entries_disk != entries_total {
        return Err(corrupt(archive, "multi-disk archives are unsupported"));
    }
    if entries_total == 0xFFFF || cd_size == 0xFFFF_FFFF || cd_off == 0xFFFF_FFFF {
        return Err(corrupt(archive, "zip64 archives are unsupported"));
    }

    let cd_start = cd_off as u64;
    let cd_end = cd_start
        .checked_add(cd_size as u64)
        .filter(|end| *end <= file_len)
        .ok_or_else(|| corrupt(archive, "central directory out of bounds"))?;

    let mut members = HashMap::with_capacity(entries_total as usize);
    let mut pos = cd_start;
    reader.seek(SeekFrom::Start(cd_start))?;

    for _ in 0..entries_total {
        if pos + CDFH_LEN as u64 > cd_end {
            return Err(corrupt(archive, "truncated central directory"));
        }
        let mut hdr = [0u8; CDFH_LEN];
        reader.read_exact(&mut hdr)?;

        if le_u32(&hdr[0..4]) != SIG_CDFH {
            return Err(corrupt(archive, "bad central directory signature"));
        }

        let flags = le_u16(&hdr[8..10]);
        let method_raw = le_u16(&hdr[10..12]);
        let compressed_size = le_u32(&hdr[20..24]);
        let uncompressed_size = le_u32(&hdr[24..28]);
        let name_len = le_u16(&hdr[28..30]) as usize;
        let extra_len = le_u16(&hdr[30..32]) as usize;
        let comment_len = le_u16(&hdr[32..34]) as usize;
        let header_offset = le_u32(&hdr[42..46]);

        if compressed_size == 0xFFFF_FFFF
            || uncompressed_size == 0xFFFF_FFFF
            || header_offset == 0xFFFF_FFFF
        {
            return Err(corrupt(archive, "zip64 entry fields are unsupported"));
        }
        if (header_offset as u64).saturating_add(LFH_LEN as u64) > file_len {
            return Err(corrupt(archive, "member header offset out of bounds"));
        }

        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let skip = (extra_len + comment_len) as i64;
        if skip > 0 {
            reader.seek(SeekFrom::Current(skip))?;
        }
        pos += (CDFH_LEN + name_len + extra_len + comment_len) as u64;

        let is_dir = name.last() == Some(&b'/');
        let encrypted = flags & 0x0001 != 0;
        if is_dir || encrypted {
            continue;
        }
        let method = match method_raw {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            other => {
                return Err(corrupt(
                    archive,
                    format!("unsupported compression method {other}"),
                ));
            }
        };

        let name = String::from_utf8_lossy(&name).into_owned();
        members.insert(
            name,
            MemberEntry {
                header_offset: header_offset as u64,
                compressed_size: compressed_size as u64,
                uncompressed_size: uncompressed_size as u64,
                method,
            },
        );
    }

    Ok(CentralDirectory { members })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_tiny_files() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        let err = parse_central_directory(&mut cursor, "tiny.zip").unwrap_err();
        assert!(matches!(err, EngineError::CorruptArchive { .. }));
    }

    #[test]
    fn rejects_garbage_without_eocd() {
        let mut cursor = Cursor::new(vec![0xABu8; 1024]);
        let err = parse_central_directory(&mut cursor, "junk.zip").unwrap_err();
        assert!(matches!(err, EngineError::CorruptArchive { .. }));
    }
}
