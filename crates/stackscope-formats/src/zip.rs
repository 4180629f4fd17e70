//! ZIP container directory parsing.
//!
//! Remote stack archives are plain ZIP files read over HTTP range requests, so
//! this module never sees a whole archive. Callers fetch the tail of the file,
//! locate the central directory with [`parse_eocd`], fetch exactly that region,
//! and build a [`MemberMap`] with [`parse_central_directory`]. Individual
//! member payloads are then addressable with one more ranged read after a
//! 30-byte local-header probe ([`parse_local_header_lengths`]).

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::Cursor;
use tracing::trace;

use crate::{Error, Result};

const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD64_SIG: u32 = 0x0606_4b50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

/// Fixed size of the end-of-central-directory record, excluding the comment.
pub const EOCD_MIN_LEN: usize = 22;

/// Fixed size of a local file header, excluding name and extra fields.
pub const LOCAL_HEADER_LEN: usize = 30;

/// Recommended tail length to fetch when opening an archive.
///
/// Covers the EOCD record, a maximal ZIP comment and the ZIP64 records.
pub const TAIL_FETCH_LEN: u64 = (EOCD_MIN_LEN + u16::MAX as usize + 96) as u64;

/// ZIP compression method: stored (no compression).
pub const METHOD_STORE: u16 = 0;

/// ZIP compression method: deflate.
pub const METHOD_DEFLATE: u16 = 8;

/// Location of the central directory within the archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralDirectoryLocation {
    /// Byte offset of the first central-directory record
    pub offset: u64,
    /// Total size of the central directory in bytes
    pub size: u64,
    /// Number of member records
    pub entries: u64,
}

/// One member of the archive, as described by its central-directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    /// Offset of the member's local file header
    pub header_offset: u64,
    /// Compressed payload size in bytes
    pub compressed_size: u64,
    /// Uncompressed payload size in bytes
    pub uncompressed_size: u64,
    /// Compression method (0 = store, 8 = deflate)
    pub method: u16,
    /// CRC-32 of the uncompressed payload
    pub crc32: u32,
}

/// Member directory keyed by member path.
pub type MemberMap = HashMap<String, MemberEntry>;

impl MemberEntry {
    /// Whether this reader can decode the member's compression method.
    pub fn is_supported(&self) -> bool {
        self.method == METHOD_STORE || self.method == METHOD_DEFLATE
    }
}

/// Locate the central directory from the archive's tail bytes.
///
/// `tail` must be the final `tail.len()` bytes of a `file_size`-byte archive.
/// Handles both classic and ZIP64 end-of-central-directory records, as long as
/// the ZIP64 records fall inside the provided tail (always the case for
/// archives with a directory at the end, which is how stack archives are
/// written).
pub fn parse_eocd(tail: &[u8], file_size: u64) -> Result<CentralDirectoryLocation> {
    if tail.len() < EOCD_MIN_LEN {
        return Err(Error::truncated(EOCD_MIN_LEN, tail.len()));
    }

    // The EOCD floats in front of a variable-length comment; scan backwards
    // for a signature whose comment length is consistent with the tail end.
    let mut pos = None;
    for i in (0..=tail.len() - EOCD_MIN_LEN).rev() {
        if tail[i..i + 4] == EOCD_SIG.to_le_bytes() {
            let comment_len =
                u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize;
            if i + EOCD_MIN_LEN + comment_len == tail.len() {
                pos = Some(i);
                break;
            }
        }
    }
    let pos = pos.ok_or(Error::InvalidSignature {
        record: "end of central directory",
        found: 0,
    })?;

    let mut rdr = Cursor::new(&tail[pos + 4..]);
    let _disk = rdr.read_u16::<LittleEndian>()?;
    let _cd_disk = rdr.read_u16::<LittleEndian>()?;
    let _disk_entries = rdr.read_u16::<LittleEndian>()?;
    let entries = rdr.read_u16::<LittleEndian>()?;
    let cd_size = rdr.read_u32::<LittleEndian>()?;
    let cd_offset = rdr.read_u32::<LittleEndian>()?;

    let needs_zip64 =
        entries == u16::MAX || cd_size == u32::MAX || cd_offset == u32::MAX;
    if !needs_zip64 {
        trace!("EOCD: {} entries, directory at {}+{}", entries, cd_offset, cd_size);
        return Ok(CentralDirectoryLocation {
            offset: u64::from(cd_offset),
            size: u64::from(cd_size),
            entries: u64::from(entries),
        });
    }

    // ZIP64: the locator sits immediately before the EOCD and points at the
    // ZIP64 EOCD record, which must also be inside the tail we were given.
    if pos < 20 {
        return Err(Error::truncated(pos + 20, pos));
    }
    let loc = &tail[pos - 20..pos];
    if loc[0..4] != EOCD64_LOCATOR_SIG.to_le_bytes() {
        return Err(Error::InvalidSignature {
            record: "ZIP64 EOCD locator",
            found: u32::from_le_bytes([loc[0], loc[1], loc[2], loc[3]]),
        });
    }
    let eocd64_offset = u64::from_le_bytes(loc[8..16].try_into().map_err(|_| {
        Error::truncated(16, loc.len())
    })?);

    let tail_start = file_size - tail.len() as u64;
    if eocd64_offset < tail_start {
        return Err(Error::truncated(
            (file_size - eocd64_offset) as usize,
            tail.len(),
        ));
    }
    let idx = (eocd64_offset - tail_start) as usize;
    if tail.len() < idx + 56 {
        return Err(Error::truncated(idx + 56, tail.len()));
    }
    let rec = &tail[idx..];
    if rec[0..4] != EOCD64_SIG.to_le_bytes() {
        return Err(Error::InvalidSignature {
            record: "ZIP64 EOCD",
            found: u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]),
        });
    }
    let mut rdr = Cursor::new(&rec[4..]);
    let _record_size = rdr.read_u64::<LittleEndian>()?;
    let _version_made = rdr.read_u16::<LittleEndian>()?;
    let _version_needed = rdr.read_u16::<LittleEndian>()?;
    let _disk = rdr.read_u32::<LittleEndian>()?;
    let _cd_disk = rdr.read_u32::<LittleEndian>()?;
    let _disk_entries = rdr.read_u64::<LittleEndian>()?;
    let entries = rdr.read_u64::<LittleEndian>()?;
    let size = rdr.read_u64::<LittleEndian>()?;
    let offset = rdr.read_u64::<LittleEndian>()?;

    trace!("ZIP64 EOCD: {} entries, directory at {}+{}", entries, offset, size);
    Ok(CentralDirectoryLocation { offset, size, entries })
}

/// Parse the central directory into a member map.
///
/// `buf` must span exactly the central-directory region reported by
/// [`parse_eocd`]. Members carrying unsupported compression methods are kept
/// in the map; the error surfaces only if a read is attempted.
pub fn parse_central_directory(
    buf: &[u8],
    location: &CentralDirectoryLocation,
) -> Result<MemberMap> {
    let mut members = MemberMap::with_capacity(location.entries as usize);
    let mut cursor = 0usize;

    for _ in 0..location.entries {
        if buf.len() < cursor + 46 {
            return Err(Error::truncated(cursor + 46, buf.len()));
        }
        let rec = &buf[cursor..];
        let sig = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
        if sig != CENTRAL_SIG {
            return Err(Error::InvalidSignature {
                record: "central directory entry",
                found: sig,
            });
        }

        let mut rdr = Cursor::new(&rec[4..46]);
        let _version_made = rdr.read_u16::<LittleEndian>()?;
        let _version_needed = rdr.read_u16::<LittleEndian>()?;
        let _flags = rdr.read_u16::<LittleEndian>()?;
        let method = rdr.read_u16::<LittleEndian>()?;
        let _mtime = rdr.read_u16::<LittleEndian>()?;
        let _mdate = rdr.read_u16::<LittleEndian>()?;
        let crc32 = rdr.read_u32::<LittleEndian>()?;
        let mut compressed_size = u64::from(rdr.read_u32::<LittleEndian>()?);
        let mut uncompressed_size = u64::from(rdr.read_u32::<LittleEndian>()?);
        let name_len = rdr.read_u16::<LittleEndian>()? as usize;
        let extra_len = rdr.read_u16::<LittleEndian>()? as usize;
        let comment_len = rdr.read_u16::<LittleEndian>()? as usize;
        let _disk = rdr.read_u16::<LittleEndian>()?;
        let _int_attrs = rdr.read_u16::<LittleEndian>()?;
        let _ext_attrs = rdr.read_u32::<LittleEndian>()?;
        let mut header_offset = u64::from(rdr.read_u32::<LittleEndian>()?);

        let fields_end = cursor + 46 + name_len + extra_len + comment_len;
        if buf.len() < fields_end {
            return Err(Error::truncated(fields_end, buf.len()));
        }

        let name = String::from_utf8_lossy(&buf[cursor + 46..cursor + 46 + name_len])
            .into_owned();

        // A ZIP64 extra field overrides whichever fixed fields saturated.
        let extra = &buf[cursor + 46 + name_len..cursor + 46 + name_len + extra_len];
        let mut e = 0usize;
        while e + 4 <= extra.len() {
            let id = u16::from_le_bytes([extra[e], extra[e + 1]]);
            let len = u16::from_le_bytes([extra[e + 2], extra[e + 3]]) as usize;
            if e + 4 + len > extra.len() {
                break;
            }
            if id == 0x0001 {
                let mut z = Cursor::new(&extra[e + 4..e + 4 + len]);
                if uncompressed_size == u64::from(u32::MAX) {
                    uncompressed_size = z.read_u64::<LittleEndian>()?;
                }
                if compressed_size == u64::from(u32::MAX) {
                    compressed_size = z.read_u64::<LittleEndian>()?;
                }
                if header_offset == u64::from(u32::MAX) {
                    header_offset = z.read_u64::<LittleEndian>()?;
                }
            }
            e += 4 + len;
        }

        members.insert(
            name,
            MemberEntry {
                header_offset,
                compressed_size,
                uncompressed_size,
                method,
                crc32,
            },
        );
        cursor = fields_end;
    }

    Ok(members)
}

/// Decompress one member's payload according to its directory entry.
///
/// Stack archives are written with stored members (chunks are already
/// compressed), but deflate is accepted for metadata members.
pub fn decompress_member(name: &str, entry: &MemberEntry, raw: &[u8]) -> Result<Vec<u8>> {
    match entry.method {
        METHOD_STORE => Ok(raw.to_vec()),
        METHOD_DEFLATE => {
            use std::io::Read;
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            flate2::read::DeflateDecoder::new(raw)
                .read_to_end(&mut out)
                .map_err(|e| Error::decode(format!("deflate member {name}: {e}")))?;
            if out.len() as u64 != entry.uncompressed_size {
                return Err(Error::decode(format!(
                    "member {name} inflated to {} bytes, directory says {}",
                    out.len(),
                    entry.uncompressed_size
                )));
            }
            Ok(out)
        }
        method => Err(Error::UnsupportedMethod { method, name: name.to_string() }),
    }
}

/// Parse a local file header probe and return its name and extra lengths.
///
/// The payload of a member begins at
/// `header_offset + LOCAL_HEADER_LEN + name_len + extra_len`; the local
/// header's lengths can differ from the central directory's, so a reader must
/// probe these 30 bytes before computing the payload range.
pub fn parse_local_header_lengths(header: &[u8]) -> Result<(usize, usize)> {
    if header.len() < LOCAL_HEADER_LEN {
        return Err(Error::truncated(LOCAL_HEADER_LEN, header.len()));
    }
    let sig = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if sig != LOCAL_SIG {
        return Err(Error::InvalidSignature {
            record: "local file header",
            found: sig,
        });
    }
    let name_len = u16::from_le_bytes([header[26], header[27]]) as usize;
    let extra_len = u16::from_le_bytes([header[28], header[29]]) as usize;
    Ok((name_len, extra_len))
}
