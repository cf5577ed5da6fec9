//! Archive Format Module
//!
//! Binary layout of the containers servers store: ZIP-style local records,
//! central directory entries and the end-of-directory trailer. Only stored
//! (uncompressed) entries are produced or accepted. The checksum field of every
//! record carries a CRC32C of the payload.
//!
//! All integers are little-endian.

use std::io::{Cursor, Read};
use thiserror::Error;

/// Signature of a local record
pub const LOCAL_RECORD_SIGNATURE: u32 = 0x0403_4b50;
/// Signature of a central directory entry
pub const DIRECTORY_ENTRY_SIGNATURE: u32 = 0x0201_4b50;
/// Signature of the end-of-directory trailer
pub const END_OF_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

/// Fixed part of a local record, before the name and extra field
pub const LOCAL_RECORD_BASE_SIZE: usize = 30;
/// Fixed part of a directory entry, before name, extra and comment
pub const DIRECTORY_ENTRY_BASE_SIZE: usize = 46;
/// Fixed part of the end-of-directory trailer, before its comment
pub const END_OF_DIRECTORY_BASE_SIZE: usize = 22;

const VERSION_NEEDED: u16 = 20;
const METHOD_STORED: u16 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveFormatError {
    #[error("Bad signature: expected {expected:08x}, found {found:08x}")]
    BadSignature { expected: u32, found: u32 },

    #[error("Truncated record: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Checksum mismatch for {name}: expected {expected:08x}, calculated {calculated:08x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        calculated: u32,
    },

    #[error("Unsupported compression method {method} for {name}")]
    UnsupportedMethod { name: String, method: u16 },

    #[error("Stored record {name} has compressed size {compressed} but size {uncompressed}")]
    SizeMismatch {
        name: String,
        compressed: u32,
        uncompressed: u32,
    },

    #[error("Record name is not valid UTF-8")]
    InvalidName,

    #[error("Too few records: found {found}, need {required}")]
    TooFewRecords { found: usize, required: usize },

    #[error("End-of-directory record not found")]
    MissingEndOfDirectory,

    #[error("Archive too large for 32-bit offsets")]
    TooLarge,
}

/// CRC32C of `data`
pub fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, ArchiveFormatError> {
    let mut buf = [0u8; 2];
    read_exact(cursor, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, ArchiveFormatError> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), ArchiveFormatError> {
    let available = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    cursor
        .read_exact(buf)
        .map_err(|_| ArchiveFormatError::Truncated {
            needed: buf.len(),
            available,
        })
}

fn read_name(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String, ArchiveFormatError> {
    let mut name = vec![0u8; len];
    read_exact(cursor, &mut name)?;
    String::from_utf8(name).map_err(|_| ArchiveFormatError::InvalidName)
}

fn skip(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<(), ArchiveFormatError> {
    let available = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if available < len {
        return Err(ArchiveFormatError::Truncated {
            needed: len,
            available,
        });
    }
    cursor.set_position(cursor.position() + len as u64);
    Ok(())
}

fn expect_signature(
    cursor: &mut Cursor<&[u8]>,
    expected: u32,
) -> Result<(), ArchiveFormatError> {
    let found = read_u32(cursor)?;
    if found != expected {
        return Err(ArchiveFormatError::BadSignature { expected, found });
    }
    Ok(())
}

/// Read the first four bytes of `data` as a signature, if there are four bytes.
pub fn peek_signature(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn require_stored(
    name: &str,
    method: u16,
    compressed: u32,
    uncompressed: u32,
) -> Result<(), ArchiveFormatError> {
    if method != METHOD_STORED {
        return Err(ArchiveFormatError::UnsupportedMethod {
            name: name.to_string(),
            method,
        });
    }
    if compressed != uncompressed {
        return Err(ArchiveFormatError::SizeMismatch {
            name: name.to_string(),
            compressed,
            uncompressed,
        });
    }
    Ok(())
}

/// Header of a local record; the payload follows it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecordHeader {
    pub method: u16,
    pub checksum: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: String,
    pub extra_len: u16,
}

impl LocalRecordHeader {
    /// Bytes from the record start to the payload start
    pub fn header_length(&self) -> usize {
        LOCAL_RECORD_BASE_SIZE + self.name.len() + self.extra_len as usize
    }

    /// Only stored records are supported; their two sizes must agree.
    pub fn require_stored(&self) -> Result<(), ArchiveFormatError> {
        require_stored(
            &self.name,
            self.method,
            self.compressed_size,
            self.uncompressed_size,
        )
    }

    /// Parse a local record header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ArchiveFormatError> {
        let mut cursor = Cursor::new(data);
        expect_signature(&mut cursor, LOCAL_RECORD_SIGNATURE)?;
        let _version = read_u16(&mut cursor)?;
        let _flags = read_u16(&mut cursor)?;
        let method = read_u16(&mut cursor)?;
        let _time = read_u16(&mut cursor)?;
        let _date = read_u16(&mut cursor)?;
        let checksum = read_u32(&mut cursor)?;
        let compressed_size = read_u32(&mut cursor)?;
        let uncompressed_size = read_u32(&mut cursor)?;
        let name_len = read_u16(&mut cursor)? as usize;
        let extra_len = read_u16(&mut cursor)?;
        let name = read_name(&mut cursor, name_len)?;
        skip(&mut cursor, extra_len as usize)?;

        Ok(Self {
            method,
            checksum,
            compressed_size,
            uncompressed_size,
            name,
            extra_len,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LOCAL_RECORD_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // time
        out.extend_from_slice(&0u16.to_le_bytes()); // date
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra
        out.extend_from_slice(self.name.as_bytes());
    }
}

/// Encode one stored local record (header + payload).
pub fn encode_local_record(name: &str, payload: &[u8]) -> Result<Vec<u8>, ArchiveFormatError> {
    let size = u32::try_from(payload.len()).map_err(|_| ArchiveFormatError::TooLarge)?;
    let header = LocalRecordHeader {
        method: METHOD_STORED,
        checksum: checksum(payload),
        compressed_size: size,
        uncompressed_size: size,
        name: name.to_string(),
        extra_len: 0,
    };
    let mut out = Vec::with_capacity(header.header_length() + payload.len());
    header.write_to(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// One central directory entry: where a chunk lives and how to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub method: u16,
    pub checksum: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Offset of the chunk's local record inside the container
    pub local_offset: u32,
    pub extra_len: u16,
}

impl DirectoryEntry {
    /// Offset of the payload inside the container. Local records carry the
    /// same extra field length as their directory entry.
    pub fn payload_offset(&self) -> u64 {
        self.local_offset as u64
            + LOCAL_RECORD_BASE_SIZE as u64
            + self.name.len() as u64
            + self.extra_len as u64
    }

    fn parse_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, ArchiveFormatError> {
        expect_signature(cursor, DIRECTORY_ENTRY_SIGNATURE)?;
        let _made_by = read_u16(cursor)?;
        let _needed = read_u16(cursor)?;
        let _flags = read_u16(cursor)?;
        let method = read_u16(cursor)?;
        let _time = read_u16(cursor)?;
        let _date = read_u16(cursor)?;
        let checksum = read_u32(cursor)?;
        let compressed_size = read_u32(cursor)?;
        let uncompressed_size = read_u32(cursor)?;
        let name_len = read_u16(cursor)? as usize;
        let extra_len = read_u16(cursor)?;
        let comment_len = read_u16(cursor)? as usize;
        let _disk = read_u16(cursor)?;
        let _internal = read_u16(cursor)?;
        let _external = read_u32(cursor)?;
        let local_offset = read_u32(cursor)?;
        let name = read_name(cursor, name_len)?;
        skip(cursor, extra_len as usize + comment_len)?;

        require_stored(&name, method, compressed_size, uncompressed_size)?;

        Ok(Self {
            name,
            method,
            checksum,
            compressed_size,
            uncompressed_size,
            local_offset,
            extra_len,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&DIRECTORY_ENTRY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&VERSION_NEEDED.to_le_bytes()); // made by
        out.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // time
        out.extend_from_slice(&0u16.to_le_bytes()); // date
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.extra_len.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment
        out.extend_from_slice(&0u16.to_le_bytes()); // disk
        out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        out.extend_from_slice(&self.local_offset.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
    }
}

/// Parse a whole central directory: directory entries back to back.
pub fn parse_directory(data: &[u8]) -> Result<Vec<DirectoryEntry>, ArchiveFormatError> {
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < data.len() {
        entries.push(DirectoryEntry::parse_from(&mut cursor)?);
    }
    Ok(entries)
}

/// End-of-directory trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfDirectory {
    pub entries: u16,
    pub directory_size: u32,
    pub directory_offset: u32,
}

impl EndOfDirectory {
    /// Locate the trailer in the tail of a container, scanning backwards past
    /// any trailing comment.
    pub fn find(tail: &[u8]) -> Result<Self, ArchiveFormatError> {
        if tail.len() < END_OF_DIRECTORY_BASE_SIZE {
            return Err(ArchiveFormatError::MissingEndOfDirectory);
        }
        let start = (0..=tail.len() - END_OF_DIRECTORY_BASE_SIZE)
            .rev()
            .find(|&i| peek_signature(&tail[i..]) == Some(END_OF_DIRECTORY_SIGNATURE))
            .ok_or(ArchiveFormatError::MissingEndOfDirectory)?;

        let mut cursor = Cursor::new(&tail[start..]);
        expect_signature(&mut cursor, END_OF_DIRECTORY_SIGNATURE)?;
        let _disk = read_u16(&mut cursor)?;
        let _directory_disk = read_u16(&mut cursor)?;
        let _entries_on_disk = read_u16(&mut cursor)?;
        let entries = read_u16(&mut cursor)?;
        let directory_size = read_u32(&mut cursor)?;
        let directory_offset = read_u32(&mut cursor)?;

        Ok(Self {
            entries,
            directory_size,
            directory_offset,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&END_OF_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // disk
        out.extend_from_slice(&0u16.to_le_bytes()); // directory disk
        out.extend_from_slice(&self.entries.to_le_bytes());
        out.extend_from_slice(&self.entries.to_le_bytes());
        out.extend_from_slice(&self.directory_size.to_le_bytes());
        out.extend_from_slice(&self.directory_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment
    }
}

/// A finished container together with its central directory bytes, which is
/// what the metadata image replicates for this container.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub bytes: Vec<u8>,
    pub directory: Vec<u8>,
}

/// Assembles a container of stored records.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    body: Vec<u8>,
    entries: Vec<DirectoryEntry>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, payload: &[u8]) -> Result<&mut Self, ArchiveFormatError> {
        let local_offset = u32::try_from(self.body.len()).map_err(|_| ArchiveFormatError::TooLarge)?;
        let record = encode_local_record(name, payload)?;
        let size = payload.len() as u32;
        self.entries.push(DirectoryEntry {
            name: name.to_string(),
            method: METHOD_STORED,
            checksum: checksum(payload),
            compressed_size: size,
            uncompressed_size: size,
            local_offset,
            extra_len: 0,
        });
        self.body.extend_from_slice(&record);
        Ok(self)
    }

    pub fn finish(self) -> Result<BuiltArchive, ArchiveFormatError> {
        let mut directory = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut directory);
        }
        let trailer = EndOfDirectory {
            entries: u16::try_from(self.entries.len()).map_err(|_| ArchiveFormatError::TooLarge)?,
            directory_size: u32::try_from(directory.len()).map_err(|_| ArchiveFormatError::TooLarge)?,
            directory_offset: u32::try_from(self.body.len()).map_err(|_| ArchiveFormatError::TooLarge)?,
        };

        let mut bytes = self.body;
        bytes.extend_from_slice(&directory);
        trailer.write_to(&mut bytes);

        Ok(BuiltArchive { bytes, directory })
    }
}
