//! Self-describing record slots inside the backing file
//!
//! Every saved unit occupies a range that starts with a fixed header followed
//! by the unit's payload. Because a range may be larger than the record it
//! holds (units that shrink keep their old range), the header carries the
//! payload length so a reload knows where the record ends.
//!
//! # Binary Layout (24-byte header)
//!
//! ```text
//! Offset | Size | Field
//! -------|------|------------------
//!   0    |  4   | magic
//!   4    |  2   | version
//!   6    |  1   | kind
//!   7    |  1   | reserved
//!   8    |  8   | payload_len
//!  16    |  8   | checksum (CRC-64-ECMA-182 of payload)
//! ```

use crate::error::CacheError;
use crate::storage::backing_file::BackingFile;
use crate::types::FileRange;
use crc::{Crc, CRC_64_ECMA_182};

/// Magic number identifying a record: "BOXC"
pub const RECORD_MAGIC: u32 = 0x424F_5843;

/// Current record format version
pub const RECORD_VERSION: u16 = 1;

/// Size of the record header in bytes
pub const RECORD_HEADER_SIZE: u64 = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Payload shape stored in a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Opaque byte block
    Bytes = 1,
    /// Detector event list
    Events = 2,
}

impl RecordKind {
    fn from_u8(value: u8) -> Result<Self, CacheError> {
        match value {
            1 => Ok(RecordKind::Bytes),
            2 => Ok(RecordKind::Events),
            other => Err(CacheError::CorruptedData(format!(
                "unknown record kind {}",
                other
            ))),
        }
    }
}

/// Header at the start of every record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload shape
    pub kind: RecordKind,
    /// Payload length in bytes
    pub payload_len: u64,
    /// CRC-64 of the payload
    pub checksum: u64,
}

impl RecordHeader {
    /// Build the header describing `payload`
    pub fn for_payload(kind: RecordKind, payload: &[u8]) -> Self {
        Self {
            kind,
            payload_len: payload.len() as u64,
            checksum: CRC64.checksum(payload),
        }
    }

    /// Serialize to the fixed 24-byte layout
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        bytes[4..6].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        bytes[6] = self.kind as u8;
        // [7] reserved, already zero
        bytes[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Parse and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < RECORD_HEADER_SIZE as usize {
            return Err(CacheError::CorruptedData(format!(
                "record header is {} bytes (expected {})",
                bytes.len(),
                RECORD_HEADER_SIZE
            )));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != RECORD_MAGIC {
            return Err(CacheError::CorruptedData(format!(
                "bad record magic {:#x}",
                magic
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != RECORD_VERSION {
            return Err(CacheError::CorruptedData(format!(
                "unsupported record version {}",
                version
            )));
        }
        let kind = RecordKind::from_u8(bytes[6])?;

        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[8..16]);
        let payload_len = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[16..24]);
        let checksum = u64::from_le_bytes(word);

        Ok(Self {
            kind,
            payload_len,
            checksum,
        })
    }
}

/// On-disk size of a record holding `payload_len` bytes
pub fn record_len(payload_len: u64) -> u64 {
    RECORD_HEADER_SIZE + payload_len
}

/// Header plus payload, ready to be written into a range
pub fn encode_record(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let header = RecordHeader::for_payload(kind, payload);
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Write a record at the start of `range`
pub fn write_record(
    file: &BackingFile,
    range: FileRange,
    kind: RecordKind,
    payload: &[u8],
) -> Result<(), CacheError> {
    file.write_range(range, &encode_record(kind, payload))
}

/// Read and verify the record stored at the start of `range`
///
/// Returns the payload bytes.
pub fn read_record(
    file: &BackingFile,
    range: FileRange,
    expected: RecordKind,
) -> Result<Vec<u8>, CacheError> {
    let header_bytes = file.read_range(range, RECORD_HEADER_SIZE)?;
    let header = RecordHeader::from_bytes(&header_bytes)?;

    if header.kind != expected {
        return Err(CacheError::CorruptedData(format!(
            "record at {} holds {:?}, expected {:?}",
            range, header.kind, expected
        )));
    }
    let total = RECORD_HEADER_SIZE
        .checked_add(header.payload_len)
        .filter(|&total| total <= range.length)
        .ok_or_else(|| {
            CacheError::CorruptedData(format!(
                "record payload of {} bytes overruns range {}",
                header.payload_len, range
            ))
        })?;

    let payload_range = FileRange::new(range.offset + RECORD_HEADER_SIZE, total - RECORD_HEADER_SIZE);
    let payload = file.read_range(payload_range, header.payload_len)?;

    let actual = CRC64.checksum(&payload);
    if actual != header.checksum {
        return Err(CacheError::CorruptedData(format!(
            "checksum mismatch at {}: expected {:#x}, got {:#x}",
            range, header.checksum, actual
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::for_payload(RecordKind::Events, &[1, 2, 3]);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &RECORD_MAGIC.to_le_bytes());
        assert_eq!(bytes[6], 2);
        assert_eq!(RecordHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = RecordHeader::for_payload(RecordKind::Bytes, b"x").to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            RecordHeader::from_bytes(&bytes),
            Err(CacheError::CorruptedData(_))
        ));
    }

    #[test]
    fn test_record_in_oversized_range() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("records.bin")).unwrap();
        let range = FileRange::new(0, 128);

        write_record(&file, range, RecordKind::Bytes, b"payload").unwrap();
        let payload = read_record(&file, range, RecordKind::Bytes).unwrap();
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("records.bin")).unwrap();
        let range = FileRange::new(0, record_len(4));

        write_record(&file, range, RecordKind::Bytes, &[1, 2, 3, 4]).unwrap();
        file.write_at(RECORD_HEADER_SIZE + 1, &[0xEE]).unwrap();

        let err = read_record(&file, range, RecordKind::Bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_kind_mismatch_detected() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("records.bin")).unwrap();
        let range = FileRange::new(0, record_len(1));

        write_record(&file, range, RecordKind::Bytes, &[1]).unwrap();
        assert!(read_record(&file, range, RecordKind::Events).is_err());
    }
}
