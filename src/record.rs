//! On-disk record format
//!
//! Record layout:
//! ```text
//! +---------+---------+---------+------------+-----------+---------------+
//! | Version |  Index  |  Term   | Value Type | Blob Size | Blob Checksum |
//! | 1 byte  | 8 bytes | 8 bytes |  4 bytes   |  8 bytes  |   16 bytes    |
//! +---------+---------+---------+------------+-----------+---------------+
//! |                        Blob (blob_size bytes)                        |
//! +----------------------------------------------------------------------+
//! ```
//!
//! - Version: format version (currently V0)
//! - Index: log index of the entry
//! - Term: Raft term of the entry
//! - Value Type: opaque tag carried for the consensus engine
//! - Blob Size: payload length in bytes (may be 0)
//! - Blob Checksum: CityHash-128 of the blob bytes only
//!
//! All integers are little-endian regardless of host byte order, so segment
//! files are portable across hosts.

use bytes::Bytes;

use crate::entry::LogEntry;
use crate::error::{ChangelogError, ChangelogResult};

/// Record header size in bytes
pub const HEADER_SIZE: usize = 45; // 1 + 8 + 8 + 4 + 8 + 16

/// On-disk format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FormatVersion {
    /// Initial format
    V0 = 0,
}

impl TryFrom<u8> for FormatVersion {
    type Error = ChangelogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::V0),
            _ => Err(ChangelogError::UnknownFormatVersion { version: value }),
        }
    }
}

/// Fixed-width header preceding each blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Format version
    pub version: FormatVersion,
    /// Log index of the entry
    pub index: u64,
    /// Raft term of the entry
    pub term: u64,
    /// Opaque value type tag
    pub value_type: u32,
    /// Blob length in bytes
    pub blob_size: u64,
    /// CityHash-128 of the blob bytes
    pub blob_checksum: u128,
}

impl RecordHeader {
    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.version as u8);
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.value_type.to_le_bytes());
        buf.extend_from_slice(&self.blob_size.to_le_bytes());
        buf.extend_from_slice(&self.blob_checksum.to_le_bytes());
    }

    /// Decode a header from a fixed-size buffer
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> ChangelogResult<Self> {
        let version = FormatVersion::try_from(buf[0])?;
        let index = u64::from_le_bytes(buf[1..9].try_into().expect("slice is exactly 8 bytes"));
        let term = u64::from_le_bytes(buf[9..17].try_into().expect("slice is exactly 8 bytes"));
        let value_type =
            u32::from_le_bytes(buf[17..21].try_into().expect("slice is exactly 4 bytes"));
        let blob_size =
            u64::from_le_bytes(buf[21..29].try_into().expect("slice is exactly 8 bytes"));
        let blob_checksum =
            u128::from_le_bytes(buf[29..45].try_into().expect("slice is exactly 16 bytes"));

        Ok(Self {
            version,
            index,
            term,
            value_type,
            blob_size,
            blob_checksum,
        })
    }
}

/// A framed changelog record
#[derive(Debug, Clone)]
pub struct Record {
    /// Record header
    pub header: RecordHeader,
    /// Payload blob
    pub blob: Bytes,
}

impl Record {
    /// Build a record framing `entry` at the given log index
    pub fn build(index: u64, entry: &LogEntry) -> Self {
        let header = RecordHeader {
            version: FormatVersion::V0,
            index,
            term: entry.term,
            value_type: entry.value_type,
            blob_size: entry.blob.len() as u64,
            blob_checksum: blob_checksum(&entry.blob),
        };

        Record {
            header,
            blob: entry.blob.clone(),
        }
    }

    /// Encode the framed record to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.blob.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.blob);
        buf
    }

    /// Get the total encoded size of this record
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.blob.len()
    }

    /// Convert the record into the entry it frames
    pub fn into_entry(self) -> LogEntry {
        LogEntry::new(self.header.term, self.header.value_type, self.blob)
    }
}

/// CityHash-128 checksum of the blob bytes
pub fn blob_checksum(blob: &[u8]) -> u128 {
    cityhash_rs::cityhash_102_128(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = RecordHeader {
            version: FormatVersion::V0,
            index: 42,
            term: 7,
            value_type: 1,
            blob_size: 11,
            blob_checksum: blob_checksum(b"hello world"),
        };

        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = RecordHeader::decode(&buf.try_into().unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_build_frames_entry() {
        let entry = LogEntry::new(5, 1, Bytes::from_static(b"payload"));
        let record = Record::build(3, &entry);

        assert_eq!(record.header.index, 3);
        assert_eq!(record.header.term, 5);
        assert_eq!(record.header.blob_size, 7);
        assert_eq!(record.header.blob_checksum, blob_checksum(b"payload"));
        assert_eq!(record.encoded_size(), HEADER_SIZE + 7);
        assert_eq!(record.encode().len(), HEADER_SIZE + 7);
    }

    #[test]
    fn test_empty_blob_checksum_symmetric() {
        // The reader recomputes over whatever it read, so empty blobs must
        // store the hash of the empty byte string, not zero.
        let entry = LogEntry::new(1, 1, Bytes::new());
        let record = Record::build(1, &entry);
        assert_eq!(record.header.blob_size, 0);
        assert_eq!(record.header.blob_checksum, blob_checksum(b""));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let entry = LogEntry::new(1, 1, Bytes::new());
        let mut buf = Record::build(1, &entry).encode();
        buf[0] = 0xAB;

        let result = RecordHeader::decode(&buf[..HEADER_SIZE].try_into().unwrap());
        assert!(matches!(
            result,
            Err(ChangelogError::UnknownFormatVersion { version: 0xAB })
        ));
    }
}
