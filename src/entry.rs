//! Raft log entry representation

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ChangelogError, ChangelogResult};

/// Serialized entry header size: term (8 bytes) + value type (4 bytes)
pub const ENTRY_HEADER_SIZE: usize = 12;

/// Blob size of the sentinel entry returned for an empty log
pub const SENTINEL_BLOB_SIZE: usize = std::mem::size_of::<usize>();

/// A single log entry: a Raft term, an opaque value type tag, and an opaque
/// payload blob.
///
/// The changelog never interprets the payload; it belongs to the consensus
/// engine. Cloning is cheap: the blob is reference-counted while the header
/// fields are owned per clone, so neither side can mutate the other's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Raft term the entry was created in
    pub term: u64,
    /// Opaque value type tag, carried for the consensus engine
    pub value_type: u32,
    /// Opaque payload (may be empty)
    pub blob: Bytes,
}

impl LogEntry {
    /// Create a new entry
    pub fn new(term: u64, value_type: u32, blob: Bytes) -> Self {
        Self {
            term,
            value_type,
            blob,
        }
    }

    /// Sentinel returned when the log has no last entry.
    ///
    /// Term 0 marks it as "not a real entry"; real entries carry terms >= 1.
    pub fn sentinel() -> Self {
        Self {
            term: 0,
            value_type: 0,
            blob: Bytes::from_static(&[0u8; SENTINEL_BLOB_SIZE]),
        }
    }

    /// Encode the entry to the wire form used by batch transfer
    ///
    /// Layout: term (u64 LE), value type (u32 LE), blob bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + self.blob.len());
        buf.put_u64_le(self.term);
        buf.put_u32_le(self.value_type);
        buf.put_slice(&self.blob);
        buf.freeze()
    }

    /// Decode an entry from the wire form
    pub fn deserialize(buf: &[u8]) -> ChangelogResult<Self> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(ChangelogError::CorruptedData(format!(
                "serialized entry too short: {} bytes (min {})",
                buf.len(),
                ENTRY_HEADER_SIZE
            )));
        }

        let term = u64::from_le_bytes(buf[0..8].try_into().expect("slice is exactly 8 bytes"));
        let value_type =
            u32::from_le_bytes(buf[8..12].try_into().expect("slice is exactly 4 bytes"));
        let blob = Bytes::copy_from_slice(&buf[ENTRY_HEADER_SIZE..]);

        Ok(Self {
            term,
            value_type,
            blob,
        })
    }
}
