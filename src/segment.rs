//! Segment file management
//!
//! Each segment is one file holding a contiguous range of log indices fixed
//! at creation. Segments are named `<prefix>_<from>_<to>.bin`; newly rotated
//! segments use the `changelog` prefix, but any prefix is accepted on
//! recovery as long as the three underscore-separated fields parse.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::warn;

use crate::entry::LogEntry;
use crate::error::{ChangelogError, ChangelogResult};
use crate::record::{blob_checksum, Record, RecordHeader, HEADER_SIZE};

/// Filename prefix for newly rotated segments
pub const DEFAULT_PREFIX: &str = "changelog";

/// Descriptor of one on-disk segment
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// Filename prefix
    pub prefix: String,
    /// First log index the segment is reserved for (inclusive)
    pub from_log_idx: u64,
    /// Last log index the segment is reserved for (inclusive)
    pub to_log_idx: u64,
    /// Path to the segment file
    pub path: PathBuf,
}

impl SegmentDescriptor {
    /// Build a descriptor for a fresh segment rooted in `dir`
    pub fn create(dir: &Path, from_log_idx: u64, to_log_idx: u64) -> Self {
        let path = dir.join(format!("{DEFAULT_PREFIX}_{from_log_idx}_{to_log_idx}.bin"));
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            from_log_idx,
            to_log_idx,
            path,
        }
    }

    /// Parse a descriptor from a segment file path
    ///
    /// The file stem must split on `_` into at least `[prefix, from, to]`;
    /// trailing fragments are tolerated but unused.
    pub fn parse(path: &Path) -> ChangelogResult<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| invalid_segment_name(path))?;

        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() < 3 {
            return Err(invalid_segment_name(path));
        }

        let from_log_idx = parts[1]
            .parse::<u64>()
            .map_err(|_| invalid_segment_name(path))?;
        let to_log_idx = parts[2]
            .parse::<u64>()
            .map_err(|_| invalid_segment_name(path))?;

        Ok(Self {
            prefix: parts[0].to_string(),
            from_log_idx,
            to_log_idx,
            path: path.to_path_buf(),
        })
    }

    /// Number of records the segment is reserved to hold
    pub fn capacity(&self) -> u64 {
        self.to_log_idx - self.from_log_idx + 1
    }
}

fn invalid_segment_name(path: &Path) -> ChangelogError {
    ChangelogError::CorruptedData(format!("invalid changelog segment {}", path.display()))
}

/// Segment open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create the file, or truncate it to zero length if it exists
    Rewrite,
    /// Open for appending, creating the file if missing
    Append,
}

/// Appends framed records to one open segment file
pub struct SegmentWriter {
    file: File,
    position: u64,
    entries_written: u64,
    start_index: u64,
}

impl SegmentWriter {
    /// Open a segment file for writing
    pub fn open(path: &Path, mode: WriteMode, start_index: u64) -> ChangelogResult<Self> {
        let file = match mode {
            WriteMode::Rewrite => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            WriteMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
        };
        let position = file.metadata()?.len();

        Ok(Self {
            file,
            position,
            entries_written: 0,
            start_index,
        })
    }

    /// Append a framed record at the current end of the file
    ///
    /// Returns the byte offset where the record begins. With `sync`, the
    /// record is durable on the underlying device before this returns.
    pub fn append_record(&mut self, record: &Record, sync: bool) -> ChangelogResult<u64> {
        let offset = self.position;
        let encoded = record.encode();
        self.file.write_all(&encoded)?;
        self.position += encoded.len() as u64;
        self.entries_written += 1;

        if sync {
            self.file.sync_all()?;
        }
        Ok(offset)
    }

    /// Truncate the file to `new_length` bytes and reposition the write
    /// cursor there
    pub fn truncate_to(&mut self, new_length: u64) -> ChangelogResult<()> {
        self.flush()?;
        self.file.set_len(new_length)?;
        self.file.seek(SeekFrom::Start(new_length))?;
        self.position = new_length;
        Ok(())
    }

    /// Fsync the file
    pub fn flush(&mut self) -> ChangelogResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Number of records this writer has appended to the segment
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Reset the record counter, used when reopening an existing segment
    pub fn set_entries_written(&mut self, entries_written: u64) {
        self.entries_written = entries_written;
    }

    /// First log index the segment is reserved for
    pub fn start_index(&self) -> u64 {
        self.start_index
    }
}

/// Result of replaying one segment file
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadResult {
    /// Records decoded, including those before the requested start index
    pub entries_read: u64,
    /// Offset of the last fully decoded record's start, or of the first
    /// record that failed to decode when `error` is set
    pub last_position: u64,
    /// Whether the scan stopped on a torn tail, corruption, or a checksum
    /// failure rather than clean EOF
    pub error: bool,
}

/// Replays one segment file into the in-memory indexes
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    file_len: u64,
    position: u64,
}

impl SegmentReader {
    /// Open a segment file for replay
    pub fn open(path: &Path) -> ChangelogResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            file_len,
            position: 0,
        })
    }

    /// Scan the file sequentially, materializing entries at or past
    /// `start_log_idx` into `entries` and `offsets`
    ///
    /// Records before `start_log_idx` are decoded and counted but not
    /// materialized, so the caller can compare `entries_read` against the
    /// segment's declared capacity. The scan stops on clean EOF, or on the
    /// first torn or corrupt record; in the latter case `last_position` is
    /// the truncation point for crash recovery.
    pub fn read_segment(
        &mut self,
        entries: &mut BTreeMap<u64, LogEntry>,
        start_log_idx: u64,
        offsets: &mut BTreeMap<u64, u64>,
    ) -> ReadResult {
        let mut result = ReadResult::default();
        let mut previous_index = 0u64;

        loop {
            result.last_position = self.position;

            let record = match self.next_record(previous_index, entries) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    result.error = true;
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "cannot completely read changelog segment"
                    );
                    break;
                }
            };

            previous_index = record.header.index;
            result.entries_read += 1;

            if record.header.index < start_log_idx {
                continue;
            }

            offsets.insert(record.header.index, result.last_position);
            entries.insert(record.header.index, record.into_entry());
        }

        result
    }

    /// Read and validate the next record, or `None` on clean EOF
    fn next_record(
        &mut self,
        previous_index: u64,
        entries: &BTreeMap<u64, LogEntry>,
    ) -> ChangelogResult<Option<Record>> {
        let mut header_buf = [0u8; HEADER_SIZE];

        // EOF exactly on a record boundary is a clean end of file; EOF
        // anywhere inside a record is a torn tail.
        match self.reader.read_exact(&mut header_buf[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.reader.read_exact(&mut header_buf[1..])?;
        self.position += HEADER_SIZE as u64;

        let header = RecordHeader::decode(&header_buf)?;

        if header.blob_size > self.file_len.saturating_sub(self.position) {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "record blob of {} bytes extends past end of segment",
                    header.blob_size
                ),
            )
            .into());
        }

        let mut blob = vec![0u8; header.blob_size as usize];
        self.reader.read_exact(&mut blob)?;
        self.position += header.blob_size;

        if previous_index != 0 && previous_index + 1 != header.index {
            return Err(ChangelogError::CorruptedData(format!(
                "previous log entry {}, next log entry {}, seems like some entries skipped",
                previous_index, header.index
            )));
        }

        let actual = blob_checksum(&blob);
        if actual != header.blob_checksum {
            return Err(ChangelogError::ChecksumMismatch {
                index: header.index,
                expected: header.blob_checksum,
                actual,
            });
        }

        if entries.contains_key(&header.index) {
            return Err(ChangelogError::CorruptedData(format!(
                "duplicated index {} in segment {}",
                header.index,
                self.path.display()
            )));
        }

        Ok(Some(Record {
            header,
            blob: Bytes::from(blob),
        }))
    }
}
