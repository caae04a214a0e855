//! Changelog manager: directory scan, crash recovery, rotation, and the
//! public append/overwrite/compact/read operations
//!
//! The changelog is single-threaded by contract: exactly one actor calls
//! into it at a time and callers serialize their own access, so there is no
//! internal locking. All I/O is synchronous; `append` with `sync` blocks
//! until the record is durable.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error, info};

use crate::entry::LogEntry;
use crate::error::{ChangelogError, ChangelogResult};
use crate::record::Record;
use crate::segment::{ReadResult, SegmentDescriptor, SegmentReader, SegmentWriter, WriteMode};

/// Changelog configuration
#[derive(Debug, Clone)]
pub struct ChangelogConfig {
    /// Directory for segment files, created if missing
    pub dir: PathBuf,
    /// Records per segment; also the index range width reserved per segment
    pub rotate_interval: u64,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("changelog"),
            rotate_interval: 100_000,
        }
    }
}

/// Persistent segmented changelog backing a Raft consensus module
///
/// Stores a contiguous, strictly increasing sequence of log entries across
/// rotated segment files, supports leader-driven suffix overwrite and
/// prefix compaction, and recovers across crashes by truncating torn tails.
///
/// A new instance must be initialized with [`recover`](Changelog::recover)
/// before entries can be written.
pub struct Changelog {
    dir: PathBuf,
    rotate_interval: u64,
    /// Known segments keyed by their first reserved index
    segments: BTreeMap<u64, SegmentDescriptor>,
    /// Live entries keyed by log index
    entries: BTreeMap<u64, LogEntry>,
    /// Byte offset of each live entry's record within its segment file
    offsets: BTreeMap<u64, u64>,
    /// Smallest live index; moves forward on compaction
    start_index: u64,
    current_writer: Option<SegmentWriter>,
}

impl Changelog {
    /// Open a changelog over `config.dir`, creating the directory if
    /// missing and scanning it for existing segments
    ///
    /// No files are opened for writing here; call
    /// [`recover`](Changelog::recover) to replay segments and position the
    /// writer.
    pub fn new(config: ChangelogConfig) -> ChangelogResult<Self> {
        if config.rotate_interval == 0 {
            return Err(ChangelogError::LogicalError(
                "rotate_interval must be at least 1".to_string(),
            ));
        }

        fs::create_dir_all(&config.dir)?;

        let mut segments = BTreeMap::new();
        for dir_entry in fs::read_dir(&config.dir)? {
            let descriptor = SegmentDescriptor::parse(&dir_entry?.path())?;
            segments.insert(descriptor.from_log_idx, descriptor);
        }

        validate_segment_ranges(&segments)?;

        Ok(Self {
            dir: config.dir,
            rotate_interval: config.rotate_interval,
            segments,
            entries: BTreeMap::new(),
            offsets: BTreeMap::new(),
            start_index: 1,
            current_writer: None,
        })
    }

    /// Replay segments from `from_log_idx` (or 1 if 0), discard segments
    /// past a crash tear, and position the writer to continue appending
    ///
    /// A segment holding fewer records than its declared range is treated
    /// as the tail: every later segment is deleted, and if the short
    /// segment ended in a torn record its file is truncated to the last
    /// intact one. Short-segment detection compares records read against
    /// the declared range, so `from_log_idx` should equal some segment's
    /// first index, or 1.
    pub fn recover(&mut self, from_log_idx: u64) -> ChangelogResult<()> {
        self.start_index = if from_log_idx == 0 { 1 } else { from_log_idx };

        let mut total_read = 0u64;
        let mut last_capacity = 0u64;
        let mut last_result = ReadResult::default();
        let mut incomplete_from = None;

        for descriptor in self.segments.values() {
            last_capacity = descriptor.capacity();
            if descriptor.to_log_idx < from_log_idx {
                continue;
            }

            let mut reader = SegmentReader::open(&descriptor.path)?;
            last_result = reader.read_segment(&mut self.entries, from_log_idx, &mut self.offsets);
            total_read += last_result.entries_read;

            // Short segment: either the genuine tail or a crash tore it.
            // Either way nothing after it can be vouched for.
            if last_result.entries_read < last_capacity {
                incomplete_from = Some(descriptor.from_log_idx);
                break;
            }
        }

        if let Some(from) = incomplete_from {
            let stale: Vec<u64> = self.segments.range(from + 1..).map(|(k, _)| *k).collect();
            for key in stale {
                if let Some(descriptor) = self.segments.remove(&key) {
                    debug!(path = %descriptor.path.display(), "removing segment past crash tear");
                    fs::remove_file(&descriptor.path)?;
                }
            }
        }

        let short_tail = if last_result.entries_read < last_capacity {
            self.segments.values().next_back().cloned()
        } else {
            None
        };
        match short_tail {
            Some(descriptor) => {
                let mut writer = SegmentWriter::open(
                    &descriptor.path,
                    WriteMode::Append,
                    descriptor.from_log_idx,
                )?;
                writer.set_entries_written(last_result.entries_read);
                if last_result.error {
                    writer.truncate_to(last_result.last_position)?;
                }
                self.current_writer = Some(writer);
            }
            None => self.rotate(self.start_index + total_read)?,
        }

        info!(
            dir = %self.dir.display(),
            start_index = self.start_index,
            next_index = self.next_index(),
            "changelog recovered"
        );
        Ok(())
    }

    /// Append `entry` at `index`
    ///
    /// The caller keeps its entry; the changelog stores its own clone. With
    /// `sync`, the record is durable before this returns. Fails with a
    /// logical error if the changelog was not recovered or `index` is
    /// already present.
    pub fn append(&mut self, index: u64, entry: &LogEntry, sync: bool) -> ChangelogResult<()> {
        let entries_written = match &self.current_writer {
            Some(writer) => writer.entries_written(),
            None => {
                return Err(ChangelogError::LogicalError(
                    "changelog must be recovered before appending records".to_string(),
                ))
            }
        };

        if self.entries.is_empty() {
            self.start_index = index;
        }

        if entries_written == self.rotate_interval {
            self.rotate(index)?;
        }

        let record = Record::build(index, entry);
        let writer = self
            .current_writer
            .as_mut()
            .ok_or_else(|| ChangelogError::LogicalError("no open segment writer".to_string()))?;
        let offset = writer.append_record(&record, sync)?;

        match self.offsets.entry(index) {
            MapEntry::Occupied(_) => {
                return Err(ChangelogError::LogicalError(format!(
                    "record with index {index} already exists"
                )))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(offset);
            }
        }
        self.entries.insert(index, entry.clone());
        Ok(())
    }

    /// Overwrite the suffix `[index, last_index]` with `entry` at `index`
    ///
    /// Truncates the containing segment to the old record's offset, deletes
    /// every later segment when the overwrite crosses segment boundaries,
    /// and appends the new entry in their place. `index` must be live.
    pub fn write_at(&mut self, index: u64, entry: &LogEntry, sync: bool) -> ChangelogResult<()> {
        let truncate_offset = match self.offsets.get(&index) {
            Some(offset) => *offset,
            None => {
                return Err(ChangelogError::LogicalError(format!(
                    "cannot write at index {index} because changelog does not contain it"
                )))
            }
        };

        let writer_start = match &self.current_writer {
            Some(writer) => writer.start_index(),
            None => {
                return Err(ChangelogError::LogicalError(
                    "changelog must be recovered before writing records".to_string(),
                ))
            }
        };

        let need_rollback = index < writer_start;
        if need_rollback {
            // The segment whose range contains `index`; an exact match on
            // the first index selects that segment, not the one before it.
            let descriptor = self
                .segments
                .range(..=index)
                .next_back()
                .map(|(_, descriptor)| descriptor.clone())
                .ok_or_else(|| {
                    ChangelogError::LogicalError(format!("no segment contains index {index}"))
                })?;

            let mut writer =
                SegmentWriter::open(&descriptor.path, WriteMode::Append, descriptor.from_log_idx)?;
            writer.set_entries_written(descriptor.capacity());
            self.current_writer = Some(writer);
        }

        if let Some(writer) = self.current_writer.as_mut() {
            writer.truncate_to(truncate_offset)?;
        }

        if need_rollback {
            let stale: Vec<u64> = self.segments.range(index + 1..).map(|(k, _)| *k).collect();
            for key in stale {
                if let Some(descriptor) = self.segments.remove(&key) {
                    debug!(path = %descriptor.path.display(), index, "removing overwritten segment");
                    fs::remove_file(&descriptor.path)?;
                }
            }
        }

        // Roll back the in-memory state.
        let dropped: Vec<u64> = self.entries.range(index..).map(|(k, _)| *k).collect();
        for key in &dropped {
            self.entries.remove(key);
            self.offsets.remove(key);
        }
        if let Some(writer) = self.current_writer.as_mut() {
            let remaining = writer
                .entries_written()
                .saturating_sub(dropped.len() as u64);
            writer.set_entries_written(remaining);
        }

        self.append(index, entry, sync)
    }

    /// Drop every whole segment whose range lies at or below
    /// `up_to_log_idx`, along with the in-memory entries it covered
    ///
    /// Segments are never split: one is retained entire until every one of
    /// its indices is eligible.
    pub fn compact(&mut self, up_to_log_idx: u64) -> ChangelogResult<()> {
        let eligible: Vec<u64> = self
            .segments
            .values()
            .take_while(|descriptor| descriptor.to_log_idx <= up_to_log_idx)
            .map(|descriptor| descriptor.from_log_idx)
            .collect();

        for key in eligible {
            if let Some(descriptor) = self.segments.remove(&key) {
                for idx in descriptor.from_log_idx..=descriptor.to_log_idx {
                    if self.offsets.remove(&idx).is_none() {
                        break;
                    }
                }
                debug!(path = %descriptor.path.display(), "removing compacted segment");
                fs::remove_file(&descriptor.path)?;
            }
        }

        self.entries = self.entries.split_off(&(up_to_log_idx + 1));
        self.start_index = up_to_log_idx + 1;
        Ok(())
    }

    /// Clones of the entries in `[start, end)`, with `None` for indices
    /// outside the live range
    pub fn entries_between(&self, start: u64, end: u64) -> Vec<Option<LogEntry>> {
        (start..end).map(|idx| self.entry_at(idx)).collect()
    }

    /// A clone of the entry at `index`, if live
    pub fn entry_at(&self, index: u64) -> Option<LogEntry> {
        self.entries.get(&index).cloned()
    }

    /// A clone of the last live entry, or the term-0 sentinel when the log
    /// is empty
    pub fn last_entry(&self) -> LogEntry {
        self.entry_at(self.next_index() - 1)
            .unwrap_or_else(LogEntry::sentinel)
    }

    /// The index the next appended entry should take
    pub fn next_index(&self) -> u64 {
        self.start_index + self.entries.len() as u64
    }

    /// The smallest live index
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Serialize `count` entries starting at `index` into a transfer buffer
    ///
    /// Layout: entry count (i32 LE), then per entry its serialized size
    /// (i32 LE) followed by the bytes. Fails if any index is missing.
    pub fn serialize_batch(&self, index: u64, count: u32) -> ChangelogResult<Bytes> {
        let mut serialized = Vec::with_capacity(count as usize);
        let mut total_size = 0usize;
        for idx in index..index + count as u64 {
            let entry = self.entries.get(&idx).ok_or_else(|| {
                ChangelogError::LogicalError(format!("don't have log entry {idx}"))
            })?;
            let buf = entry.serialize();
            total_size += buf.len();
            serialized.push(buf);
        }

        let mut out = BytesMut::with_capacity(4 + serialized.len() * 4 + total_size);
        out.put_i32_le(serialized.len() as i32);
        for buf in &serialized {
            out.put_i32_le(buf.len() as i32);
            out.put_slice(buf);
        }
        Ok(out.freeze())
    }

    /// Ingest a transfer buffer produced by
    /// [`serialize_batch`](Changelog::serialize_batch), placing its entries
    /// at consecutive indices starting at `base_index`
    ///
    /// If the first entry's index is already live the batch is a conflict
    /// resolution: that entry overwrites the suffix via
    /// [`write_at`](Changelog::write_at) and the rest append after it.
    pub fn apply_serialized_batch(
        &mut self,
        base_index: u64,
        buffer: &[u8],
        sync: bool,
    ) -> ChangelogResult<()> {
        let mut buf = buffer;
        if buf.remaining() < 4 {
            return Err(truncated_batch(buffer.len()));
        }
        let count = buf.get_i32_le();

        for i in 0..count {
            if buf.remaining() < 4 {
                return Err(truncated_batch(buffer.len()));
            }
            let size = buf.get_i32_le() as usize;
            if buf.remaining() < size {
                return Err(truncated_batch(buffer.len()));
            }
            let entry = LogEntry::deserialize(&buf[..size])?;
            buf.advance(size);

            let cur_idx = base_index + i as u64;
            if i == 0 && self.entries.contains_key(&cur_idx) {
                self.write_at(cur_idx, &entry, sync)?;
            } else {
                self.append(cur_idx, &entry, sync)?;
            }
        }
        Ok(())
    }

    /// Fsync the current segment
    pub fn flush(&mut self) -> ChangelogResult<()> {
        if let Some(writer) = self.current_writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush pending writes and release the writer
    ///
    /// Shutdown is infallible: flush failures are logged and swallowed.
    pub fn close(&mut self) {
        if let Some(writer) = self.current_writer.as_mut() {
            if let Err(err) = writer.flush() {
                error!(error = %err, "failed to flush changelog on close");
            }
        }
        self.current_writer = None;
    }

    /// Flush the current writer and rotate to a fresh segment reserved for
    /// `[new_start, new_start + rotate_interval)`
    fn rotate(&mut self, new_start: u64) -> ChangelogResult<()> {
        if let Some(writer) = self.current_writer.as_mut() {
            writer.flush()?;
        }

        let descriptor = SegmentDescriptor::create(
            &self.dir,
            new_start,
            new_start + self.rotate_interval - 1,
        );
        debug!(path = %descriptor.path.display(), "rotating to new segment");

        self.current_writer = Some(SegmentWriter::open(
            &descriptor.path,
            WriteMode::Rewrite,
            new_start,
        )?);
        self.segments.insert(new_start, descriptor);
        Ok(())
    }
}

impl Drop for Changelog {
    fn drop(&mut self) {
        self.close();
    }
}

fn truncated_batch(len: usize) -> ChangelogError {
    ChangelogError::CorruptedData(format!("serialized batch of {len} bytes is truncated"))
}

/// Reject directories whose segment filenames declare inverted or
/// overlapping index ranges
fn validate_segment_ranges(
    segments: &BTreeMap<u64, SegmentDescriptor>,
) -> ChangelogResult<()> {
    let mut previous: Option<&SegmentDescriptor> = None;
    for descriptor in segments.values() {
        if descriptor.to_log_idx < descriptor.from_log_idx {
            return Err(ChangelogError::CorruptedData(format!(
                "segment {} declares an inverted index range",
                descriptor.path.display()
            )));
        }
        if let Some(previous) = previous {
            if descriptor.from_log_idx <= previous.to_log_idx {
                return Err(ChangelogError::CorruptedData(format!(
                    "segments {} and {} declare overlapping index ranges",
                    previous.path.display(),
                    descriptor.path.display()
                )));
            }
        }
        previous = Some(descriptor);
    }
    Ok(())
}
