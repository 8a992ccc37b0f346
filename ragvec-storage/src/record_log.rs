// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segmented Record Log
//!
//! Append-only log of opaque record frames, split into fixed-size segment
//! files. Every frame carries its own checksum so recovery can tell a torn
//! write from real corruption.
//!
//! ## File layout
//!
//! ```text
//! segment_<sequence:016x>.log
//!   [header: 32 bytes]
//!   [len: u32][lsn: u64][data: len bytes][crc32: u32]
//!   [len: u32][lsn: u64][data: len bytes][crc32: u32]
//!   ...
//! ```
//!
//! ## Recovery
//!
//! Segments are replayed in sequence order. A damaged frame at the end of
//! the newest segment is a torn append from a crash: the segment is
//! truncated back to the last good frame. Damage anywhere else is reported
//! as corruption.
//!
//! ## Rewrite
//!
//! `rewrite` replaces the whole log with a fresh set of frames. New
//! segments are written under a `.compacting` extension, synced, and only
//! then renamed into place before the old segments are removed; leftover
//! `.compacting` files from an interrupted rewrite are discarded on open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};

/// Default maximum segment size (64 MB)
pub const DEFAULT_SEGMENT_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Segment file header magic
const SEGMENT_MAGIC: u32 = 0x5256_4C47; // "RVLG"

/// Segment header version
const SEGMENT_VERSION: u16 = 1;

/// Segment header size
const SEGMENT_HEADER_SIZE: usize = 32;

/// Length prefix + LSN + trailing checksum
const FRAME_OVERHEAD: usize = 4 + 8 + 4;

/// Frames larger than this are treated as garbage during recovery
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const SEGMENT_EXT: &str = "log";
const COMPACTING_EXT: &str = "compacting";

/// Record log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Segment size that triggers rotation
    pub max_segment_size: u64,
    /// fsync after every append
    pub sync_on_write: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("records"),
            max_segment_size: DEFAULT_SEGMENT_MAX_SIZE,
            sync_on_write: true,
        }
    }
}

impl LogConfig {
    pub fn with_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

/// Header at the start of each segment file
#[derive(Debug, Clone, Copy)]
struct SegmentHeader {
    sequence: u64,
    first_lsn: u64,
    /// Unix millis
    created_at: u64,
}

impl SegmentHeader {
    fn new(sequence: u64, first_lsn: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            sequence,
            first_lsn,
            created_at,
        }
    }

    fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        // 6..8 flags, unused
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_lsn.to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if magic != SEGMENT_MAGIC || version != SEGMENT_VERSION {
            return None;
        }
        Some(Self {
            sequence: read_u64(&buf[8..16]),
            first_lsn: read_u64(&buf[16..24]),
            created_at: read_u64(&buf[24..32]),
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Metadata for one segment file
#[derive(Debug, Clone)]
struct SegmentMeta {
    sequence: u64,
    first_lsn: u64,
    path: PathBuf,
    size: u64,
}

/// Segment currently receiving appends
struct ActiveSegment {
    writer: BufWriter<File>,
    meta: SegmentMeta,
}

/// One replayed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: u64,
    pub data: Vec<u8>,
}

/// Log statistics
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub segment_count: usize,
    pub total_bytes: u64,
    pub next_lsn: u64,
}

/// Outcome of a full rewrite
#[derive(Debug, Clone, Default)]
pub struct RewriteStats {
    pub segments_removed: usize,
    pub segments_written: usize,
    pub frames_written: u64,
}

/// Segmented append-only log
pub struct RecordLog {
    config: LogConfig,
    active: Mutex<Option<ActiveSegment>>,
    next_lsn: AtomicU64,
    next_sequence: AtomicU64,
    segments: RwLock<BTreeMap<u64, SegmentMeta>>,
    /// Set when a failed append could not be rolled back
    poisoned: AtomicBool,
    #[cfg(test)]
    fail_next_write: AtomicBool,
}

impl RecordLog {
    /// Open the log, replaying every surviving frame through `apply` in
    /// append order.
    pub fn open<F>(config: LogConfig, mut apply: F) -> Result<Self>
    where
        F: FnMut(LogEntry) -> Result<()>,
    {
        fs::create_dir_all(&config.dir)?;
        remove_abandoned_rewrites(&config.dir)?;

        let discovered = discover_segments(&config.dir)?;
        let newest = discovered.keys().next_back().copied();

        let mut segments = BTreeMap::new();
        let mut next_lsn = 0u64;
        let mut replayed = 0u64;

        for (sequence, path) in discovered {
            let is_newest = Some(sequence) == newest;
            let meta = replay_segment(sequence, &path, is_newest, &mut |entry: LogEntry| {
                next_lsn = next_lsn.max(entry.lsn + 1);
                replayed += 1;
                apply(entry)
            })?;
            if let Some(meta) = meta {
                next_lsn = next_lsn.max(meta.first_lsn);
                segments.insert(meta.sequence, meta);
            }
        }

        let next_sequence = newest.map(|s| s + 1).unwrap_or(0);
        info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            frames = replayed,
            "Record log opened"
        );

        Ok(Self {
            config,
            active: Mutex::new(None),
            next_lsn: AtomicU64::new(next_lsn),
            next_sequence: AtomicU64::new(next_sequence),
            segments: RwLock::new(segments),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_write: AtomicBool::new(false),
        })
    }

    /// Append one frame; durable on return when `sync_on_write` is set.
    ///
    /// A failed append leaves no bytes behind: the active segment is cut
    /// back to its last complete frame before the error is returned.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StoreError::Poisoned);
        }
        let mut active = self.active.lock();

        let needs_rotation = active
            .as_ref()
            .map(|segment| segment.meta.size >= self.config.max_segment_size)
            .unwrap_or(false);
        if needs_rotation {
            self.seal_active(&mut active)?;
        }
        if active.is_none() {
            let segment = self.create_segment(SEGMENT_EXT)?;
            self.segments
                .write()
                .insert(segment.meta.sequence, segment.meta.clone());
            *active = Some(segment);
        }
        let segment = active.as_mut().ok_or(StoreError::Closed)?;

        let frame = encode_frame(self.next_lsn.load(Ordering::SeqCst), data);
        if let Err(err) = self.write_frame(segment, &frame) {
            warn!(
                sequence = segment.meta.sequence,
                size = segment.meta.size,
                error = %err,
                "Record log append failed, rolling back"
            );
            self.roll_back(&mut active);
            return Err(err);
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        segment.meta.size += frame.len() as u64;

        if let Some(meta) = self.segments.write().get_mut(&segment.meta.sequence) {
            meta.size = segment.meta.size;
        }

        Ok(lsn)
    }

    fn write_frame(&self, segment: &mut ActiveSegment, frame: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            // Half a frame reaches the file before the device gives up
            segment.writer.write_all(&frame[..frame.len() / 2])?;
            segment.writer.flush()?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        segment.writer.write_all(frame)?;
        segment.writer.flush()?;
        if self.config.sync_on_write {
            segment.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drop buffered bytes and cut the active segment back to its last
    /// complete frame. Poisons the log when that is not possible.
    fn roll_back(&self, active: &mut Option<ActiveSegment>) {
        let Some(ActiveSegment { writer, meta }) = active.take() else {
            return;
        };
        let (mut file, _unwritten) = writer.into_parts();
        match truncate_to(&mut file, meta.size) {
            Ok(()) => {
                *active = Some(ActiveSegment {
                    writer: BufWriter::new(file),
                    meta,
                });
            }
            Err(err) => {
                error!(
                    sequence = meta.sequence,
                    error = %err,
                    "Could not roll back record log segment; refusing further appends"
                );
                self.poisoned.store(true, Ordering::Release);
            }
        }
    }

    /// Replace the entire log contents with `frames`
    pub fn rewrite<I>(&self, frames: I) -> Result<RewriteStats>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut active = self.active.lock();
        self.seal_active(&mut active)?;

        let obsolete: Vec<SegmentMeta> = self.segments.read().values().cloned().collect();
        let mut written = Vec::new();
        let mut current: Option<ActiveSegment> = None;
        let mut frames_written = 0u64;

        for data in frames {
            let full = current
                .as_ref()
                .map(|segment| segment.meta.size >= self.config.max_segment_size)
                .unwrap_or(false);
            if full {
                if let Some(segment) = current.take() {
                    written.push(finish_segment(segment)?);
                }
            }
            if current.is_none() {
                current = Some(self.create_segment(COMPACTING_EXT)?);
            }
            let segment = current.as_mut().ok_or(StoreError::Closed)?;

            let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
            let frame = encode_frame(lsn, &data);
            segment.writer.write_all(&frame)?;
            segment.meta.size += frame.len() as u64;
            frames_written += 1;
        }
        if let Some(segment) = current.take() {
            written.push(finish_segment(segment)?);
        }

        let mut segments = self.segments.write();
        for mut meta in written.iter().cloned() {
            let live_path = meta.path.with_extension(SEGMENT_EXT);
            fs::rename(&meta.path, &live_path)?;
            meta.path = live_path;
            segments.insert(meta.sequence, meta);
        }
        for meta in &obsolete {
            segments.remove(&meta.sequence);
            if meta.path.exists() {
                fs::remove_file(&meta.path)?;
            }
        }

        let stats = RewriteStats {
            segments_removed: obsolete.len(),
            segments_written: written.len(),
            frames_written,
        };
        info!(
            removed = stats.segments_removed,
            written = stats.segments_written,
            frames = stats.frames_written,
            "Record log rewritten"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> LogStats {
        let segments = self.segments.read();
        LogStats {
            segment_count: segments.len(),
            total_bytes: segments.values().map(|s| s.size).sum(),
            next_lsn: self.next_lsn.load(Ordering::SeqCst),
        }
    }

    /// Flush and fsync the active segment
    pub fn flush(&self) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(segment) = active.as_mut() {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Seal the active segment; later appends open a new one
    pub fn shutdown(&self) -> Result<()> {
        let mut active = self.active.lock();
        self.seal_active(&mut active)
    }

    fn seal_active(&self, active: &mut Option<ActiveSegment>) -> Result<()> {
        if let Some(segment) = active.take() {
            let meta = finish_segment(segment)?;
            debug!(sequence = meta.sequence, size = meta.size, "Sealed record log segment");
            if let Some(existing) = self.segments.write().get_mut(&meta.sequence) {
                existing.size = meta.size;
            }
        }
        Ok(())
    }

    fn create_segment(&self, extension: &str) -> Result<ActiveSegment> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let first_lsn = self.next_lsn.load(Ordering::SeqCst);
        let path = self.config.dir.join(segment_file_name(sequence, extension));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&SegmentHeader::new(sequence, first_lsn).encode())?;

        Ok(ActiveSegment {
            writer,
            meta: SegmentMeta {
                sequence,
                first_lsn,
                path,
                size: SEGMENT_HEADER_SIZE as u64,
            },
        })
    }
}

fn segment_file_name(sequence: u64, extension: &str) -> String {
    format!("segment_{:016x}.{}", sequence, extension)
}

fn parse_segment_file_name(path: &Path, extension: &str) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(extension) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let hex = stem.strip_prefix("segment_")?;
    u64::from_str_radix(hex, 16).ok()
}

fn truncate_to(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.sync_all()?;
    file.seek(SeekFrom::Start(len))?;
    Ok(())
}

fn finish_segment(segment: ActiveSegment) -> Result<SegmentMeta> {
    let ActiveSegment { writer, meta } = segment;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(meta)
}

fn encode_frame(lsn: u64, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&lsn.to_le_bytes());
    frame.extend_from_slice(data);
    let checksum = crc32fast::hash(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

fn discover_segments(dir: &Path) -> Result<BTreeMap<u64, PathBuf>> {
    let mut found = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(sequence) = parse_segment_file_name(&path, SEGMENT_EXT) {
            found.insert(sequence, path);
        }
    }
    Ok(found)
}

fn remove_abandoned_rewrites(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if parse_segment_file_name(&path, COMPACTING_EXT).is_some() {
            warn!(path = %path.display(), "Removing segment from interrupted rewrite");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

enum Frame {
    Entry { entry: LogEntry, len: u64 },
    End,
    Torn(&'static str),
}

/// Fill `buf` as far as the reader allows; returns the bytes read
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_fully(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn("truncated frame length")),
    }

    let data_len = u32::from_le_bytes(len_buf) as usize;
    if data_len == 0 || data_len > MAX_FRAME_LEN {
        return Ok(Frame::Torn("invalid frame length"));
    }

    let mut body = vec![0u8; 8 + data_len + 4];
    if read_fully(reader, &mut body)? < body.len() {
        return Ok(Frame::Torn("truncated frame"));
    }

    let checksum_at = 8 + data_len;
    let stored = u32::from_le_bytes([
        body[checksum_at],
        body[checksum_at + 1],
        body[checksum_at + 2],
        body[checksum_at + 3],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_buf);
    hasher.update(&body[..checksum_at]);
    if hasher.finalize() != stored {
        return Ok(Frame::Torn("checksum mismatch"));
    }

    let lsn = read_u64(&body[..8]);
    body.truncate(checksum_at);
    let data = body.split_off(8);

    Ok(Frame::Entry {
        entry: LogEntry { lsn, data },
        len: (FRAME_OVERHEAD + data_len) as u64,
    })
}

/// Replay one segment. Returns `None` when a torn newest segment had no
/// usable header and was removed.
fn replay_segment(
    sequence: u64,
    path: &Path,
    is_newest: bool,
    apply: &mut dyn FnMut(LogEntry) -> Result<()>,
) -> Result<Option<SegmentMeta>> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header_buf = [0u8; SEGMENT_HEADER_SIZE];
    let header = if read_fully(&mut reader, &mut header_buf)? == SEGMENT_HEADER_SIZE {
        SegmentHeader::decode(&header_buf)
    } else {
        None
    };
    let header = match header {
        Some(header) if header.sequence == sequence => header,
        _ if is_newest => {
            warn!(sequence, "Discarding newest record log segment with a torn header");
            drop(reader);
            fs::remove_file(path)?;
            return Ok(None);
        }
        _ => {
            return Err(StoreError::Corruption {
                segment: sequence,
                offset: 0,
                reason: "invalid segment header".to_string(),
            });
        }
    };

    let mut offset = SEGMENT_HEADER_SIZE as u64;
    loop {
        match read_frame(&mut reader)? {
            Frame::End => break,
            Frame::Entry { entry, len } => {
                apply(entry)?;
                offset += len;
            }
            Frame::Torn(reason) if is_newest => {
                warn!(sequence, offset, reason, "Truncating torn tail of record log");
                drop(reader);
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                break;
            }
            Frame::Torn(reason) => {
                return Err(StoreError::Corruption {
                    segment: sequence,
                    offset,
                    reason: reason.to_string(),
                });
            }
        }
    }

    debug!(
        sequence,
        first_lsn = header.first_lsn,
        created_at = header.created_at,
        size = offset,
        "Replayed record log segment"
    );

    Ok(Some(SegmentMeta {
        sequence,
        first_lsn: header.first_lsn,
        path: path.to_path_buf(),
        size: offset,
    }))
}
