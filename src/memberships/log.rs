//! Append-only membership commit log.
//!
//! Each committed transaction is written as a single checksummed frame, so a
//! tick's writes are either fully on disk or not at all.

use crate::error::{Result, StoreError};
use crate::types::{ConversationMembership, MembershipId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for a commit frame.
const FRAME_MAGIC: &[u8; 4] = b"CMF\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Frame header size: magic + version + tick + payload length.
const FRAME_HEADER_SIZE: u64 = 4 + 1 + 8 + 4;

/// Frame trailer size: CRC32 of the payload.
const FRAME_TRAILER_SIZE: u64 = 4;

/// A single write inside a commit frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Insert or replace a row.
    Put(ConversationMembership),
    /// Remove a row.
    Delete(MembershipId),
}

/// One committed transaction read back from the log.
#[derive(Clone, Debug)]
pub struct CommitFrame {
    pub tick: u64,
    pub ops: Vec<LogOp>,
}

struct LogFile {
    file: File,
    size: u64,
    frames: u64,
    next_tick: u64,
}

/// Append-only commit log.
pub struct MembershipLog {
    /// Path to the log file.
    path: PathBuf,

    /// Open handle plus write position.
    inner: Mutex<LogFile>,

    /// fsync after every appended frame.
    sync_every_commit: bool,
}

impl MembershipLog {
    /// Open or create a log, returning it with every intact frame in order.
    ///
    /// A torn final frame (shorter than its declared length) is truncated.
    pub fn open(
        path: impl AsRef<Path>,
        sync_every_commit: bool,
    ) -> Result<(Self, Vec<CommitFrame>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (frames, valid_end) = Self::read_frames(&mut file, len)?;

        if valid_end < len {
            warn!(
                path = %path.display(),
                valid_end,
                len,
                "truncating torn commit frame at end of membership log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let next_tick = frames.last().map(|f| f.tick + 1).unwrap_or(1);

        let log = Self {
            path,
            inner: Mutex::new(LogFile {
                file,
                size: valid_end,
                frames: frames.len() as u64,
                next_tick,
            }),
            sync_every_commit,
        };

        Ok((log, frames))
    }

    /// Append one commit frame. Returns the frame's tick sequence.
    pub fn append(&self, ops: &[LogOp]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick;

        let bytes = Self::encode_frame(tick, ops)?;

        let offset = inner.size;
        if let Err(e) = write_frame(&mut inner.file, offset, &bytes, self.sync_every_commit) {
            warn!(
                path = %self.path.display(),
                tick,
                error = %e,
                "failed to append commit frame to membership log"
            );
            return Err(e.into());
        }

        inner.size = offset + bytes.len() as u64;
        inner.frames += 1;
        inner.next_tick = tick + 1;

        Ok(tick)
    }

    /// Replace the whole log with a single frame holding `ops`.
    ///
    /// The new log is written beside the old one and renamed over it.
    pub fn rewrite(&self, ops: &[LogOp]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick;

        let bytes = Self::encode_frame(tick, ops)?;

        let tmp_path = self.path.with_extension("log.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.size = bytes.len() as u64;
        inner.frames = 1;
        inner.next_tick = tick + 1;

        Ok(tick)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    /// Get current file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Number of frames currently in the log.
    pub fn frame_count(&self) -> u64 {
        self.inner.lock().frames
    }

    fn encode_frame(tick: u64, ops: &[LogOp]) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec_named(ops)?;
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            StoreError::Serialization(format!("commit frame too large: {} bytes", payload.len()))
        })?;

        let mut bytes =
            Vec::with_capacity((FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as usize + payload.len());
        bytes.extend_from_slice(FRAME_MAGIC);
        bytes.push(LOG_VERSION);
        bytes.extend_from_slice(&tick.to_le_bytes());
        bytes.extend_from_slice(&payload_len.to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        Ok(bytes)
    }

    /// Read frames from the start of the file.
    ///
    /// Returns the frames and the offset just past the last intact frame.
    fn read_frames(file: &mut File, len: u64) -> Result<(Vec<CommitFrame>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut frames = Vec::new();
        let mut offset = 0u64;

        while offset < len {
            if len - offset < FRAME_HEADER_SIZE {
                break;
            }

            // Magic
            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != FRAME_MAGIC {
                return Err(StoreError::Corruption(format!(
                    "Invalid frame magic at offset {}",
                    offset
                )));
            }

            // Version
            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != LOG_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported log version: {}",
                    version[0]
                )));
            }

            // Tick
            let mut tick_bytes = [0u8; 8];
            reader.read_exact(&mut tick_bytes)?;
            let tick = u64::from_le_bytes(tick_bytes);

            // Payload length
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let payload_len = u32::from_le_bytes(len_bytes) as u64;

            let frame_end = offset + FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE;
            if frame_end > len {
                break;
            }

            let mut payload = vec![0u8; payload_len as usize];
            reader.read_exact(&mut payload)?;

            let mut crc_bytes = [0u8; 4];
            reader.read_exact(&mut crc_bytes)?;
            let expected = u32::from_le_bytes(crc_bytes);
            let got = crc32fast::hash(&payload);
            if expected != got {
                return Err(StoreError::ChecksumMismatch { expected, got });
            }

            let ops: Vec<LogOp> = rmp_serde::from_slice(&payload)?;
            frames.push(CommitFrame { tick, ops });
            offset = frame_end;
        }

        Ok((frames, offset))
    }
}

/// File operations a frame write needs.
trait FrameSink: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl FrameSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Write one encoded frame at `offset`. On failure the sink is cut back to
/// `offset` so no partial frame is left behind a later append.
fn write_frame<S: FrameSink>(
    sink: &mut S,
    offset: u64,
    bytes: &[u8],
    sync: bool,
) -> io::Result<()> {
    let result = write_at(sink, offset, bytes, sync);
    if result.is_err() {
        let _ = sink.truncate(offset);
    }
    result
}

fn write_at<S: FrameSink>(sink: &mut S, offset: u64, bytes: &[u8], sync: bool) -> io::Result<()> {
    sink.seek(SeekFrom::Start(offset))?;
    sink.write_all(bytes)?;
    sink.flush()?;
    if sync {
        sink.sync()?;
    }
    Ok(())
}
