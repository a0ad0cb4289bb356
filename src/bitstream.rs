//! Buffered, seekable byte source over a track file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{PlaybackError, Result};

/// Default read-ahead capacity, sized for removable-storage latency.
pub const DEFAULT_READ_AHEAD: usize = 16 * 1024;

/// A track's bytes behind a single large read-ahead buffer.
///
/// Exactly one stream exists per playback session and the loop owns it
/// exclusively while playing.
pub struct TrackStream {
    file: File,
    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    /// Logical offset of the next byte handed to the caller.
    position: u64,
    file_len: u64,
}

impl TrackStream {
    pub fn open(path: &Path) -> Result<TrackStream> {
        TrackStream::open_with_read_ahead(path, DEFAULT_READ_AHEAD)
    }

    pub fn open_with_read_ahead(path: &Path, capacity: usize) -> Result<TrackStream> {
        let file = File::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => PlaybackError::NotFound(path.display().to_string()),
            _ => PlaybackError::Io(err),
        })?;
        let file_len = file.metadata()?.len();
        let capacity = capacity.max(512);
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| PlaybackError::OutOfMemory(capacity))?;
        buf.resize(capacity, 0);
        Ok(TrackStream {
            file,
            buf,
            buf_pos: 0,
            buf_len: 0,
            position: 0,
            file_len,
        })
    }

    /// Reads up to `dst.len()` bytes. 0 signals end of file, not an error.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        while written < dst.len() {
            if self.buf_pos == self.buf_len && !self.refill()? {
                break;
            }
            let available = self.buf_len - self.buf_pos;
            let take = available.min(dst.len() - written);
            dst[written..written + take]
                .copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + take]);
            self.buf_pos += take;
            written += take;
        }
        self.position += written as u64;
        Ok(written)
    }

    fn refill(&mut self) -> Result<bool> {
        self.buf_pos = 0;
        self.buf_len = self.file.read(&mut self.buf)?;
        Ok(self.buf_len > 0)
    }

    /// Repositions to an absolute byte offset, discarding the read-ahead
    /// buffer.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| PlaybackError::SeekFailed(offset))?;
        self.buf_pos = 0;
        self.buf_len = 0;
        self.position = offset;
        Ok(())
    }

    /// Logical offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.file_len
    }
}
