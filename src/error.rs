//! Error taxonomy for the playback engine.
//!
//! Nothing in this crate propagates an error across the controller/loop
//! boundary; failures end as state transitions plus a published error string.
//! These variants classify what went wrong on the way there.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlaybackError>;

#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The named track is missing from the catalog or from disk.
    #[error("track not found: {0}")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Repositioning the byte stream failed.
    #[error("seek to byte offset {0} failed")]
    SeekFailed(u64),

    /// Malformed container data or an unsupported encoding. The track is
    /// unplayable; never defaulted.
    #[error("invalid audio container: {0}")]
    InvalidFormat(&'static str),

    /// A working buffer could not be allocated. Fatal to starting or
    /// continuing playback of the affected track only.
    #[error("failed to allocate a {0}-byte working buffer")]
    OutOfMemory(usize),

    #[error("audio sink error: {0}")]
    Sink(String),
}
