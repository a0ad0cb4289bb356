//! PCM sink abstraction consumed by the playback loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

/// Output format requested from a sink.
///
/// The engine always asks for 16-bit and a stereo slot layout, duplicating
/// mono content itself; sinks do not upmix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub bits_per_sample: u16,
}

impl SinkFormat {
    pub fn stereo_16(sample_rate_hz: u32) -> SinkFormat {
        SinkFormat {
            sample_rate_hz,
            channel_count: 2,
            bits_per_sample: 16,
        }
    }
}

/// A hardware (or captured) PCM output.
pub trait PcmSink: Send {
    /// Applies an output format. Implementations may rebuild their output
    /// path; callers disable first when audible artifacts matter.
    fn configure(&mut self, format: SinkFormat) -> Result<()>;

    fn enable(&mut self) -> Result<()>;

    fn disable(&mut self);

    /// Blocks until the sink accepts the interleaved samples or the timeout
    /// elapses. Returns PCM bytes accepted; 0 means nothing was taken.
    fn write(&mut self, pcm: &[i16], timeout: Option<Duration>) -> usize;
}

/// Shared sink handle. The lock is never contended: the controller only
/// touches the sink while no loop execution is alive (the stop handshake
/// guarantees it), and the loop is the sole user while playing.
pub type SharedSink = Arc<Mutex<Box<dyn PcmSink>>>;

pub fn shared(sink: Box<dyn PcmSink>) -> SharedSink {
    Arc::new(Mutex::new(sink))
}
