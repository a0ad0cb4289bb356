//! Event payloads published by the playback engine on its broadcast bus.
//!
//! The UI collaborator subscribes to these; the engine never touches display
//! state directly.

/// Coarse playback state visible to controllers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl PlayState {
    pub(crate) fn from_u8(value: u8) -> PlayState {
        match value {
            1 => PlayState::Playing,
            2 => PlayState::Paused,
            _ => PlayState::Stopped,
        }
    }
}

/// Throttled progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Payload consumption, clamped to 100.
    pub percent: u8,
    /// Elapsed playback time, `MM:SS`.
    pub elapsed: String,
    /// Remaining time, `-MM:SS`, or `--:--` while the total is unknown.
    pub remaining: String,
    /// Total duration, `MM:SS`, or `--:--` while unknown (MP3 before the
    /// first frame fixes a bitrate).
    pub total: String,
}

impl ProgressUpdate {
    pub(crate) fn new(percent: u8, elapsed_seconds: u64, total_seconds: Option<u64>) -> ProgressUpdate {
        let (remaining, total) = match total_seconds {
            Some(total) => (
                format!("-{}", format_mmss(total.saturating_sub(elapsed_seconds))),
                format_mmss(total),
            ),
            None => ("--:--".to_string(), "--:--".to_string()),
        };
        ProgressUpdate {
            percent: percent.min(100),
            elapsed: format_mmss(elapsed_seconds),
            remaining,
            total,
        }
    }
}

/// Formats whole seconds as `MM:SS`.
pub fn format_mmss(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Everything the engine tells the outside world.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// A track became the active one (play, load, or auto-advance).
    TrackChanged {
        index: usize,
        title: String,
        format_summary: String,
    },
    Progress(ProgressUpdate),
    /// Real format values observed from decoded audio replaced the track's
    /// provisional ones.
    FormatDiscovered {
        sample_rate_hz: u32,
        channel_count: u16,
        bitrate_kbps: u32,
    },
    StateChanged(PlayState),
    /// A track drained to its natural end.
    TrackFinished { index: usize },
    /// Human-readable terminal failure for the active operation.
    Error(String),
}
