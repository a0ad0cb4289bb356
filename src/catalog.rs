//! Track metadata and directory scanning.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::bitstream::TrackStream;
use crate::error::{PlaybackError, Result};
use crate::wav;

/// Format assumed for MP3 tracks until the first decoded frame corrects it.
pub const PROVISIONAL_MP3_RATE: u32 = 44_100;
pub const PROVISIONAL_MP3_CHANNELS: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Wav,
    Mp3,
}

impl ContainerType {
    pub fn label(self) -> &'static str {
        match self {
            ContainerType::Wav => "WAV",
            ContainerType::Mp3 => "MP3",
        }
    }

    fn from_extension(path: &Path) -> Option<ContainerType> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("wav") {
            Some(ContainerType::Wav)
        } else if ext.eq_ignore_ascii_case("mp3") {
            Some(ContainerType::Mp3)
        } else {
            None
        }
    }
}

/// One playable unit, created during a scan pass.
///
/// Immutable afterwards except for the format fields, which the playback
/// loop corrects once through `Catalog::confirm_format` when real values are
/// observed from decoded MP3 frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub name: String,
    pub path: PathBuf,
    pub container: ContainerType,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub bits_per_sample: u16,
    /// Progress denominator: WAV `data` chunk size, MP3 whole-file size.
    pub payload_size: u64,
    /// Offset of the first payload byte (WAV); 0 for MP3.
    pub data_start_offset: u64,
    /// One-time transition: set once format values are known to be real
    /// rather than provisional.
    pub format_confirmed: bool,
}

impl Track {
    /// Name without its audio extension, for display.
    pub fn display_title(&self) -> &str {
        let lower = self.name.to_ascii_lowercase();
        if lower.ends_with(".wav") || lower.ends_with(".mp3") {
            &self.name[..self.name.len() - 4]
        } else {
            &self.name
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "{}, {} Hz, {} ch",
            self.container.label(),
            self.sample_rate_hz,
            self.channel_count
        )
    }

    /// Decoded PCM bytes per second of playback.
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate_hz * u32::from(self.channel_count) * u32::from(self.bits_per_sample / 8)
    }

    /// Total duration in seconds when knowable: exact for WAV, the
    /// first-frame-bitrate estimate for MP3 (`None` until a bitrate is
    /// known).
    pub fn total_seconds(&self, bitrate_kbps: u32) -> Option<u64> {
        match self.container {
            ContainerType::Wav => {
                let bps = u64::from(self.bytes_per_second());
                (bps > 0).then(|| self.payload_size / bps)
            }
            ContainerType::Mp3 => (bitrate_kbps > 0)
                .then(|| self.payload_size * 8 / (u64::from(bitrate_kbps) * 1000)),
        }
    }
}

/// Sorted collection of playable tracks.
#[derive(Debug, Default)]
pub struct Catalog {
    tracks: Vec<Track>,
}

impl Catalog {
    /// Scans one directory for `.wav`/`.mp3` files, parsing WAV headers
    /// eagerly. Unreadable or malformed files are skipped with a warning
    /// rather than carried as unplayable entries.
    pub fn scan_directory(dir: &Path) -> Catalog {
        let mut tracks = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read {}: {}", dir.display(), err);
                return Catalog::default();
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(container) = ContainerType::from_extension(&path) else {
                continue;
            };
            match scan_track(&path, container) {
                Ok(track) => tracks.push(track),
                Err(err) => warn!("skipping {}: {}", path.display(), err),
            }
        }
        tracks.sort_by(|a, b| {
            a.name
                .to_ascii_lowercase()
                .cmp(&b.name.to_ascii_lowercase())
        });
        info!("catalog: {} playable track(s)", tracks.len());
        Catalog { tracks }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.tracks.iter().position(|track| track.name == name)
    }

    /// Records the real format observed from decoded audio. Returns whether
    /// the stored values changed.
    pub(crate) fn confirm_format(
        &mut self,
        index: usize,
        sample_rate_hz: u32,
        channel_count: u16,
    ) -> bool {
        let Some(track) = self.tracks.get_mut(index) else {
            return false;
        };
        let changed =
            track.sample_rate_hz != sample_rate_hz || track.channel_count != channel_count;
        track.sample_rate_hz = sample_rate_hz;
        track.channel_count = channel_count;
        track.format_confirmed = true;
        changed
    }
}

fn scan_track(path: &Path, container: ContainerType) -> Result<Track> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(PlaybackError::InvalidFormat("unrepresentable file name"))?
        .to_string();
    match container {
        ContainerType::Wav => {
            let mut stream = TrackStream::open(path)?;
            let header = wav::parse(&mut stream)?;
            Ok(Track {
                name,
                path: path.to_path_buf(),
                container,
                sample_rate_hz: header.sample_rate_hz,
                channel_count: header.channel_count,
                bits_per_sample: header.bits_per_sample,
                payload_size: u64::from(header.data_size),
                data_start_offset: header.data_start_offset,
                format_confirmed: true,
            })
        }
        ContainerType::Mp3 => {
            // Real format is discovered from the first decoded frame.
            let file_size = std::fs::metadata(path)?.len();
            Ok(Track {
                name,
                path: path.to_path_buf(),
                container,
                sample_rate_hz: PROVISIONAL_MP3_RATE,
                channel_count: PROVISIONAL_MP3_CHANNELS,
                bits_per_sample: 16,
                payload_size: file_size,
                data_start_offset: 0,
                format_confirmed: false,
            })
        }
    }
}
