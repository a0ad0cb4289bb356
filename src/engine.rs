//! The playback loop: the real-time producer that drives decode and the
//! hardware sink.
//!
//! One loop execution context exists at a time, on its own thread. It reads
//! shared control flags at the top of every iteration, decodes one unit of
//! audio (a WAV buffer or an MP3 frame), applies volume, duplicates mono
//! into the stereo-shaped staging buffer, and blocks on the sink write.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::bitstream::TrackStream;
use crate::catalog::{Catalog, ContainerType, Track};
use crate::error::{PlaybackError, Result};
use crate::mp3::{FrameInfo, Mp3Step, Mp3Stream};
use crate::protocol::{PlayState, PlaybackEvent, ProgressUpdate};
use crate::session::PlaybackSession;
use crate::sink::{SharedSink, SinkFormat};
use crate::wav;

/// One unit of WAV audio read per iteration.
pub(crate) const WAV_UNIT_BYTES: usize = 8 * 1024;

/// Poll cadence while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Progress publication cadence (~2 per second).
const PROGRESS_PERIOD: Duration = Duration::from_millis(500);

/// Upper bound on one blocking write slice. A full unit is never abandoned;
/// the loop re-checks its cancellation flag between slices, which bounds
/// stop latency without putting a ceiling on normal writes.
const WRITE_SLICE_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive fruitless write rounds before the sink is considered done
/// accepting output for this track.
const STALLED_WRITE_LIMIT: u32 = 8;

type ProgressLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Container-specific decode state.
enum DecodeState {
    Wav { unit: Vec<u8> },
    Mp3(Mp3Stream),
}

/// Everything the loop owns for the track it is playing.
pub(crate) struct ActiveTrack {
    index: usize,
    /// Working copy; the shared catalog is updated on format discovery.
    track: Track,
    stream: TrackStream,
    decode: DecodeState,
    /// Decoded PCM bytes emitted so far, source-shaped (before stereo
    /// duplication). Drives the elapsed-time display.
    pcm_emitted: u64,
}

impl ActiveTrack {
    pub(crate) fn track(&self) -> &Track {
        &self.track
    }

    pub(crate) fn sink_format(&self) -> SinkFormat {
        SinkFormat::stereo_16(self.track.sample_rate_hz)
    }
}

/// Opens a catalog entry and prepares its decode state.
///
/// WAV headers are re-parsed here so stale scan results never drive
/// playback; any allocation failure aborts the whole start.
pub(crate) fn open_track(
    catalog: &Arc<Mutex<Catalog>>,
    index: usize,
    read_ahead: usize,
) -> Result<ActiveTrack> {
    let mut track = {
        let catalog = catalog.lock().expect("catalog lock poisoned");
        catalog
            .get(index)
            .cloned()
            .ok_or_else(|| PlaybackError::NotFound(format!("catalog index {index}")))?
    };
    let mut stream = TrackStream::open_with_read_ahead(&track.path, read_ahead)?;
    let decode = match track.container {
        ContainerType::Wav => {
            let header = wav::parse(&mut stream)?;
            track.sample_rate_hz = header.sample_rate_hz;
            track.channel_count = header.channel_count;
            track.bits_per_sample = header.bits_per_sample;
            track.payload_size = u64::from(header.data_size);
            track.data_start_offset = header.data_start_offset;
            let mut unit = Vec::new();
            unit.try_reserve_exact(WAV_UNIT_BYTES)
                .map_err(|_| PlaybackError::OutOfMemory(WAV_UNIT_BYTES))?;
            unit.resize(WAV_UNIT_BYTES, 0);
            DecodeState::Wav { unit }
        }
        ContainerType::Mp3 => {
            // The progress denominator is the file size as it exists now,
            // not as it was at scan time.
            track.payload_size = stream.len();
            DecodeState::Mp3(Mp3Stream::new()?)
        }
    };
    Ok(ActiveTrack {
        index,
        track,
        stream,
        decode,
        pcm_emitted: 0,
    })
}

/// Scales one 16-bit sample by an integer volume on the 0-100 scale.
/// Identity at 100 and above; truncating integer scale below.
pub(crate) fn scale_sample(sample: i16, volume: u32) -> i16 {
    if volume >= 100 {
        sample
    } else {
        (i32::from(sample) * volume as i32 / 100) as i16
    }
}

/// What one iteration's decode-and-write produced.
enum UnitOutcome {
    /// One unit of PCM was decoded and written.
    Wrote,
    /// A recognized-but-undecodable frame or a resync byte was consumed; no
    /// output, not end of track.
    NoOutput,
    EndOfTrack,
}

pub(crate) struct PlaybackLoop {
    session: Arc<PlaybackSession>,
    catalog: Arc<Mutex<Catalog>>,
    sink: SharedSink,
    events: Sender<PlaybackEvent>,
    /// Stereo-shaped write buffer.
    staging: Vec<i16>,
    progress: ProgressLimiter,
    /// Format the sink currently runs; reconfiguration is skipped when the
    /// requested format is identical, avoiding audible artifacts.
    sink_format: SinkFormat,
    read_ahead: usize,
}

impl PlaybackLoop {
    pub(crate) fn new(
        session: Arc<PlaybackSession>,
        catalog: Arc<Mutex<Catalog>>,
        sink: SharedSink,
        events: Sender<PlaybackEvent>,
        sink_format: SinkFormat,
        read_ahead: usize,
    ) -> Result<PlaybackLoop> {
        let staging_capacity = WAV_UNIT_BYTES; // samples after mono duplication
        let mut staging = Vec::new();
        staging
            .try_reserve_exact(staging_capacity)
            .map_err(|_| PlaybackError::OutOfMemory(staging_capacity * 2))?;
        let progress = RateLimiter::direct(
            Quota::with_period(PROGRESS_PERIOD).expect("progress period is non-zero"),
        );
        Ok(PlaybackLoop {
            session,
            catalog,
            sink,
            events,
            staging,
            progress,
            sink_format,
            read_ahead,
        })
    }

    /// Runs until the track (and, with `continue_to_next`, its successors)
    /// drains or `keep_running` is cleared.
    pub(crate) fn run(mut self, active: ActiveTrack) {
        self.session.set_loop_active(true);
        self.drive(active);
        // All streams are closed once drive returns; only then acknowledge
        // termination, since stop() may immediately reopen the sink.
        self.session.set_state(PlayState::Stopped);
        self.session.set_loop_active(false);
        let _ = self
            .events
            .send(PlaybackEvent::StateChanged(PlayState::Stopped));
        debug!("playback loop exited");
    }

    fn drive(&mut self, mut active: ActiveTrack) {
        self.announce_track(&active);
        loop {
            if !self.session.keep_running() {
                break;
            }
            if self.session.state() == PlayState::Paused {
                thread::sleep(PAUSE_POLL);
                continue;
            }
            if let Some(target) = self.session.take_pending_seek() {
                if let Err(err) = self.apply_seek(&mut active, target) {
                    warn!("seek to byte {} failed: {}", target, err);
                }
            }
            let outcome = match self.play_one_unit(&mut active) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Mid-stream trouble ends the track like a natural EOF.
                    warn!("playback of '{}' aborted: {}", active.track.name, err);
                    let _ = self.events.send(PlaybackEvent::Error(err.to_string()));
                    UnitOutcome::EndOfTrack
                }
            };
            match outcome {
                UnitOutcome::Wrote => self.publish_progress(&active, false),
                UnitOutcome::NoOutput => {}
                UnitOutcome::EndOfTrack => {
                    info!("finished playing '{}'", active.track.name);
                    self.publish_progress(&active, true);
                    let _ = self.events.send(PlaybackEvent::TrackFinished {
                        index: active.index,
                    });
                    if self.session.continue_to_next() {
                        match self.advance(active) {
                            Some(next) => {
                                active = next;
                                continue;
                            }
                            None => break,
                        }
                    }
                    break;
                }
            }
        }
    }

    fn apply_seek(&mut self, active: &mut ActiveTrack, target: u64) -> Result<()> {
        match &mut active.decode {
            DecodeState::Wav { .. } => {
                active.stream.seek(active.track.data_start_offset + target)?;
                active.pcm_emitted = target;
                debug!("seeked to payload byte {}", target);
            }
            DecodeState::Mp3(mp3) => {
                active.stream.seek(target)?;
                // A byte-accurate seek inside a compressed stream is
                // approximate; drop all decode continuity.
                mp3.reset();
                active.pcm_emitted = estimate_mp3_cursor(
                    target,
                    active.track.payload_size,
                    mp3.bitrate_kbps(),
                    active.track.bytes_per_second(),
                );
                debug!("seeked to raw byte {} (cursor estimate {})", target, active.pcm_emitted);
            }
        }
        self.session.set_byte_cursor(active.pcm_emitted);
        Ok(())
    }

    /// Decodes and writes one unit of audio.
    fn play_one_unit(&mut self, active: &mut ActiveTrack) -> Result<UnitOutcome> {
        match &mut active.decode {
            DecodeState::Wav { .. } => self.play_wav_unit(active),
            DecodeState::Mp3(_) => self.play_mp3_unit(active),
        }
    }

    fn play_wav_unit(&mut self, active: &mut ActiveTrack) -> Result<UnitOutcome> {
        let volume = self.session.volume();
        let mono = active.track.channel_count == 1;
        let read = {
            let DecodeState::Wav { unit } = &mut active.decode else {
                unreachable!("WAV unit on a non-WAV track");
            };
            let read = active.stream.read(unit)?;
            if read == 0 {
                return Ok(UnitOutcome::EndOfTrack);
            }
            self.staging.clear();
            for pair in unit[..read].chunks_exact(2) {
                let sample = scale_sample(i16::from_le_bytes([pair[0], pair[1]]), volume);
                self.staging.push(sample);
                if mono {
                    self.staging.push(sample);
                }
            }
            read
        };
        if self.write_staging() == 0 {
            return Ok(UnitOutcome::EndOfTrack);
        }
        active.pcm_emitted += read as u64;
        self.session.set_byte_cursor(active.pcm_emitted);
        Ok(UnitOutcome::Wrote)
    }

    fn play_mp3_unit(&mut self, active: &mut ActiveTrack) -> Result<UnitOutcome> {
        let step = {
            let DecodeState::Mp3(mp3) = &mut active.decode else {
                unreachable!("MP3 step on a non-MP3 track");
            };
            mp3.step(&mut active.stream)?
        };
        let info = match step {
            Mp3Step::EndOfStream => return Ok(UnitOutcome::EndOfTrack),
            Mp3Step::SkippedFrame | Mp3Step::Resynced => return Ok(UnitOutcome::NoOutput),
            Mp3Step::Frame(info) => info,
        };

        if info.sample_rate_hz > 0
            && (info.sample_rate_hz != active.track.sample_rate_hz
                || info.channel_count != active.track.channel_count
                || !active.track.format_confirmed)
        {
            self.apply_discovered_format(active, &info)?;
        }

        let volume = self.session.volume();
        let mono = info.channel_count == 1;
        self.staging.clear();
        {
            let DecodeState::Mp3(mp3) = &active.decode else {
                unreachable!("MP3 PCM on a non-MP3 track");
            };
            for &sample in mp3.pcm(&info) {
                let scaled = scale_sample(sample, volume);
                self.staging.push(scaled);
                if mono {
                    self.staging.push(scaled);
                }
            }
        }
        if self.write_staging() == 0 {
            return Ok(UnitOutcome::EndOfTrack);
        }
        let source_bytes = info.samples_per_channel * info.channel_count as usize * 2;
        active.pcm_emitted += source_bytes as u64;
        self.session.set_byte_cursor(active.pcm_emitted);
        Ok(UnitOutcome::Wrote)
    }

    /// Handles an observed MP3 format differing from the track's assumed
    /// one: the sink is reconfigured before the frame's samples are written
    /// and the catalog entry is corrected in place.
    fn apply_discovered_format(
        &mut self,
        active: &mut ActiveTrack,
        info: &FrameInfo,
    ) -> Result<()> {
        let changed = info.sample_rate_hz != active.track.sample_rate_hz
            || info.channel_count != active.track.channel_count;
        if changed {
            info!(
                "format change: {} Hz {} ch -> {} Hz {} ch ({} kbps)",
                active.track.sample_rate_hz,
                active.track.channel_count,
                info.sample_rate_hz,
                info.channel_count,
                info.bitrate_kbps
            );
        }
        active.track.sample_rate_hz = info.sample_rate_hz;
        active.track.channel_count = info.channel_count;
        active.track.format_confirmed = true;
        {
            let mut catalog = self.catalog.lock().expect("catalog lock poisoned");
            catalog.confirm_format(active.index, info.sample_rate_hz, info.channel_count);
        }
        self.reconfigure_sink(SinkFormat::stereo_16(info.sample_rate_hz))?;
        let _ = self.events.send(PlaybackEvent::FormatDiscovered {
            sample_rate_hz: info.sample_rate_hz,
            channel_count: info.channel_count,
            bitrate_kbps: info.bitrate_kbps,
        });
        Ok(())
    }

    /// Applies a sink format, skipping the disable/configure/enable cycle
    /// when nothing actually changed.
    fn reconfigure_sink(&mut self, format: SinkFormat) -> Result<()> {
        if format == self.sink_format {
            return Ok(());
        }
        let mut sink = self.sink.lock().expect("sink lock poisoned");
        sink.disable();
        sink.configure(format)?;
        sink.enable()?;
        self.sink_format = format;
        Ok(())
    }

    /// Writes the whole staging buffer, slicing the blocking call so the
    /// cancellation flag is observed at a bounded latency. Returns effective
    /// bytes accepted (0 = the sink is no longer taking output).
    fn write_staging(&mut self) -> usize {
        let mut offset = 0;
        let mut total = 0;
        let mut stalled_rounds = 0;
        while offset < self.staging.len() {
            if !self.session.keep_running() {
                return total.max(1);
            }
            let accepted = {
                let mut sink = self.sink.lock().expect("sink lock poisoned");
                sink.write(&self.staging[offset..], Some(WRITE_SLICE_TIMEOUT))
            };
            if accepted == 0 {
                stalled_rounds += 1;
                if stalled_rounds >= STALLED_WRITE_LIMIT {
                    warn!("sink accepted no output for {} rounds", stalled_rounds);
                    return total;
                }
                continue;
            }
            stalled_rounds = 0;
            offset += accepted / 2;
            total += accepted;
        }
        total
    }

    /// Same-iteration transition to the next catalog entry (wrap-around).
    fn advance(&mut self, finished: ActiveTrack) -> Option<ActiveTrack> {
        let next_index = {
            let catalog = self.catalog.lock().expect("catalog lock poisoned");
            if catalog.is_empty() {
                return None;
            }
            (finished.index + 1) % catalog.len()
        };
        // Close the finished stream before opening the next file.
        drop(finished);
        let next = match open_track(&self.catalog, next_index, self.read_ahead) {
            Ok(next) => next,
            Err(err) => {
                warn!("failed to open next track: {}", err);
                let _ = self.events.send(PlaybackEvent::Error(err.to_string()));
                return None;
            }
        };
        if let Err(err) = self.reconfigure_sink(next.sink_format()) {
            warn!("failed to reconfigure sink for next track: {}", err);
            let _ = self.events.send(PlaybackEvent::Error(err.to_string()));
            return None;
        }
        self.session.set_active_track(Some(next_index));
        self.session.set_byte_cursor(0);
        self.session.clear_pending_seek();
        info!("continue playback: '{}'", next.track.name);
        self.announce_track(&next);
        Some(next)
    }

    fn announce_track(&self, active: &ActiveTrack) {
        let _ = self.events.send(PlaybackEvent::TrackChanged {
            index: active.index,
            title: active.track.display_title().to_string(),
            format_summary: active.track.format_summary(),
        });
    }

    fn publish_progress(&self, active: &ActiveTrack, completed: bool) {
        if !completed && self.progress.check().is_err() {
            return;
        }
        let _ = self
            .events
            .send(PlaybackEvent::Progress(progress_snapshot(active, completed)));
    }
}

/// Post-seek elapsed-cursor estimate for MP3: the seek fraction against the
/// bitrate-derived duration, converted back to PCM bytes. An estimate by
/// construction; it drifts on variable-bitrate files.
fn estimate_mp3_cursor(
    target: u64,
    file_size: u64,
    bitrate_kbps: u32,
    bytes_per_second: u32,
) -> u64 {
    if file_size == 0 || bitrate_kbps == 0 || bytes_per_second == 0 {
        return 0;
    }
    let total_seconds = file_size * 8 / (u64::from(bitrate_kbps) * 1000);
    let elapsed_seconds = target * total_seconds / file_size;
    elapsed_seconds * u64::from(bytes_per_second)
}

fn progress_snapshot(active: &ActiveTrack, completed: bool) -> ProgressUpdate {
    let track = &active.track;
    let bitrate_kbps = match &active.decode {
        DecodeState::Mp3(mp3) => mp3.bitrate_kbps(),
        DecodeState::Wav { .. } => 0,
    };
    let percent = if completed {
        100
    } else {
        // MP3 progress tracks compressed-byte position; WAV tracks decoded
        // payload bytes.
        let consumed = match track.container {
            ContainerType::Mp3 => active.stream.position(),
            ContainerType::Wav => active.pcm_emitted,
        };
        if track.payload_size > 0 {
            (consumed * 100 / track.payload_size).min(100) as u8
        } else {
            0
        }
    };
    let bytes_per_second = u64::from(track.bytes_per_second());
    let elapsed_seconds = if bytes_per_second > 0 {
        active.pcm_emitted / bytes_per_second
    } else {
        0
    };
    ProgressUpdate::new(percent, elapsed_seconds, track.total_seconds(bitrate_kbps))
}
