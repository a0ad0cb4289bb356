//! Public control surface coordinating the playback loop lifecycle.
//!
//! Controllers run on caller threads and communicate with the loop through
//! `PlaybackSession` flags; the one synchronous point is the stop handshake,
//! which guarantees the old loop has vacated the sink before anything else
//! touches it.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::catalog::{Catalog, ContainerType};
use crate::config::PlaybackConfig;
use crate::engine::{self, PlaybackLoop};
use crate::error::Result;
use crate::protocol::{PlayState, PlaybackEvent};
use crate::session::PlaybackSession;
use crate::sink::{self, PcmSink, SharedSink};

/// Bound on the stop handshake.
const STOP_WAIT: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(20);
const EVENT_BUS_CAPACITY: usize = 256;

pub struct PlaybackController {
    session: Arc<PlaybackSession>,
    catalog: Arc<Mutex<Catalog>>,
    sink: SharedSink,
    events: broadcast::Sender<PlaybackEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    auto_play_on_navigation: bool,
    read_ahead: usize,
}

impl PlaybackController {
    pub fn new(catalog: Catalog, sink: Box<dyn PcmSink>, config: &PlaybackConfig) -> PlaybackController {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        PlaybackController {
            session: Arc::new(PlaybackSession::new(config.volume, config.continue_to_next)),
            catalog: Arc::new(Mutex::new(catalog)),
            sink: sink::shared(sink),
            events,
            worker: Mutex::new(None),
            auto_play_on_navigation: config.auto_play_on_navigation,
            read_ahead: config.read_ahead_kib.max(1) * 1024,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PlayState {
        self.session.state()
    }

    pub fn active_track(&self) -> Option<usize> {
        self.session.active_track()
    }

    pub fn volume(&self) -> u8 {
        self.session.volume() as u8
    }

    /// Decoded PCM bytes emitted for the active track.
    pub fn byte_cursor(&self) -> u64 {
        self.session.byte_cursor()
    }

    pub fn track_count(&self) -> usize {
        self.catalog.lock().expect("catalog lock poisoned").len()
    }

    /// Display titles for the whole catalog, in play order.
    pub fn track_titles(&self) -> Vec<String> {
        let catalog = self.catalog.lock().expect("catalog lock poisoned");
        (0..catalog.len())
            .filter_map(|index| catalog.get(index))
            .map(|track| track.display_title().to_string())
            .collect()
    }

    /// Starts playback of the named track. Unknown names and unopenable
    /// files are logged and published; nothing propagates and the session
    /// stays stopped.
    pub fn play(&self, name: &str) {
        let index = {
            let catalog = self.catalog.lock().expect("catalog lock poisoned");
            catalog.index_of(name)
        };
        match index {
            Some(index) => self.play_index(index),
            None => {
                error!("track not found in catalog: {}", name);
                let _ = self
                    .events
                    .send(PlaybackEvent::Error(format!("track not found: {}", name)));
            }
        }
    }

    pub fn play_index(&self, index: usize) {
        self.stop();
        if let Err(err) = self.start_loop(index) {
            error!("failed to start playback: {}", err);
            let _ = self.events.send(PlaybackEvent::Error(err.to_string()));
        }
    }

    fn start_loop(&self, index: usize) -> Result<()> {
        let active = engine::open_track(&self.catalog, index, self.read_ahead)?;
        let format = active.sink_format();
        {
            let mut sink = self.sink.lock().expect("sink lock poisoned");
            sink.configure(format)?;
            sink.enable()?;
        }
        self.session.set_active_track(Some(index));
        self.session.set_byte_cursor(0);
        self.session.clear_pending_seek();
        self.session.set_keep_running(true);
        self.session.set_state(PlayState::Playing);
        let _ = self
            .events
            .send(PlaybackEvent::StateChanged(PlayState::Playing));

        let playback_loop = PlaybackLoop::new(
            self.session.clone(),
            self.catalog.clone(),
            self.sink.clone(),
            self.events.clone(),
            format,
            self.read_ahead,
        )?;
        info!("started playing track {} ('{}')", index, active.track().name);
        let handle = thread::Builder::new()
            .name("playback-loop".to_string())
            .spawn(move || playback_loop.run(active))
            .map_err(crate::error::PlaybackError::Io)?;
        *self.worker.lock().expect("worker lock poisoned") = Some(handle);
        Ok(())
    }

    /// Requests the loop to end and waits (bounded) for it to acknowledge,
    /// then disables the sink. A loop that misses the bound is detached and
    /// logged; it exits at its next flag check.
    pub fn stop(&self) {
        self.session.set_keep_running(false);
        self.session.set_state(PlayState::Stopped);
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        let mut vacated = true;
        if let Some(handle) = handle {
            let deadline = Instant::now() + STOP_WAIT;
            while self.session.loop_active() && Instant::now() < deadline {
                thread::sleep(STOP_POLL);
            }
            if self.session.loop_active() {
                warn!(
                    "playback loop did not acknowledge stop within {:?}; detaching it",
                    STOP_WAIT
                );
                vacated = false;
                drop(handle);
            } else if handle.join().is_err() {
                warn!("playback loop thread panicked");
            }
        }
        if vacated {
            let mut sink = self.sink.lock().expect("sink lock poisoned");
            sink.disable();
        } else if let Ok(mut sink) = self.sink.try_lock() {
            sink.disable();
        } else {
            // The detached loop still owns the sink; it disables nothing,
            // but touching it from here would be the one forbidden race.
            warn!("sink left untouched until the detached loop exits");
        }
    }

    /// Pure flag toggle; a no-op unless a track is actively loaded.
    pub fn pause(&self) {
        if !self.session.loop_active() {
            return;
        }
        if self.session.state() == PlayState::Playing {
            self.session.set_state(PlayState::Paused);
            let _ = self
                .events
                .send(PlaybackEvent::StateChanged(PlayState::Paused));
            debug!("playback paused");
        }
    }

    pub fn resume(&self) {
        if !self.session.loop_active() {
            return;
        }
        if self.session.state() == PlayState::Paused {
            self.session.set_state(PlayState::Playing);
            let _ = self
                .events
                .send(PlaybackEvent::StateChanged(PlayState::Playing));
            debug!("playback resumed");
        }
    }

    /// Publishes a raw byte seek target; the loop repositions at the top of
    /// its next iteration (single-owner file access, no cross-thread race).
    pub fn seek_bytes(&self, byte_offset: u64) {
        if !self.session.loop_active() {
            return;
        }
        self.session.request_seek(byte_offset);
    }

    /// Percent-of-track seek: converted against the payload size, aligned
    /// down to a whole sample for WAV.
    pub fn seek_percent(&self, percent: u8) {
        if !self.session.loop_active() {
            return;
        }
        let Some(index) = self.session.active_track() else {
            return;
        };
        let track = {
            let catalog = self.catalog.lock().expect("catalog lock poisoned");
            match catalog.get(index) {
                Some(track) => track.clone(),
                None => return,
            }
        };
        let percent = u64::from(percent.min(100));
        let mut target = track.payload_size * percent / 100;
        if track.container == ContainerType::Wav {
            let bytes_per_sample =
                u64::from(track.channel_count) * u64::from(track.bits_per_sample / 8);
            if bytes_per_sample > 0 {
                target = target / bytes_per_sample * bytes_per_sample;
            }
        }
        info!("seek to {}% ({} bytes)", percent, target);
        self.seek_bytes(target);
    }

    pub fn next(&self) {
        self.navigate(1);
    }

    pub fn previous(&self) {
        self.navigate(-1);
    }

    fn navigate(&self, direction: i64) {
        self.session.clear_pending_seek();
        let len = self.catalog.lock().expect("catalog lock poisoned").len();
        if len == 0 {
            return;
        }
        let base = self.session.active_track().unwrap_or(0) as i64;
        let target = (base + direction).rem_euclid(len as i64) as usize;
        if self.auto_play_on_navigation {
            self.play_index(target);
        } else {
            self.load_index(target);
        }
    }

    /// Makes a track current and publishes its metadata without starting
    /// audio, so a user can browse without forcing playback.
    pub fn load_index(&self, index: usize) {
        self.stop();
        let track = {
            let catalog = self.catalog.lock().expect("catalog lock poisoned");
            match catalog.get(index) {
                Some(track) => track.clone(),
                None => return,
            }
        };
        self.session.set_active_track(Some(index));
        self.session.set_byte_cursor(0);
        let _ = self.events.send(PlaybackEvent::TrackChanged {
            index,
            title: track.display_title().to_string(),
            format_summary: track.format_summary(),
        });
        debug!("loaded '{}' without starting playback", track.name);
    }

    /// Stored for the next decoded unit; never retroactive.
    pub fn set_volume(&self, volume: u8) {
        self.session.set_volume(volume);
        debug!("volume set to {}", self.session.volume());
    }

    pub fn set_continue_to_next(&self, enabled: bool) {
        self.session.set_continue_to_next(enabled);
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::PlaybackController;
    use crate::catalog::Catalog;
    use crate::config::PlaybackConfig;
    use crate::protocol::{PlayState, PlaybackEvent};
    use crate::sink::test_support::{CaptureSink, SinkStats};
    use crate::wav::test_support::wav_bytes;
    use std::io::Write;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn controller_over(
        dir: &Path,
        config: PlaybackConfig,
        write_delay: Option<Duration>,
    ) -> (PlaybackController, Arc<Mutex<SinkStats>>) {
        let catalog = Catalog::scan_directory(dir);
        let (sink, stats) = CaptureSink::with_write_delay(write_delay);
        (
            PlaybackController::new(catalog, Box::new(sink), &config),
            stats,
        )
    }

    fn wait_for_idle(controller: &PlaybackController) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.state() != PlayState::Stopped && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_play_drains_track_and_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "tone.wav", &wav_bytes(44_100, 1, 16, &[0u8; 176_400], &[]));
        let (controller, stats) = controller_over(dir.path(), PlaybackConfig::default(), None);
        let mut events = controller.subscribe();

        controller.play("tone.wav");
        wait_for_idle(&controller);

        assert_eq!(controller.state(), PlayState::Stopped);
        assert_eq!(controller.active_track(), Some(0));
        assert!(stats.lock().unwrap().bytes_accepted > 0);
        let mut saw_finished = false;
        let mut final_percent = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PlaybackEvent::TrackFinished { .. } => saw_finished = true,
                PlaybackEvent::Progress(update) => final_percent = update.percent,
                _ => {}
            }
        }
        assert!(saw_finished);
        assert_eq!(final_percent, 100);
    }

    #[test]
    fn test_play_unknown_name_publishes_error_and_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "tone.wav", &wav_bytes(44_100, 1, 16, &[0u8; 64], &[]));
        let (controller, _stats) = controller_over(dir.path(), PlaybackConfig::default(), None);
        let mut events = controller.subscribe();

        controller.play("missing.wav");

        assert_eq!(controller.state(), PlayState::Stopped);
        assert!(matches!(events.try_recv(), Ok(PlaybackEvent::Error(_))));
    }

    #[test]
    fn test_stop_handshake_is_bounded_and_disables_sink() {
        let dir = tempfile::tempdir().unwrap();
        // Enough units that the track far outlives the test without a stop.
        write_file(
            dir.path(),
            "long.wav",
            &wav_bytes(44_100, 2, 16, &[0u8; 400 * 8192], &[]),
        );
        let (controller, stats) =
            controller_over(dir.path(), PlaybackConfig::default(), Some(Duration::from_millis(20)));

        controller.play("long.wav");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(controller.state(), PlayState::Playing);

        let started = Instant::now();
        controller.stop();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
        assert_eq!(controller.state(), PlayState::Stopped);
        let stats = stats.lock().unwrap();
        assert!(!stats.enabled);
        assert!(stats.disable_calls >= 1);
    }

    #[test]
    fn test_pause_and_resume_toggle_only_while_loaded() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "long.wav",
            &wav_bytes(44_100, 2, 16, &[0u8; 400 * 8192], &[]),
        );
        let (controller, _stats) =
            controller_over(dir.path(), PlaybackConfig::default(), Some(Duration::from_millis(20)));

        // No track loaded: toggles are no-ops.
        controller.pause();
        assert_eq!(controller.state(), PlayState::Stopped);

        controller.play("long.wav");
        std::thread::sleep(Duration::from_millis(50));
        controller.pause();
        assert_eq!(controller.state(), PlayState::Paused);
        controller.resume();
        assert_eq!(controller.state(), PlayState::Playing);
        controller.stop();
    }

    #[test]
    fn test_navigation_wraps_and_loads_without_playing() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.wav", &wav_bytes(44_100, 2, 16, &[0u8; 64], &[]));
        write_file(dir.path(), "b.wav", &wav_bytes(44_100, 2, 16, &[0u8; 64], &[]));
        let config = PlaybackConfig {
            auto_play_on_navigation: false,
            ..PlaybackConfig::default()
        };
        let (controller, stats) = controller_over(dir.path(), config, None);
        let mut events = controller.subscribe();

        controller.next();
        assert_eq!(controller.active_track(), Some(1));
        assert_eq!(controller.state(), PlayState::Stopped);
        controller.next();
        assert_eq!(controller.active_track(), Some(0));
        controller.previous();
        assert_eq!(controller.active_track(), Some(1));

        // Browsing never started audio.
        assert_eq!(stats.lock().unwrap().bytes_accepted, 0);
        assert!(matches!(
            events.try_recv(),
            Ok(PlaybackEvent::TrackChanged { index: 1, .. })
        ));
    }

    #[test]
    fn test_seek_requires_loaded_track() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.wav", &wav_bytes(44_100, 2, 16, &[0u8; 64], &[]));
        let (controller, _stats) = controller_over(dir.path(), PlaybackConfig::default(), None);
        controller.seek_bytes(32);
        controller.seek_percent(50);
        // Nothing loaded, so nothing was queued for a future loop to trip on.
        assert_eq!(controller.session.take_pending_seek(), None);
    }

    #[test]
    fn test_set_volume_clamps() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.wav", &wav_bytes(44_100, 2, 16, &[0u8; 64], &[]));
        let (controller, _stats) = controller_over(dir.path(), PlaybackConfig::default(), None);
        assert_eq!(controller.volume(), 80);
        controller.set_volume(150);
        assert_eq!(controller.volume(), 100);
        controller.set_volume(0);
        assert_eq!(controller.volume(), 0);
    }
}
