//! Shared playback session state crossing the controller/loop boundary.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::protocol::PlayState;

const NO_PENDING_SEEK: i64 = -1;
const NO_ACTIVE_TRACK: i64 = -1;

/// Scalar flags and cursors shared between the controller (any caller thread)
/// and the playback loop (its dedicated thread).
///
/// Ownership split: the controller writes the control fields (`play_state`,
/// `keep_running`, `pending_seek`, `volume`, `continue_to_next`); the loop
/// writes the progress fields (`byte_cursor`, `loop_active`, and
/// `active_track` on auto-advance). All fields are plain atomics read at
/// well-defined points, so no lock guards them.
#[derive(Debug)]
pub struct PlaybackSession {
    play_state: AtomicU8,
    keep_running: AtomicBool,
    pending_seek: AtomicI64,
    volume: AtomicU32,
    continue_to_next: AtomicBool,
    active_track: AtomicI64,
    byte_cursor: AtomicU64,
    loop_active: AtomicBool,
}

impl PlaybackSession {
    pub fn new(volume: u8, continue_to_next: bool) -> PlaybackSession {
        PlaybackSession {
            play_state: AtomicU8::new(PlayState::Stopped as u8),
            keep_running: AtomicBool::new(false),
            pending_seek: AtomicI64::new(NO_PENDING_SEEK),
            volume: AtomicU32::new(u32::from(volume.min(100))),
            continue_to_next: AtomicBool::new(continue_to_next),
            active_track: AtomicI64::new(NO_ACTIVE_TRACK),
            byte_cursor: AtomicU64::new(0),
            loop_active: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PlayState {
        PlayState::from_u8(self.play_state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: PlayState) {
        self.play_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Relaxed)
    }

    pub fn set_keep_running(&self, keep_running: bool) {
        self.keep_running.store(keep_running, Ordering::Relaxed);
    }

    /// Publishes a seek target; consumed and cleared by the loop at the top
    /// of its next iteration. Byte offset 0 is a valid target.
    pub fn request_seek(&self, byte_offset: u64) {
        let offset = i64::try_from(byte_offset).unwrap_or(i64::MAX);
        self.pending_seek.store(offset, Ordering::Relaxed);
    }

    /// Takes the pending seek target, clearing it.
    pub fn take_pending_seek(&self) -> Option<u64> {
        let offset = self.pending_seek.swap(NO_PENDING_SEEK, Ordering::Relaxed);
        (offset >= 0).then_some(offset as u64)
    }

    pub fn clear_pending_seek(&self) {
        self.pending_seek.store(NO_PENDING_SEEK, Ordering::Relaxed);
    }

    /// Volume on the 0-100 scale applied to the next decoded unit.
    pub fn volume(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume
            .store(u32::from(volume.min(100)), Ordering::Relaxed);
    }

    pub fn continue_to_next(&self) -> bool {
        self.continue_to_next.load(Ordering::Relaxed)
    }

    pub fn set_continue_to_next(&self, enabled: bool) {
        self.continue_to_next.store(enabled, Ordering::Relaxed);
    }

    pub fn active_track(&self) -> Option<usize> {
        let index = self.active_track.load(Ordering::Relaxed);
        (index >= 0).then_some(index as usize)
    }

    pub fn set_active_track(&self, index: Option<usize>) {
        let value = match index {
            Some(index) => i64::try_from(index).unwrap_or(NO_ACTIVE_TRACK),
            None => NO_ACTIVE_TRACK,
        };
        self.active_track.store(value, Ordering::Relaxed);
    }

    /// Decoded-PCM bytes emitted for the active track.
    pub fn byte_cursor(&self) -> u64 {
        self.byte_cursor.load(Ordering::Relaxed)
    }

    pub fn set_byte_cursor(&self, bytes: u64) {
        self.byte_cursor.store(bytes, Ordering::Relaxed);
    }

    /// True strictly while a loop execution context is alive; the stop
    /// handshake waits on this.
    pub fn loop_active(&self) -> bool {
        self.loop_active.load(Ordering::Relaxed)
    }

    pub fn set_loop_active(&self, active: bool) {
        self.loop_active.store(active, Ordering::Relaxed);
    }
}
