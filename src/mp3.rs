//! MPEG audio frame parsing and incremental decode.
//!
//! The decode primitive mirrors the classic one-frame decoder contract: hand
//! it a byte window, get back at most one frame of interleaved PCM plus the
//! frame's byte length. `Mp3Stream` owns the compressed-byte ring buffer and
//! the per-iteration policy around the primitive (refill, frame skip,
//! byte-at-a-time resynchronization, end-of-stream detection).

use log::{debug, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::formats::Packet;

use crate::bitstream::TrackStream;
use crate::error::{PlaybackError, Result};

/// Compressed-byte ring capacity; comfortably above the largest legal frame.
pub const RING_CAPACITY: usize = 8 * 1024;

/// Interleaved sample capacity of one decoded frame (1152 per channel,
/// stereo).
pub const MAX_FRAME_SAMPLES: usize = 1152 * 2;

/// Outcome of one decode attempt.
///
/// `samples_per_channel == 0` with a non-zero `frame_byte_length` is a
/// syntactically recognized but undecodable frame (typically the first frame
/// after a seek lands mid-frame); both zero means no frame boundary was found
/// in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub samples_per_channel: usize,
    pub channel_count: u16,
    pub sample_rate_hz: u32,
    pub bitrate_kbps: u32,
    pub frame_byte_length: usize,
}

/// Frame-at-a-time decode primitive.
pub trait FrameDecoder: Send {
    /// Decodes at most one frame from the start of `window` into `pcm_out`
    /// (interleaved 16-bit samples).
    fn decode_frame(&mut self, window: &[u8], pcm_out: &mut [i16]) -> FrameInfo;

    /// Drops cross-frame continuity (bit reservoir) after a discontinuous
    /// jump. The next 0-2 frames may decode silent or fail; that transient
    /// self-corrects.
    fn reset(&mut self);
}

// Layer III bitrates in kbps, indexed by the header's 4-bit field. Index 0
// is free-format and index 15 is reserved; both are rejected.
const BITRATES_V1_L3: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const BITRATES_V2_L3: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

// MPEG1 sample rates; halved for MPEG2, quartered for MPEG2.5.
const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub bitrate_kbps: u32,
    pub samples_per_channel: usize,
    pub frame_byte_length: usize,
}

/// Parses an MPEG audio frame header (Layer III only) at the start of
/// `window`.
pub(crate) fn parse_frame_header(window: &[u8]) -> Option<FrameHeader> {
    if window.len() < 4 {
        return None;
    }
    if window[0] != 0xFF || (window[1] & 0xE0) != 0xE0 {
        return None;
    }
    let version_bits = (window[1] >> 3) & 0x03; // 0 = MPEG2.5, 2 = MPEG2, 3 = MPEG1
    if version_bits == 1 {
        return None;
    }
    let layer_bits = (window[1] >> 1) & 0x03; // 1 = Layer III
    if layer_bits != 1 {
        return None;
    }
    let bitrate_index = (window[2] >> 4) as usize;
    if bitrate_index == 0 || bitrate_index == 15 {
        return None;
    }
    let rate_index = ((window[2] >> 2) & 0x03) as usize;
    if rate_index == 3 {
        return None;
    }
    let padding = usize::from((window[2] >> 1) & 0x01);
    let channel_mode = (window[3] >> 6) & 0x03;
    let channel_count = if channel_mode == 3 { 1 } else { 2 };

    let mpeg1 = version_bits == 3;
    let bitrate_kbps = if mpeg1 {
        BITRATES_V1_L3[bitrate_index]
    } else {
        BITRATES_V2_L3[bitrate_index]
    };
    let sample_rate_hz = match version_bits {
        3 => SAMPLE_RATES_V1[rate_index],
        2 => SAMPLE_RATES_V1[rate_index] / 2,
        _ => SAMPLE_RATES_V1[rate_index] / 4,
    };
    let samples_per_channel = if mpeg1 { 1152 } else { 576 };
    let frame_byte_length =
        (samples_per_channel / 8) * (bitrate_kbps as usize) * 1000 / (sample_rate_hz as usize)
            + padding;
    if frame_byte_length < 4 || frame_byte_length > RING_CAPACITY {
        return None;
    }
    Some(FrameHeader {
        sample_rate_hz,
        channel_count,
        bitrate_kbps,
        samples_per_channel,
        frame_byte_length,
    })
}

/// Production decode primitive: hand-framed MPEG packets fed to symphonia's
/// MP3 codec one frame at a time.
pub struct SymphoniaFrameDecoder {
    decoder: Box<dyn Decoder>,
}

impl SymphoniaFrameDecoder {
    pub fn new() -> Result<SymphoniaFrameDecoder> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|err| {
                warn!("MPEG decoder unavailable: {}", err);
                PlaybackError::InvalidFormat("MPEG decoder unavailable")
            })?;
        Ok(SymphoniaFrameDecoder { decoder })
    }
}

impl FrameDecoder for SymphoniaFrameDecoder {
    fn decode_frame(&mut self, window: &[u8], pcm_out: &mut [i16]) -> FrameInfo {
        let Some(header) = parse_frame_header(window) else {
            return FrameInfo::default();
        };
        if window.len() < header.frame_byte_length {
            // Partial frame tail; callers treat this like no boundary found.
            return FrameInfo::default();
        }
        let recognized = FrameInfo {
            samples_per_channel: 0,
            channel_count: header.channel_count,
            sample_rate_hz: header.sample_rate_hz,
            bitrate_kbps: header.bitrate_kbps,
            frame_byte_length: header.frame_byte_length,
        };

        let packet = Packet::new_from_slice(0, 0, 0, &window[..header.frame_byte_length]);
        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("undecodable MPEG frame ({} bytes): {}", header.frame_byte_length, err);
                return recognized;
            }
        };

        let spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        let mut sample_buffer = SampleBuffer::<i16>::new(capacity, spec);
        sample_buffer.copy_interleaved_ref(decoded);
        let samples = sample_buffer.samples();
        if samples.is_empty() {
            return recognized;
        }
        if samples.len() > pcm_out.len() {
            // Decoder-level anomaly; clamp rather than fail the track.
            warn!(
                "decoded frame overflows PCM staging ({} > {} samples), clamping",
                samples.len(),
                pcm_out.len()
            );
        }
        let copy_len = samples.len().min(pcm_out.len());
        pcm_out[..copy_len].copy_from_slice(&samples[..copy_len]);

        let channel_count = (spec.channels.count() as u16).max(1);
        let samples_per_channel = copy_len / channel_count as usize;
        if samples_per_channel != header.samples_per_channel {
            debug!(
                "frame yielded {} samples per channel (header says {})",
                samples_per_channel, header.samples_per_channel
            );
        }
        FrameInfo {
            samples_per_channel,
            channel_count,
            sample_rate_hz: spec.rate,
            bitrate_kbps: header.bitrate_kbps,
            frame_byte_length: header.frame_byte_length,
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }
}

/// What one loop iteration's `step` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mp3Step {
    /// A decoded frame is waiting in `pcm()`.
    Frame(FrameInfo),
    /// A recognized frame carried no decodable audio and was skipped.
    SkippedFrame,
    /// One byte was skipped hunting for a frame boundary.
    Resynced,
    /// Ring exhausted with no further file bytes.
    EndOfStream,
}

/// Compressed-byte ring buffer plus decoder state for one MP3 track.
pub struct Mp3Stream {
    ring: Vec<u8>,
    fill: usize,
    pos: usize,
    pcm: Vec<i16>,
    decoder: Box<dyn FrameDecoder>,
    /// Fixed from the first frame reporting a non-zero bitrate; 0 while
    /// unknown. Drives the duration estimate.
    bitrate_kbps: u32,
}

impl Mp3Stream {
    pub fn new() -> Result<Mp3Stream> {
        Mp3Stream::with_decoder(Box::new(SymphoniaFrameDecoder::new()?))
    }

    pub fn with_decoder(decoder: Box<dyn FrameDecoder>) -> Result<Mp3Stream> {
        let mut ring = Vec::new();
        ring.try_reserve_exact(RING_CAPACITY)
            .map_err(|_| PlaybackError::OutOfMemory(RING_CAPACITY))?;
        ring.resize(RING_CAPACITY, 0);
        let mut pcm = Vec::new();
        pcm.try_reserve_exact(MAX_FRAME_SAMPLES)
            .map_err(|_| PlaybackError::OutOfMemory(MAX_FRAME_SAMPLES * 2))?;
        pcm.resize(MAX_FRAME_SAMPLES, 0);
        Ok(Mp3Stream {
            ring,
            fill: 0,
            pos: 0,
            pcm,
            decoder,
            bitrate_kbps: 0,
        })
    }

    fn buffered(&self) -> usize {
        self.fill - self.pos
    }

    /// Tops the ring up when the unconsumed span drops below half capacity,
    /// compacting the remainder to the front first.
    fn refill(&mut self, stream: &mut TrackStream) -> Result<()> {
        if self.buffered() >= RING_CAPACITY / 2 {
            return Ok(());
        }
        if self.pos > 0 {
            self.ring.copy_within(self.pos..self.fill, 0);
            self.fill -= self.pos;
            self.pos = 0;
        }
        let read = stream.read(&mut self.ring[self.fill..])?;
        self.fill += read;
        Ok(())
    }

    /// Runs one decode attempt against the ring.
    pub fn step(&mut self, stream: &mut TrackStream) -> Result<Mp3Step> {
        self.refill(stream)?;
        if self.buffered() == 0 {
            return Ok(Mp3Step::EndOfStream);
        }
        let info = self
            .decoder
            .decode_frame(&self.ring[self.pos..self.fill], &mut self.pcm);
        if info.samples_per_channel > 0 {
            self.pos += info.frame_byte_length.min(self.buffered());
            if self.bitrate_kbps == 0 && info.bitrate_kbps > 0 {
                self.bitrate_kbps = info.bitrate_kbps;
                debug!("bitrate fixed at {} kbps from first frame", self.bitrate_kbps);
            }
            Ok(Mp3Step::Frame(info))
        } else if info.frame_byte_length > 0 {
            // Recognized but undecodable; step past it, do not count as EOF.
            self.pos += info.frame_byte_length.min(self.buffered());
            Ok(Mp3Step::SkippedFrame)
        } else {
            // No frame boundary in the window; resynchronize one byte at a
            // time.
            self.pos += 1;
            Ok(Mp3Step::Resynced)
        }
    }

    /// Interleaved samples of the frame most recently returned by `step`.
    pub fn pcm(&self, info: &FrameInfo) -> &[i16] {
        let len = (info.samples_per_channel * info.channel_count as usize).min(self.pcm.len());
        &self.pcm[..len]
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    /// Clears buffered bytes and decoder continuity after a discontinuous
    /// jump (seek or track change). The fixed bitrate survives; it describes
    /// the whole file.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.fill = 0;
        self.decoder.reset();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{FrameDecoder, FrameInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted decode primitive: consumes fixed-length "frames" and fills
    /// the PCM buffer with a constant, without touching real MPEG data.
    pub(crate) struct ScriptedDecoder {
        pub frame_len: usize,
        pub sample_rate_hz: u32,
        pub channel_count: u16,
        pub bitrate_kbps: u32,
        pub samples_per_channel: usize,
        pub fill_value: i16,
        pub resets: Arc<AtomicUsize>,
    }

    impl ScriptedDecoder {
        pub(crate) fn new(sample_rate_hz: u32, channel_count: u16) -> ScriptedDecoder {
            ScriptedDecoder {
                frame_len: 512,
                sample_rate_hz,
                channel_count,
                bitrate_kbps: 128,
                samples_per_channel: 1152,
                fill_value: 1000,
                resets: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameDecoder for ScriptedDecoder {
        fn decode_frame(&mut self, window: &[u8], pcm_out: &mut [i16]) -> FrameInfo {
            if window.len() < self.frame_len {
                return FrameInfo::default();
            }
            let samples = self.samples_per_channel * self.channel_count as usize;
            let limit = samples.min(pcm_out.len());
            for slot in pcm_out[..limit].iter_mut() {
                *slot = self.fill_value;
            }
            FrameInfo {
                samples_per_channel: self.samples_per_channel,
                channel_count: self.channel_count,
                sample_rate_hz: self.sample_rate_hz,
                bitrate_kbps: self.bitrate_kbps,
                frame_byte_length: self.frame_len,
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedDecoder;
    use super::{
        parse_frame_header, Mp3Step, Mp3Stream, SymphoniaFrameDecoder, RING_CAPACITY,
    };
    use crate::bitstream::TrackStream;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_fixture(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.mp3");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_frame_header_mpeg1_layer3() {
        // MPEG1 Layer III, 128 kbps, 44100 Hz, no padding, stereo.
        let header = parse_frame_header(&[0xFF, 0xFB, 0x90, 0x00]).unwrap();
        assert_eq!(header.sample_rate_hz, 44_100);
        assert_eq!(header.channel_count, 2);
        assert_eq!(header.bitrate_kbps, 128);
        assert_eq!(header.samples_per_channel, 1152);
        assert_eq!(header.frame_byte_length, 144 * 128_000 / 44_100);
    }

    #[test]
    fn test_parse_frame_header_mpeg2_mono_with_padding() {
        // MPEG2 Layer III, 80 kbps, 22050 Hz, padding, mono.
        let header = parse_frame_header(&[0xFF, 0xF3, 0x92, 0xC0]).unwrap();
        assert_eq!(header.sample_rate_hz, 22_050);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.bitrate_kbps, 80);
        assert_eq!(header.samples_per_channel, 576);
        assert_eq!(header.frame_byte_length, 72 * 80_000 / 22_050 + 1);
    }

    #[test]
    fn test_parse_frame_header_rejects_junk() {
        assert!(parse_frame_header(&[]).is_none());
        assert!(parse_frame_header(&[0xFF]).is_none());
        assert!(parse_frame_header(&[0x00, 0x00, 0x00, 0x00]).is_none());
        // Good sync, reserved version.
        assert!(parse_frame_header(&[0xFF, 0xEB, 0x90, 0x00]).is_none());
        // Free-format bitrate.
        assert!(parse_frame_header(&[0xFF, 0xFB, 0x00, 0x00]).is_none());
        // Reserved bitrate index.
        assert!(parse_frame_header(&[0xFF, 0xFB, 0xF0, 0x00]).is_none());
        // Reserved sample-rate index.
        assert!(parse_frame_header(&[0xFF, 0xFB, 0x9C, 0x00]).is_none());
    }

    #[test]
    fn test_resynchronization_terminates_on_garbage() {
        // Deterministic pseudo-random bytes with every 0xFF knocked out so no
        // window ever parses as a frame.
        let mut state = 0x243F_6A88_85A3_08D3u64;
        let garbage: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let byte = (state >> 33) as u8;
                if byte == 0xFF {
                    0xFE
                } else {
                    byte
                }
            })
            .collect();
        let (_dir, path) = write_fixture(&garbage);
        let mut stream = TrackStream::open(&path).unwrap();
        let mut mp3 = Mp3Stream::with_decoder(Box::new(SymphoniaFrameDecoder::new().unwrap()))
            .unwrap();

        let mut iterations = 0usize;
        loop {
            match mp3.step(&mut stream).unwrap() {
                Mp3Step::EndOfStream => break,
                Mp3Step::Resynced => {}
                other => panic!("garbage produced {:?}", other),
            }
            iterations += 1;
            assert!(iterations <= garbage.len(), "resynchronization did not terminate");
        }
        assert_eq!(iterations, garbage.len());
    }

    #[test]
    fn test_scripted_frames_consume_ring_and_fix_bitrate() {
        let frame_len = 512;
        let frames = 8;
        let (_dir, path) = write_fixture(&vec![0xAAu8; frame_len * frames]);
        let mut stream = TrackStream::open(&path).unwrap();
        let mut decoder = ScriptedDecoder::new(44_100, 2);
        decoder.frame_len = frame_len;
        let mut mp3 = Mp3Stream::with_decoder(Box::new(decoder)).unwrap();
        assert_eq!(mp3.bitrate_kbps(), 0);

        let mut decoded_frames = 0;
        loop {
            match mp3.step(&mut stream).unwrap() {
                Mp3Step::Frame(info) => {
                    decoded_frames += 1;
                    assert_eq!(info.frame_byte_length, frame_len);
                    assert_eq!(mp3.pcm(&info).len(), 1152 * 2);
                    assert!(mp3.pcm(&info).iter().all(|&s| s == 1000));
                }
                Mp3Step::EndOfStream => break,
                Mp3Step::Resynced => {}
                Mp3Step::SkippedFrame => panic!("unexpected skip"),
            }
        }
        assert_eq!(decoded_frames, frames);
        assert_eq!(mp3.bitrate_kbps(), 128);
    }

    #[test]
    fn test_reset_clears_ring_and_decoder_state() {
        let (_dir, path) = write_fixture(&vec![0x55u8; 2048]);
        let mut stream = TrackStream::open(&path).unwrap();
        let decoder = ScriptedDecoder::new(44_100, 2);
        let resets = decoder.resets.clone();
        let mut mp3 = Mp3Stream::with_decoder(Box::new(decoder)).unwrap();
        mp3.step(&mut stream).unwrap();
        mp3.reset();
        assert_eq!(resets.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(mp3.buffered(), 0);
    }

    #[test]
    fn test_refill_compacts_below_half_capacity() {
        let total = RING_CAPACITY + RING_CAPACITY / 2;
        let (_dir, path) = write_fixture(&vec![0x11u8; total]);
        let mut stream = TrackStream::open(&path).unwrap();
        let mut decoder = ScriptedDecoder::new(44_100, 2);
        decoder.frame_len = 1024;
        let mut mp3 = Mp3Stream::with_decoder(Box::new(decoder)).unwrap();

        // First step fills the ring completely.
        mp3.step(&mut stream).unwrap();
        assert_eq!(mp3.fill, RING_CAPACITY);
        // Consume past the halfway mark; the following step must compact and
        // top the ring back up from the remaining file bytes.
        for _ in 0..5 {
            mp3.step(&mut stream).unwrap();
        }
        assert!(mp3.pos < RING_CAPACITY / 2);
        assert_eq!(stream.position(), total as u64);
    }
}
