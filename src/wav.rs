//! WAV container header parsing.

use crate::bitstream::TrackStream;
use crate::error::{PlaybackError, Result};

/// Fixed leading header: RIFF descriptor plus the `fmt ` chunk of a plain
/// PCM file.
pub const WAV_HEADER_LEN: usize = 44;

/// The `data` chunk must appear within this many bytes of the file start.
const DATA_SCAN_LIMIT: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub bits_per_sample: u16,
    /// Declared payload length in bytes.
    pub data_size: u32,
    /// Offset of the first payload byte.
    pub data_start_offset: u64,
}

fn u16_at(header: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([header[offset], header[offset + 1]])
}

fn u32_at(header: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    ])
}

/// Parses the container header, leaving `stream` positioned at the first
/// payload byte.
///
/// Fails closed: a truncated header, a non-PCM format code, or an
/// unlocatable `data` chunk makes the track unplayable.
pub fn parse(stream: &mut TrackStream) -> Result<WavInfo> {
    let mut header = [0u8; WAV_HEADER_LEN];
    if stream.read(&mut header)? != WAV_HEADER_LEN {
        return Err(PlaybackError::InvalidFormat("truncated WAV header"));
    }
    if &header[0..4] != b"RIFF" {
        return Err(PlaybackError::InvalidFormat("missing RIFF tag"));
    }
    if &header[8..12] != b"WAVE" {
        return Err(PlaybackError::InvalidFormat("missing WAVE tag"));
    }
    if &header[12..16] != b"fmt " {
        return Err(PlaybackError::InvalidFormat("missing fmt chunk"));
    }
    if u16_at(&header, 20) != 1 {
        return Err(PlaybackError::InvalidFormat("non-PCM encoding"));
    }

    let channel_count = u16_at(&header, 22);
    let sample_rate_hz = u32_at(&header, 24);
    let bits_per_sample = u16_at(&header, 34);

    // The data chunk may sit past the canonical 44 bytes; walk chunk headers
    // from the end of the fmt chunk.
    let fmt_size = u32_at(&header, 16);
    let mut offset = 20u64 + u64::from(fmt_size);
    stream.seek(offset)?;

    loop {
        let mut chunk = [0u8; 8];
        if stream.read(&mut chunk)? != 8 {
            return Err(PlaybackError::InvalidFormat("data chunk not found"));
        }
        let chunk_size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        if &chunk[0..4] == b"data" {
            return Ok(WavInfo {
                sample_rate_hz,
                channel_count,
                bits_per_sample,
                data_size: chunk_size,
                data_start_offset: stream.position(),
            });
        }
        offset += 8 + u64::from(chunk_size);
        if offset > DATA_SCAN_LIMIT {
            return Err(PlaybackError::InvalidFormat(
                "data chunk not found in the first 10 KB",
            ));
        }
        stream.seek(offset)?;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::wav_bytes;
    use super::{parse, PlaybackError};
    use crate::bitstream::TrackStream;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_fixture(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.wav");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_round_trips_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        let (_dir, path) = write_fixture(&wav_bytes(44_100, 2, 16, &payload, &[]));
        let mut stream = TrackStream::open(&path).unwrap();
        let info = parse(&mut stream).unwrap();
        assert_eq!(info.sample_rate_hz, 44_100);
        assert_eq!(info.channel_count, 2);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.data_size as usize, payload.len());
        assert_eq!(info.data_start_offset, 44);
        let mut read_back = vec![0u8; payload.len()];
        assert_eq!(stream.read(&mut read_back).unwrap(), payload.len());
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_parse_skips_chunks_before_data() {
        let payload = [7u8; 64];
        let bytes = wav_bytes(
            22_050,
            1,
            16,
            &payload,
            &[(b"LIST", &[0u8; 26]), (b"fact", &[0u8; 4])],
        );
        let (_dir, path) = write_fixture(&bytes);
        let mut stream = TrackStream::open(&path).unwrap();
        let info = parse(&mut stream).unwrap();
        assert_eq!(info.sample_rate_hz, 22_050);
        assert_eq!(info.data_size, 64);
        assert_eq!(info.data_start_offset, 44 + 34 + 12);
        let mut read_back = vec![0u8; 64];
        stream.read(&mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_parse_rejects_non_pcm() {
        let mut bytes = wav_bytes(44_100, 2, 16, &[0u8; 8], &[]);
        bytes[20] = 3; // IEEE float format code
        let (_dir, path) = write_fixture(&bytes);
        let mut stream = TrackStream::open(&path).unwrap();
        assert!(matches!(
            parse(&mut stream),
            Err(PlaybackError::InvalidFormat("non-PCM encoding"))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let (_dir, path) = write_fixture(b"RIFF1234WAVEfmt");
        let mut stream = TrackStream::open(&path).unwrap();
        assert!(matches!(
            parse(&mut stream),
            Err(PlaybackError::InvalidFormat("truncated WAV header"))
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_container_tag() {
        let mut bytes = wav_bytes(44_100, 2, 16, &[0u8; 8], &[]);
        bytes[0..4].copy_from_slice(b"FORM");
        let (_dir, path) = write_fixture(&bytes);
        let mut stream = TrackStream::open(&path).unwrap();
        assert!(matches!(
            parse(&mut stream),
            Err(PlaybackError::InvalidFormat("missing RIFF tag"))
        ));
    }

    #[test]
    fn test_parse_gives_up_past_scan_limit() {
        // A single filler chunk pushes the data chunk past the 10 KB bound.
        let filler = vec![0u8; 11_000];
        let bytes = wav_bytes(44_100, 2, 16, &[0u8; 8], &[(b"JUNK", &filler)]);
        let (_dir, path) = write_fixture(&bytes);
        let mut stream = TrackStream::open(&path).unwrap();
        assert!(matches!(
            parse(&mut stream),
            Err(PlaybackError::InvalidFormat(_))
        ));
    }
}
