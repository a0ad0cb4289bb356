//! Desktop PCM sink backed by a cpal output stream.
//!
//! cpal streams are not `Send`, so a dedicated audio thread owns the device
//! and stream for their whole lifetime; `configure`/`enable`/`disable`
//! round-trip through a command channel, while `write` blocks directly on
//! the shared sample queue the output callback drains.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SupportedStreamConfig, SupportedStreamConfigRange};
use log::{debug, error, warn};

use crate::error::{PlaybackError, Result};
use crate::sink::{PcmSink, SinkFormat};

/// Queued output depth in interleaved samples (~190 ms of 44.1 kHz stereo).
/// Deep enough to ride out scheduling hiccups, shallow enough that volume
/// and seek changes land quickly.
const QUEUE_CAPACITY: usize = 16 * 1024;

struct SampleQueue {
    samples: Mutex<VecDeque<i16>>,
    space: Condvar,
    capacity: usize,
}

impl SampleQueue {
    fn new(capacity: usize) -> SampleQueue {
        SampleQueue {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Blocks until all of `pcm` is queued or the timeout elapses. Returns
    /// bytes accepted.
    fn write_blocking(&self, pcm: &[i16], timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut written = 0;
        let mut samples = self.samples.lock().expect("sample queue lock poisoned");
        while written < pcm.len() {
            while samples.len() >= self.capacity {
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return written * 2;
                        }
                        let (guard, _) = self
                            .space
                            .wait_timeout(samples, deadline - now)
                            .expect("sample queue lock poisoned");
                        samples = guard;
                    }
                    None => {
                        samples = self.space.wait(samples).expect("sample queue lock poisoned");
                    }
                }
            }
            let room = self.capacity - samples.len();
            let take = room.min(pcm.len() - written);
            samples.extend(&pcm[written..written + take]);
            written += take;
        }
        written * 2
    }

    fn clear(&self) {
        self.samples
            .lock()
            .expect("sample queue lock poisoned")
            .clear();
        self.space.notify_all();
    }

    /// Drains queued stereo frames into a device-shaped output buffer,
    /// filling silence on underrun. Extra device channels beyond the first
    /// two stay silent; a mono device gets the two channels averaged.
    fn fill_output<T: Copy>(
        &self,
        device_channels: usize,
        output: &mut [T],
        convert: impl Fn(i16) -> T,
        silence: T,
    ) {
        let mut samples = self.samples.lock().expect("sample queue lock poisoned");
        if device_channels == 0 {
            output.fill(silence);
            return;
        }
        for frame in output.chunks_mut(device_channels) {
            if device_channels == 1 {
                frame[0] = match (samples.pop_front(), samples.pop_front()) {
                    (Some(left), Some(right)) => {
                        convert(((i32::from(left) + i32::from(right)) / 2) as i16)
                    }
                    (Some(left), None) => convert(left),
                    _ => silence,
                };
                continue;
            }
            for (channel, slot) in frame.iter_mut().enumerate() {
                *slot = if channel < 2 {
                    samples.pop_front().map(&convert).unwrap_or(silence)
                } else {
                    silence
                };
            }
        }
        drop(samples);
        self.space.notify_all();
    }
}

enum SinkCommand {
    Configure(SinkFormat, mpsc::Sender<Result<()>>),
    Enable(mpsc::Sender<Result<()>>),
    Disable(mpsc::Sender<()>),
}

pub struct CpalSink {
    commands: mpsc::Sender<SinkCommand>,
    queue: Arc<SampleQueue>,
}

impl CpalSink {
    pub fn new() -> Result<CpalSink> {
        let queue = Arc::new(SampleQueue::new(QUEUE_CAPACITY));
        let (commands, command_receiver) = mpsc::channel();
        let thread_queue = queue.clone();
        thread::Builder::new()
            .name("cpal-sink".to_string())
            .spawn(move || audio_thread(command_receiver, thread_queue))
            .map_err(|err| PlaybackError::Sink(format!("failed to spawn audio thread: {err}")))?;
        Ok(CpalSink { commands, queue })
    }

    fn gone() -> PlaybackError {
        PlaybackError::Sink("audio thread is gone".to_string())
    }
}

impl PcmSink for CpalSink {
    fn configure(&mut self, format: SinkFormat) -> Result<()> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(SinkCommand::Configure(format, reply))
            .map_err(|_| CpalSink::gone())?;
        response.recv().map_err(|_| CpalSink::gone())?
    }

    fn enable(&mut self) -> Result<()> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(SinkCommand::Enable(reply))
            .map_err(|_| CpalSink::gone())?;
        response.recv().map_err(|_| CpalSink::gone())?
    }

    fn disable(&mut self) {
        let (reply, response) = mpsc::channel();
        if self.commands.send(SinkCommand::Disable(reply)).is_ok() {
            let _ = response.recv();
        }
    }

    fn write(&mut self, pcm: &[i16], timeout: Option<Duration>) -> usize {
        self.queue.write_blocking(pcm, timeout)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        // Closing the command channel ends the audio thread; unblock any
        // writer first.
        self.queue.clear();
    }
}

fn audio_thread(commands: mpsc::Receiver<SinkCommand>, queue: Arc<SampleQueue>) {
    let mut stream: Option<cpal::Stream> = None;
    while let Ok(command) = commands.recv() {
        match command {
            SinkCommand::Configure(format, reply) => {
                stream = None;
                queue.clear();
                let result = build_stream(format, queue.clone()).map(|built| {
                    stream = Some(built);
                });
                let _ = reply.send(result);
            }
            SinkCommand::Enable(reply) => {
                let result = match &stream {
                    Some(stream) => stream
                        .play()
                        .map_err(|err| PlaybackError::Sink(err.to_string())),
                    None => Err(PlaybackError::Sink(
                        "sink enabled before being configured".to_string(),
                    )),
                };
                let _ = reply.send(result);
            }
            SinkCommand::Disable(reply) => {
                if let Some(stream) = &stream {
                    if let Err(err) = stream.pause() {
                        debug!("pausing output stream failed: {}", err);
                    }
                }
                queue.clear();
                let _ = reply.send(());
            }
        }
    }
    debug!("cpal sink thread exiting");
}

fn build_stream(format: SinkFormat, queue: Arc<SampleQueue>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::Sink("no output device available".to_string()))?;
    let supported = device
        .supported_output_configs()
        .map_err(|err| PlaybackError::Sink(err.to_string()))?
        .collect::<Vec<_>>();
    let selected = choose_output_config(&supported, format)
        .ok_or_else(|| PlaybackError::Sink("no matching device config found".to_string()))?;
    if selected.sample_rate().0 != format.sample_rate_hz {
        warn!(
            "device cannot run {} Hz; using {} Hz",
            format.sample_rate_hz,
            selected.sample_rate().0
        );
    }
    let config: cpal::StreamConfig = selected.config();
    let device_channels = config.channels as usize;
    debug!(
        "output stream: {} Hz, {} ch, {:?}",
        config.sample_rate.0,
        config.channels,
        selected.sample_format()
    );

    let error_callback = |err| error!("audio stream error: {}", err);
    let stream = match selected.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                queue.fill_output(
                    device_channels,
                    output,
                    |sample| f32::from(sample) / 32_768.0,
                    0.0,
                );
            },
            error_callback,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |output: &mut [i16], _: &cpal::OutputCallbackInfo| {
                queue.fill_output(device_channels, output, |sample| sample, 0);
            },
            error_callback,
            None,
        ),
        other => {
            return Err(PlaybackError::Sink(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    };
    stream.map_err(|err| PlaybackError::Sink(err.to_string()))
}

fn choose_sample_rate(range: &SupportedStreamConfigRange, requested: u32) -> u32 {
    let min_rate = range.min_sample_rate().0;
    let max_rate = range.max_sample_rate().0;
    if (min_rate..=max_rate).contains(&requested) {
        requested
    } else {
        requested.clamp(min_rate, max_rate)
    }
}

/// Picks the supported configuration closest to the requested format:
/// stereo-capable first, then nearest sample rate, preferring float output.
fn choose_output_config(
    supported: &[SupportedStreamConfigRange],
    requested: SinkFormat,
) -> Option<SupportedStreamConfig> {
    let mut best: Option<(u64, SupportedStreamConfig)> = None;
    for range in supported {
        let rate = choose_sample_rate(range, requested.sample_rate_hz);
        let candidate = range.with_sample_rate(cpal::SampleRate(rate));
        let channel_penalty =
            u64::from(candidate.channels().abs_diff(requested.channel_count)) * 1_000;
        let rate_penalty = u64::from(candidate.sample_rate().0.abs_diff(requested.sample_rate_hz));
        let format_penalty = match candidate.sample_format() {
            cpal::SampleFormat::F32 => 0,
            cpal::SampleFormat::I16 => 20,
            _ => 200,
        };
        let score = channel_penalty + rate_penalty + format_penalty;
        match &best {
            Some((best_score, _)) if *best_score <= score => {}
            _ => best = Some((score, candidate)),
        }
    }
    best.map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use super::SampleQueue;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_write_blocking_times_out_when_full() {
        let queue = SampleQueue::new(8);
        assert_eq!(queue.write_blocking(&[1; 8], None), 16);
        // Full queue plus a timeout: nothing further is accepted.
        let accepted = queue.write_blocking(&[2; 4], Some(Duration::from_millis(20)));
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_fill_output_drains_and_pads_silence() {
        let queue = SampleQueue::new(16);
        queue.write_blocking(&[100, -100, 200, -200], None);
        let mut output = [9f32; 8];
        queue.fill_output(2, &mut output, |s| f32::from(s), 0.0);
        assert_eq!(&output[..4], &[100.0, -100.0, 200.0, -200.0]);
        assert_eq!(&output[4..], &[0.0; 4]);
    }

    #[test]
    fn test_fill_output_downmixes_for_mono_device() {
        let queue = SampleQueue::new(16);
        queue.write_blocking(&[100, 300], None);
        let mut output = [0i16; 2];
        queue.fill_output(1, &mut output, |s| s, 0);
        assert_eq!(output[0], 200);
        assert_eq!(output[1], 0);
    }

    #[test]
    fn test_fill_output_unblocks_writer() {
        let queue = Arc::new(SampleQueue::new(4));
        queue.write_blocking(&[1, 2, 3, 4], None);
        let writer_queue = queue.clone();
        let writer =
            std::thread::spawn(move || writer_queue.write_blocking(&[5, 6, 7, 8], None));
        std::thread::sleep(Duration::from_millis(20));
        let mut output = [0f32; 8];
        queue.fill_output(2, &mut output, |s| f32::from(s), 0.0);
        assert_eq!(writer.join().unwrap(), 8);
    }
}
