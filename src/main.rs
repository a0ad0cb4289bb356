//! Command-driven front end for the playback engine.
//!
//! Scans a directory for WAV/MP3 tracks, opens the default audio device, and
//! drives playback from stdin commands while printing engine events.

mod bitstream;
mod catalog;
mod config;
mod controller;
mod cpal_sink;
mod engine;
mod error;
mod mp3;
mod protocol;
mod session;
mod sink;
mod wav;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread;

use log::{error, info, warn};

use catalog::Catalog;
use config::Config;
use controller::PlaybackController;
use cpal_sink::CpalSink;
use protocol::PlaybackEvent;

const USAGE: &str = "usage: tonearm <music-directory> [config.toml]

commands:
  ls             list tracks
  play <n|name>  play a track by index or file name
  pause          pause playback
  resume         resume playback
  stop           stop playback
  next           go to the next track
  prev           go to the previous track
  seek <pct>     seek to a percentage of the track
  vol <0-100>    set volume
  auto <on|off>  continue to the next track at end of track
  status         show playback state
  quit           exit";

fn main() {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.init();

    let mut args = std::env::args().skip(1);
    let Some(dir) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tonearm.toml"));
    let mut config = Config::load(&config_path);

    let catalog = Catalog::scan_directory(Path::new(&dir));
    if catalog.is_empty() {
        warn!("no playable tracks found in {}", dir);
    }

    let sink = match CpalSink::new() {
        Ok(sink) => sink,
        Err(err) => {
            error!("audio output unavailable: {}", err);
            std::process::exit(1);
        }
    };
    let controller = PlaybackController::new(catalog, Box::new(sink), &config.playback);

    let mut events = controller.subscribe();
    thread::spawn(move || loop {
        match events.blocking_recv() {
            Ok(event) => print_event(event),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event printer lagged by {} message(s)", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let argument = parts.next();
        match command {
            "ls" => {
                if controller.track_count() == 0 {
                    println!("(no tracks)");
                }
                for (index, title) in controller.track_titles().iter().enumerate() {
                    println!("{:3}  {}", index, title);
                }
            }
            "play" => match argument {
                Some(which) => match which.parse::<usize>() {
                    Ok(index) => controller.play_index(index),
                    Err(_) => controller.play(which),
                },
                None => println!("play what? (index or file name)"),
            },
            "pause" => controller.pause(),
            "resume" => controller.resume(),
            "stop" => controller.stop(),
            "next" => controller.next(),
            "prev" => controller.previous(),
            "seek" => match argument.and_then(|arg| arg.parse::<u8>().ok()) {
                Some(percent) => controller.seek_percent(percent),
                None => println!("seek takes a percentage (0-100)"),
            },
            "vol" => match argument.and_then(|arg| arg.parse::<u8>().ok()) {
                Some(volume) => controller.set_volume(volume),
                None => println!("vol takes a level (0-100)"),
            },
            "auto" => match argument {
                Some("on") => controller.set_continue_to_next(true),
                Some("off") => controller.set_continue_to_next(false),
                _ => println!("auto takes on or off"),
            },
            "status" => match controller.active_track() {
                Some(index) => println!(
                    "{:?}, track {}, {} PCM bytes played, volume {}",
                    controller.state(),
                    index,
                    controller.byte_cursor(),
                    controller.volume()
                ),
                None => println!("{:?}", controller.state()),
            },
            "quit" | "exit" => break,
            other => println!("unknown command: {other}\n{USAGE}"),
        }
    }

    controller.stop();

    // Persist the volume the user settled on.
    if config.playback.volume != controller.volume() {
        config.playback.volume = controller.volume();
        config.save(&config_path);
    }
    info!("bye");
}

fn print_event(event: PlaybackEvent) {
    match event {
        PlaybackEvent::TrackChanged {
            index,
            title,
            format_summary,
        } => println!("> [{index}] {title} ({format_summary})"),
        PlaybackEvent::Progress(update) => println!(
            "  {:3}%  {} / {}  ({})",
            update.percent, update.elapsed, update.total, update.remaining
        ),
        PlaybackEvent::FormatDiscovered {
            sample_rate_hz,
            channel_count,
            bitrate_kbps,
        } => info!(
            "format: {} Hz, {} ch, {} kbps",
            sample_rate_hz, channel_count, bitrate_kbps
        ),
        PlaybackEvent::StateChanged(state) => info!("state: {:?}", state),
        PlaybackEvent::TrackFinished { index } => info!("finished track {}", index),
        PlaybackEvent::Error(message) => error!("{}", message),
    }
}
