//! Persistent player preferences and defaults.

use std::path::Path;

use log::{debug, warn};

/// Root configuration persisted to `tonearm.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// Playback policy supplied to the engine at startup.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Startup volume, 0-100.
    #[serde(default = "default_volume")]
    pub volume: u8,
    /// Advance to the next catalog entry when a track ends naturally.
    #[serde(default)]
    pub continue_to_next: bool,
    /// Next/previous start playback immediately instead of only loading the
    /// track's metadata.
    #[serde(default = "default_true")]
    pub auto_play_on_navigation: bool,
    /// Read-ahead buffer for track streams, KiB.
    #[serde(default = "default_read_ahead_kib")]
    pub read_ahead_kib: usize,
}

impl Default for PlaybackConfig {
    fn default() -> PlaybackConfig {
        PlaybackConfig {
            volume: default_volume(),
            continue_to_next: false,
            auto_play_on_navigation: default_true(),
            read_ahead_kib: default_read_ahead_kib(),
        }
    }
}

fn default_volume() -> u8 {
    80
}

fn default_true() -> bool {
    true
}

fn default_read_ahead_kib() -> usize {
    16
}

impl Config {
    /// Loads the configuration, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load(path: &Path) -> Config {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!("no config at {}: {} (using defaults)", path.display(), err);
                return Config::default();
            }
        };
        match toml::from_str::<Config>(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "failed to parse config {}: {} (using defaults)",
                    path.display(),
                    err
                );
                Config::default()
            }
        }
    }

    pub fn save(&self, path: &Path) {
        let text = match toml::to_string(self) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize config: {}", err);
                return;
            }
        };
        if let Err(err) = std::fs::write(path, text) {
            warn!("failed to write config {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, PlaybackConfig};

    #[test]
    fn test_defaults() {
        let config = PlaybackConfig::default();
        assert_eq!(config.volume, 80);
        assert!(!config.continue_to_next);
        assert!(config.auto_play_on_navigation);
        assert_eq!(config.read_ahead_kib, 16);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[playback]\nvolume = 25\n").unwrap();
        assert_eq!(config.playback.volume, 25);
        assert!(!config.playback.continue_to_next);
        assert_eq!(config.playback.read_ahead_kib, 16);
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.playback.continue_to_next = true;
        config.playback.volume = 55;
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml"));
        assert_eq!(config, Config::default());
    }
}
