//! Configuration management for screenrec
//!
//! Loads and saves recorder settings (video and audio encoder parameters,
//! codec poll timeouts, render pacing, output locations) as TOML.

use crate::errors::RecorderError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub encoder: EncoderSettings,
    pub render: RenderSettings,
    pub storage: StorageSettings,
}

/// Video encoder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Target bitrate in bits per second
    pub bit_rate: u32,
    /// Seconds between key frames
    pub key_frame_interval_secs: u32,
}

/// Audio capture and encoder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Record internal audio when the platform offers it
    pub enabled: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Target bitrate in bits per second
    pub bit_rate: u32,
    /// Size of one PCM read in bytes
    pub read_buffer_bytes: usize,
}

/// Codec poll timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub input_timeout_us: u64,
    pub output_timeout_us: u64,
}

/// Render bridge pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Delay between placeholder frames while the capture is hidden
    pub placeholder_interval_ms: u64,
    /// Upper bound on a single wait for a captured frame
    pub frame_wait_ms: u64,
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Scratch directory for the per-stream intermediate files
    pub work_directory: String,
    /// Durable directory the finished recording is published to
    pub output_directory: String,
    /// Published files are named `{file_prefix}_{unix_millis}.mp4`
    pub file_prefix: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 60,
            bit_rate: 6_000_000,
            key_frame_interval_secs: 1,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 44_100,
            channel_count: 2,
            bit_rate: 192_000,
            read_buffer_bytes: 4096,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            input_timeout_us: 10_000,
            output_timeout_us: 10_000,
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            placeholder_interval_ms: 16,
            frame_wait_ms: 100,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            work_directory: std::env::temp_dir()
                .join("screenrec")
                .to_string_lossy()
                .into_owned(),
            output_directory: "./recordings".to_string(),
            file_prefix: "ScreenRecording".to_string(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            encoder: EncoderSettings::default(),
            render: RenderSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl EncoderSettings {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_micros(self.input_timeout_us)
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_micros(self.output_timeout_us)
    }
}

impl RenderSettings {
    pub fn placeholder_interval(&self) -> Duration {
        Duration::from_millis(self.placeholder_interval_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }
}

impl StorageSettings {
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_directory)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_directory)
    }
}

impl RecorderConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            RecorderError::ConfigurationRejected(format!("Failed to read config file: {}", e))
        })?;

        let config: RecorderConfig = toml::from_str(&contents).map_err(|e| {
            RecorderError::ConfigurationRejected(format!("Failed to parse config file: {}", e))
        })?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RecorderError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RecorderError::StreamIOFailure(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            RecorderError::ConfigurationRejected(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, toml_string).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Failed to write config file: {}", e))
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("screenrec.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        let v = &self.video;
        if v.width == 0 || v.height == 0 {
            return Err("Invalid video resolution".to_string());
        }
        if v.width % 2 != 0 || v.height % 2 != 0 {
            return Err("Video dimensions must be even".to_string());
        }
        if v.frame_rate == 0 || v.frame_rate > 240 {
            return Err("Invalid frame rate (must be 1-240)".to_string());
        }
        if v.bit_rate == 0 {
            return Err("Video bitrate must be positive".to_string());
        }

        let a = &self.audio;
        if !matches!(a.sample_rate, 8_000..=96_000) {
            return Err("Audio sample rate must be between 8000 and 96000".to_string());
        }
        if a.channel_count == 0 || a.channel_count > 2 {
            return Err("Audio channel count must be 1 or 2".to_string());
        }
        if a.bit_rate == 0 {
            return Err("Audio bitrate must be positive".to_string());
        }
        if a.read_buffer_bytes < 2 * a.channel_count as usize {
            return Err("Audio read buffer smaller than one PCM frame".to_string());
        }

        if self.encoder.input_timeout_us == 0 || self.encoder.output_timeout_us == 0 {
            return Err("Encoder timeouts must be positive".to_string());
        }
        if self.render.frame_wait_ms == 0 {
            return Err("Frame wait must be positive".to_string());
        }

        if self.storage.file_prefix.is_empty()
            || self
                .storage
                .file_prefix
                .contains(|c: char| c == '/' || c == '\\')
        {
            return Err("File prefix must be a plain, non-empty name".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RecorderConfig::default();
        assert_eq!((config.video.width, config.video.height), (1280, 720));
        assert_eq!(config.video.frame_rate, 60);
        assert_eq!(config.video.bit_rate, 6_000_000);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.channel_count, 2);
        assert_eq!(config.encoder.input_timeout(), Duration::from_millis(10));
        assert_eq!(config.render.placeholder_interval(), Duration::from_millis(16));
    }

    #[test]
    fn test_config_validation() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.video.width = 0;
        assert!(bad.validate().is_err());

        let mut odd = config.clone();
        odd.video.height = 719;
        assert!(odd.validate().is_err());

        let mut channels = config.clone();
        channels.audio.channel_count = 6;
        assert!(channels.validate().is_err());

        let mut prefix = config;
        prefix.storage.file_prefix = "a/b".to_string();
        assert!(prefix.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("screenrec.toml");

        let mut config = RecorderConfig::default();
        config.audio.enabled = false;
        config.video.frame_rate = 30;
        config.save_to_file(&config_path).unwrap();

        let loaded = RecorderConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.video, config.video);
        assert_eq!(loaded.audio, config.audio);
        assert_eq!(loaded.storage, config.storage);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = toml::to_string_pretty(&RecorderConfig::default()).unwrap();

        assert!(toml_string.contains("[video]"));
        assert!(toml_string.contains("[audio]"));
        assert!(toml_string.contains("[encoder]"));
        assert!(toml_string.contains("[render]"));
        assert!(toml_string.contains("[storage]"));
        assert!(toml_string.contains("placeholder_interval_ms"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RecorderConfig::load_from_file("nonexistent_screenrec.toml");
        assert_eq!(result.unwrap().video.frame_rate, 60);
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[video\nwidth = ").unwrap();
        assert!(matches!(
            RecorderConfig::load_from_file(&path),
            Err(RecorderError::ConfigurationRejected(_))
        ));
    }
}
