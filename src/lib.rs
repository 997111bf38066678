//! screenrec: screen and internal-audio recording pipeline
//!
//! This crate records a mirrored screen region together with the device's
//! internal audio and produces a single MP4 file.
//!
//! # Features
//! - Buffer-queue encoder loop with bounded, cancellable polling
//! - Render bridge keeping every rendering call on one thread
//! - Placeholder frames while the captured region is hidden
//! - Audio capture + encode into its own track file
//! - Session state machine with verified publishing
//! - Lossless merge of separate audio and video track files
//!
//! # Usage
//! Add this to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! screenrec = { version = "0.1", features = ["recording", "audio"] }
//! ```
//!
//! Then drive a recording:
//! ```rust,ignore
//! use std::sync::Arc;
//! use screenrec::{DirectoryStorage, RecorderConfig, RecordingParams, ScreenRecorder};
//!
//! let config = RecorderConfig::load_or_default();
//! let storage = Arc::new(DirectoryStorage::new(&config.storage.output_directory));
//! let recorder = Arc::new(ScreenRecorder::new(config, backend, storage));
//!
//! let running = recorder.clone();
//! tokio::spawn(async move { running.start(RecordingParams::default()).await });
//! // ...
//! let published = recorder.stop().await?;
//! ```
pub mod audio;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod container;
pub mod errors;
pub mod merge;
pub mod orchestrator;
pub mod render;
pub mod storage;
pub mod timing;
pub mod types;

#[cfg(feature = "recording")]
pub mod recording;

// Testing utilities - fakes and synthetic media for offline testing
pub mod testing;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use config::RecorderConfig;
pub use errors::{RecorderError, Result};
pub use merge::{merge_tracks, MergeStats};
pub use orchestrator::{CaptureBackend, ScreenRecorder, SessionState, VideoCapability};
pub use storage::{DirectoryStorage, DurableStorage};
pub use types::{EncodedSample, RecordingParams, RecordingSession, SampleFlags, TrackDescriptor};

/// Initialize logging for the recorder
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "screenrec=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        recording: cfg!(feature = "recording"),
        audio: cfg!(feature = "audio"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Software video path compiled in
    pub recording: bool,
    /// System audio loopback compiled in
    pub audio: bool,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "screenrec");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
    }
}
