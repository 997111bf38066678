//! Core data types shared by the encoders, the container layer and the
//! session orchestrator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

use crate::render::VisibilityFlag;

pub const MIME_AVC: &str = "video/avc";
pub const MIME_HEVC: &str = "video/hevc";
pub const MIME_AAC: &str = "audio/mp4a-latm";
pub const MIME_OPUS: &str = "audio/opus";

/// Per-sample flag bits. Values line up with the platform codec buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    pub const KEY_FRAME: SampleFlags = SampleFlags(1);
    pub const CODEC_CONFIG: SampleFlags = SampleFlags(2);
    pub const END_OF_STREAM: SampleFlags = SampleFlags(4);

    pub const fn from_bits(bits: u32) -> Self {
        SampleFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key_frame(self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: Self) -> Self {
        SampleFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One unit of compressed output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub payload: Bytes,
    pub presentation_time_us: i64,
    pub flags: SampleFlags,
    pub track_index: usize,
}

impl EncodedSample {
    pub fn new(payload: impl Into<Bytes>, presentation_time_us: i64, flags: SampleFlags) -> Self {
        Self {
            payload: payload.into(),
            presentation_time_us,
            flags,
            track_index: 0,
        }
    }

    pub fn with_track(mut self, track_index: usize) -> Self {
        self.track_index = track_index;
        self
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Kind-specific stream parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaParams {
    Video {
        width: u32,
        height: u32,
        frame_rate: u32,
    },
    Audio {
        sample_rate: u32,
        channel_count: u16,
        bit_rate: u32,
    },
}

/// Describes one elementary stream: its mime type, stream parameters and the
/// codec-specific configuration blob a decoder needs.
///
/// Emitted once per stream, before the first sample, and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub mime: String,
    pub media: MediaParams,
    pub codec_config: Bytes,
}

impl TrackDescriptor {
    pub fn video(
        mime: &str,
        width: u32,
        height: u32,
        frame_rate: u32,
        codec_config: impl Into<Bytes>,
    ) -> Self {
        Self {
            mime: mime.to_string(),
            media: MediaParams::Video {
                width,
                height,
                frame_rate,
            },
            codec_config: codec_config.into(),
        }
    }

    pub fn audio(
        mime: &str,
        sample_rate: u32,
        channel_count: u16,
        bit_rate: u32,
        codec_config: impl Into<Bytes>,
    ) -> Self {
        Self {
            mime: mime.to_string(),
            media: MediaParams::Audio {
                sample_rate,
                channel_count,
                bit_rate,
            },
            codec_config: codec_config.into(),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self.media, MediaParams::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.media, MediaParams::Audio { .. })
    }
}

impl fmt::Display for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.media {
            MediaParams::Video {
                width,
                height,
                frame_rate,
            } => write!(f, "{} {}x{}@{}", self.mime, width, height, frame_rate),
            MediaParams::Audio {
                sample_rate,
                channel_count,
                bit_rate,
            } => write!(
                f,
                "{} {}Hz x{} {}bps",
                self.mime, sample_rate, channel_count, bit_rate
            ),
        }
    }
}

/// Per-recording parameters handed to `ScreenRecorder::start`.
#[derive(Debug, Clone, Default)]
pub struct RecordingParams {
    /// Override for the configured published-file prefix
    pub file_prefix: Option<String>,
    /// Record video only even when internal audio is available
    pub disable_audio: bool,
}

/// Files and shared flags owned by one recording.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: String,
    pub video_file: PathBuf,
    pub audio_file: Option<PathBuf>,
    pub merged_file: PathBuf,
    pub visibility: VisibilityFlag,
}

impl RecordingSession {
    /// Intermediate files that must not outlive the session.
    pub fn intermediates(&self) -> Vec<PathBuf> {
        let mut files = vec![self.video_file.clone()];
        files.extend(self.audio_file.clone());
        files.push(self.merged_file.clone());
        files
    }
}
