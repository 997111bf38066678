//! MP4 (ISO-BMFF) container support
//!
//! - `writer`: single- and two-track muxer used by the encode units and the merge tool
//! - `reader`: demuxer with per-sample access
//! - `sample_entry`: codec configuration <-> sample description mapping

mod boxes;
mod reader;
mod sample_entry;
mod writer;

pub use reader::Mp4TrackReader;
pub use sample_entry::{audio_specific_config, opus_identification};
pub use writer::{Mp4TrackWriter, WriterStats};

/// Movie and media timescale of files this crate writes (ticks per second).
pub const MICROS_TIMESCALE: u32 = 1_000_000;
