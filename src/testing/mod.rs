//! Testing utilities for the recorder
//!
//! In-memory codecs, sources and a full capture backend so the pipeline
//! can be driven end to end without a display, sound device or encoder.

mod capture;
mod fake_codec;
pub mod synthetic_data;

pub use capture::{FakeVideoCapability, FrameCollector, SilenceSource, SyntheticBackend};
pub use fake_codec::{CodecMonitor, FakeAacCodec};
pub use synthetic_data::{synthetic_avc_config, synthetic_frame, synthetic_pcm};
