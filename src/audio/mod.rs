//! Internal audio capture and encoding
//!
//! Submodules:
//! - `source`: the PCM source seam
//! - `encoder`: AAC encoder over a buffer-queue codec
//! - `unit`: source + encoder + single-track file, run as one blocking task
//! - `loopback`: cpal-based system audio loopback (feature `audio`)

mod encoder;
#[cfg(feature = "audio")]
mod loopback;
mod source;
mod unit;

pub use encoder::AudioEncoder;
#[cfg(feature = "audio")]
pub use loopback::{list_loopback_devices, LoopbackSource};
pub use source::{pcm_frame_bytes, PcmSource};
pub use unit::{AudioCaptureUnit, AudioOutcome};
