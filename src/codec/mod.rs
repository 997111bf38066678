//! Codec seam and the push/pull loop that drives it
//!
//! Submodules:
//! - `encoder_loop`: the sample encoder loop (input push, output drain)

mod encoder_loop;

pub use encoder_loop::{EncodeSummary, EncoderTimeouts, SampleEncoderLoop};

use std::time::Duration;

use crate::errors::Result;
use crate::types::{MediaParams, SampleFlags, TrackDescriptor};

/// Parameters an encoder is configured with before `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderFormat {
    pub mime: String,
    pub media: MediaParams,
}

impl EncoderFormat {
    pub fn audio(mime: &str, sample_rate: u32, channel_count: u16, bit_rate: u32) -> Self {
        Self {
            mime: mime.to_string(),
            media: MediaParams::Audio {
                sample_rate,
                channel_count,
                bit_rate,
            },
        }
    }
}

/// Metadata of one filled output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: SampleFlags,
}

/// Result of one output poll.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// Nothing ready within the timeout
    TryAgainLater,
    /// The codec announced its output format
    FormatChanged(TrackDescriptor),
    /// An output buffer is ready; it must be released after use
    Buffer { index: usize, info: BufferInfo },
}

/// A buffer-queue encoder, the shape of a platform hardware codec.
///
/// Input buffers are dequeued by index, filled in place and queued back with
/// a timestamp. Output buffers are dequeued by index and released after the
/// caller has copied them out. All waits are bounded by the given timeout.
pub trait MediaCodec: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, format: &EncoderFormat) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Index of a free input buffer, or `None` if none freed up in time
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        len: usize,
        presentation_time_us: i64,
        flags: SampleFlags,
    ) -> Result<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent>;

    fn output_buffer(&mut self, index: usize) -> Result<&[u8]>;

    fn release_output_buffer(&mut self, index: usize) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Free codec resources. Called exactly once, after `stop`.
    fn release(&mut self);
}
