//! AAC audio encoder
//!
//! # Spell: AudioEncodeAac
//! ^ Intent: encode 16-bit PCM into AAC-LC samples for single-track MP4 muxing
//!
//! @AudioEncoder
//!   : (codec, timeouts, clock) -> AudioEncoder
//!   ! prepare_before_encode
//!   ! descriptor_precedes_samples
//!   ! timestamps_from_shared_clock
//!   - resampling
//!   - channel_remixing

use crate::cancel::CancelToken;
use crate::codec::{EncodeSummary, EncoderFormat, EncoderTimeouts, MediaCodec, SampleEncoderLoop};
use crate::errors::{RecorderError, Result};
use crate::timing::CaptureClock;
use crate::types::{EncodedSample, TrackDescriptor, MIME_AAC};

/// AAC-LC encoder over a buffer-queue codec.
pub struct AudioEncoder {
    inner: SampleEncoderLoop,
    format: Option<EncoderFormat>,
}

impl AudioEncoder {
    pub fn new(codec: Box<dyn MediaCodec>, timeouts: EncoderTimeouts, clock: &CaptureClock) -> Self {
        Self {
            inner: SampleEncoderLoop::new(codec, timeouts, clock),
            format: None,
        }
    }

    /// Configure the codec. Must precede [`encode`](Self::encode).
    pub fn prepare(&mut self, sample_rate: u32, channel_count: u16, bit_rate: u32) -> Result<()> {
        if sample_rate == 0 || channel_count == 0 || bit_rate == 0 {
            return Err(RecorderError::ConfigurationRejected(format!(
                "Invalid AAC parameters: {}Hz, {} channel(s), {}bps",
                sample_rate, channel_count, bit_rate
            )));
        }
        let format = EncoderFormat::audio(MIME_AAC, sample_rate, channel_count, bit_rate);
        self.inner.configure(&format)?;
        self.format = Some(format);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.format.is_some()
    }

    pub fn release(self) {
        self.inner.release();
    }

    /// Run the encoder loop until `cancel` fires. Fails only if not prepared;
    /// loop faults are reported in the summary.
    pub fn encode<P, S, D>(
        self,
        cancel: &CancelToken,
        pull: P,
        on_sample: S,
        on_descriptor: D,
    ) -> Result<EncodeSummary>
    where
        P: FnMut(&mut [u8]) -> Result<usize>,
        S: FnMut(EncodedSample) -> Result<()>,
        D: FnMut(&TrackDescriptor) -> Result<()>,
    {
        if self.format.is_none() {
            return Err(RecorderError::ConfigurationRejected(
                "Audio encoder used before prepare".to_string(),
            ));
        }
        Ok(self.inner.run(cancel, pull, on_sample, on_descriptor))
    }
}
