//! In-memory AAC encoder with the buffer-queue shape of a platform codec.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{BufferInfo, EncoderFormat, MediaCodec, OutputEvent};
use crate::container::audio_specific_config;
use crate::errors::{RecorderError, Result};
use crate::types::{MediaParams, SampleFlags, TrackDescriptor, MIME_AAC};

const INPUT_BUFFERS: usize = 4;
const INPUT_BUFFER_BYTES: usize = 4096;

#[derive(Debug, Default)]
struct MonitorState {
    queued_inputs: AtomicU64,
    stopped: AtomicBool,
    released: AtomicBool,
}

/// Observes a [`FakeAacCodec`] after it has been boxed away.
#[derive(Debug, Clone)]
pub struct CodecMonitor(Arc<MonitorState>);

impl CodecMonitor {
    pub fn queued_inputs(&self) -> u64 {
        self.0.queued_inputs.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.0.released.load(Ordering::SeqCst)
    }
}

/// Emits its format first, then a 2-byte codec config buffer, then one
/// compressed frame per queued input.
pub struct FakeAacCodec {
    format: Option<(u32, u16, u32)>,
    started: bool,
    inputs: Vec<Vec<u8>>,
    free_inputs: VecDeque<usize>,
    pending: VecDeque<(Vec<u8>, i64, SampleFlags)>,
    outputs: Vec<Option<Vec<u8>>>,
    format_sent: bool,
    repeat_format: bool,
    fail_start: bool,
    monitor: Arc<MonitorState>,
}

impl FakeAacCodec {
    pub fn new() -> Self {
        Self {
            format: None,
            started: false,
            inputs: vec![vec![0u8; INPUT_BUFFER_BYTES]; INPUT_BUFFERS],
            free_inputs: (0..INPUT_BUFFERS).collect(),
            pending: VecDeque::new(),
            outputs: Vec::new(),
            format_sent: false,
            repeat_format: false,
            fail_start: false,
            monitor: Arc::new(MonitorState::default()),
        }
    }

    /// Announce the output format on every poll.
    pub fn with_repeated_format_change(mut self) -> Self {
        self.repeat_format = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn monitor(&self) -> CodecMonitor {
        CodecMonitor(self.monitor.clone())
    }

    fn descriptor(&self) -> Result<TrackDescriptor> {
        let (sample_rate, channels, bit_rate) = self
            .format
            .ok_or_else(|| RecorderError::InvalidState("Codec not configured".to_string()))?;
        Ok(TrackDescriptor::audio(
            MIME_AAC,
            sample_rate,
            channels,
            bit_rate,
            audio_specific_config(sample_rate, channels).to_vec(),
        ))
    }

    fn require_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(RecorderError::InvalidState("Codec not started".to_string()))
        }
    }
}

impl Default for FakeAacCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaCodec for FakeAacCodec {
    fn name(&self) -> &str {
        "fake-aac"
    }

    fn configure(&mut self, format: &EncoderFormat) -> Result<()> {
        match (&*format.mime, &format.media) {
            (
                MIME_AAC,
                MediaParams::Audio {
                    sample_rate,
                    channel_count,
                    bit_rate,
                },
            ) => {
                self.format = Some((*sample_rate, *channel_count, *bit_rate));
                Ok(())
            }
            _ => Err(RecorderError::ConfigurationRejected(format!(
                "fake-aac cannot encode {}",
                format.mime
            ))),
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(RecorderError::CapabilityUnavailable(
                "fake-aac refused to start".to_string(),
            ));
        }
        self.descriptor()?;
        self.started = true;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>> {
        self.require_started()?;
        Ok(self.free_inputs.pop_front())
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]> {
        self.inputs
            .get_mut(index)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| RecorderError::InvalidState(format!("No input buffer {}", index)))
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        len: usize,
        presentation_time_us: i64,
        flags: SampleFlags,
    ) -> Result<()> {
        self.require_started()?;
        if index >= self.inputs.len() || len > INPUT_BUFFER_BYTES {
            return Err(RecorderError::InvalidState(format!(
                "Bad input buffer {} ({} bytes)",
                index, len
            )));
        }
        // roughly 8:1, never below the 2-byte config size
        let mut frame = vec![0x21u8; (len / 8).max(4)];
        frame[1] = (presentation_time_us & 0xff) as u8;
        self.pending.push_back((frame, presentation_time_us, flags));
        self.free_inputs.push_back(index);
        self.monitor.queued_inputs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<OutputEvent> {
        self.require_started()?;
        if !self.format_sent || self.repeat_format {
            let first = !self.format_sent;
            self.format_sent = true;
            if first {
                let (sr, ch, _) = self.format.unwrap_or_default();
                self.pending
                    .push_front((audio_specific_config(sr, ch).to_vec(), 0, SampleFlags::CODEC_CONFIG));
            }
            return Ok(OutputEvent::FormatChanged(self.descriptor()?));
        }

        let Some((data, pts, flags)) = self.pending.pop_front() else {
            return Ok(OutputEvent::TryAgainLater);
        };
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: pts,
            flags,
        };
        let index = match self.outputs.iter().position(Option::is_none) {
            Some(free) => {
                self.outputs[free] = Some(data);
                free
            }
            None => {
                self.outputs.push(Some(data));
                self.outputs.len() - 1
            }
        };
        Ok(OutputEvent::Buffer { index, info })
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8]> {
        self.outputs
            .get(index)
            .and_then(|o| o.as_deref())
            .ok_or_else(|| RecorderError::InvalidState(format!("Output buffer {} not held", index)))
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<()> {
        match self.outputs.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(RecorderError::InvalidState(format!(
                "Output buffer {} released twice",
                index
            ))),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.monitor.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        self.pending.clear();
        self.outputs.clear();
        self.monitor.released.store(true, Ordering::SeqCst);
    }
}
