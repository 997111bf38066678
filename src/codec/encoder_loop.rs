//! Sample encoder loop
//!
//! # Spell: SampleEncodeLoop
//! ^ Intent: push raw input into a buffer-queue codec and drain encoded samples until cancelled
//!
//! @SampleEncoderLoop
//!
//! - pull(buffer) -> queued_input (only when bytes > 0)
//! - output_format -> descriptor (exactly once, before any sample)
//! - output_buffer -> encoded_sample (size > 1, not codec config)
//! - every output buffer released
//! - input timestamps strictly increasing
//! - faults logged, never propagated
//! - codec stopped and released on every exit path

use std::time::Duration;

use bytes::Bytes;

use super::{EncoderFormat, MediaCodec, OutputEvent};
use crate::cancel::CancelToken;
use crate::config::EncoderSettings;
use crate::errors::{RecorderError, Result};
use crate::timing::{CaptureClock, StreamStamper};
use crate::types::{EncodedSample, SampleFlags, TrackDescriptor};

/// Bounded waits for the two codec polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderTimeouts {
    pub input: Duration,
    pub output: Duration,
}

impl Default for EncoderTimeouts {
    fn default() -> Self {
        Self {
            input: Duration::from_micros(10_000),
            output: Duration::from_micros(10_000),
        }
    }
}

impl From<&EncoderSettings> for EncoderTimeouts {
    fn from(settings: &EncoderSettings) -> Self {
        Self {
            input: settings.input_timeout(),
            output: settings.output_timeout(),
        }
    }
}

/// What a finished loop produced. Diagnostic only.
#[derive(Debug, Default)]
pub struct EncodeSummary {
    pub descriptor: Option<TrackDescriptor>,
    pub inputs_queued: u64,
    pub samples_delivered: u64,
    pub bytes_delivered: u64,
    pub last_presentation_time_us: Option<i64>,
    /// The fault that ended the loop, if it did not end by cancellation
    pub fault: Option<RecorderError>,
}

impl EncodeSummary {
    pub fn descriptor_emitted(&self) -> bool {
        self.descriptor.is_some()
    }
}

fn release_after_fault(codec: &mut dyn MediaCodec, index: usize) {
    if let Err(e) = codec.release_output_buffer(index) {
        log::warn!(
            "Codec {} failed to release output buffer {}: {}",
            codec.name(),
            index,
            e
        );
    }
}

/// Stops and releases the codec when dropped.
struct CodecGuard {
    codec: Box<dyn MediaCodec>,
    started: bool,
}

impl Drop for CodecGuard {
    fn drop(&mut self) {
        if self.started {
            if let Err(e) = self.codec.stop() {
                log::warn!("Codec {} failed to stop cleanly: {}", self.codec.name(), e);
            }
        }
        self.codec.release();
        log::debug!("Codec {} released", self.codec.name());
    }
}

/// Drives one codec instance: push raw input, pull encoded output.
pub struct SampleEncoderLoop {
    codec: Box<dyn MediaCodec>,
    timeouts: EncoderTimeouts,
    stamper: StreamStamper,
}

impl SampleEncoderLoop {
    pub fn new(codec: Box<dyn MediaCodec>, timeouts: EncoderTimeouts, clock: &CaptureClock) -> Self {
        Self {
            codec,
            timeouts,
            stamper: clock.stream(),
        }
    }

    pub fn configure(&mut self, format: &EncoderFormat) -> Result<()> {
        log::info!(
            "Configuring codec {} for {} ({:?})",
            self.codec.name(),
            format.mime,
            format.media
        );
        self.codec.configure(format)
    }

    /// Give up a codec that was configured but never run.
    pub fn release(mut self) {
        self.codec.release();
        log::debug!("Codec {} released unused", self.codec.name());
    }

    /// Run until `cancel` fires or a fault ends the stream.
    ///
    /// `pull` fills the granted input buffer and returns the number of valid
    /// bytes; 0 means no data yet and the buffer is kept for the next round.
    /// `on_descriptor` is called once, before the first `on_sample`.
    pub fn run<P, S, D>(
        self,
        cancel: &CancelToken,
        mut pull: P,
        mut on_sample: S,
        mut on_descriptor: D,
    ) -> EncodeSummary
    where
        P: FnMut(&mut [u8]) -> Result<usize>,
        S: FnMut(EncodedSample) -> Result<()>,
        D: FnMut(&TrackDescriptor) -> Result<()>,
    {
        let SampleEncoderLoop {
            codec,
            timeouts,
            mut stamper,
        } = self;
        let mut guard = CodecGuard {
            codec,
            started: false,
        };
        let mut summary = EncodeSummary::default();

        if let Err(e) = guard.codec.start() {
            log::error!("Codec {} failed to start: {}", guard.codec.name(), e);
            summary.fault = Some(e);
            return summary;
        }
        guard.started = true;

        let mut held_input: Option<usize> = None;
        while !cancel.is_cancelled() {
            let step = push_input(
                guard.codec.as_mut(),
                &timeouts,
                &mut stamper,
                &mut held_input,
                &mut pull,
                &mut summary,
            )
            .and_then(|_| {
                drain_output(
                    guard.codec.as_mut(),
                    &timeouts,
                    &mut on_sample,
                    &mut on_descriptor,
                    &mut summary,
                )
            });

            if let Err(e) = step {
                log::error!(
                    "Encoder loop for {} ended with fault ({}): {}",
                    guard.codec.name(),
                    e.kind(),
                    e
                );
                summary.fault = Some(e);
                break;
            }
        }

        log::info!(
            "Encoder loop for {} finished: {} inputs, {} samples, {} bytes",
            guard.codec.name(),
            summary.inputs_queued,
            summary.samples_delivered,
            summary.bytes_delivered
        );
        summary
    }
}

fn push_input<P>(
    codec: &mut dyn MediaCodec,
    timeouts: &EncoderTimeouts,
    stamper: &mut StreamStamper,
    held_input: &mut Option<usize>,
    pull: &mut P,
    summary: &mut EncodeSummary,
) -> Result<()>
where
    P: FnMut(&mut [u8]) -> Result<usize>,
{
    let index = match held_input.take() {
        Some(index) => index,
        None => match codec.dequeue_input_buffer(timeouts.input)? {
            Some(index) => index,
            None => return Ok(()),
        },
    };

    let buffer = codec.input_buffer(index)?;
    let capacity = buffer.len();
    let read = pull(buffer)?;
    if read == 0 {
        *held_input = Some(index);
        return Ok(());
    }
    if read > capacity {
        return Err(RecorderError::StreamIOFailure(format!(
            "Pull reported {} bytes into a {} byte buffer",
            read, capacity
        )));
    }

    let pts = stamper.next_us();
    codec.queue_input_buffer(index, read, pts, SampleFlags::NONE)?;
    summary.inputs_queued += 1;
    Ok(())
}

fn drain_output<S, D>(
    codec: &mut dyn MediaCodec,
    timeouts: &EncoderTimeouts,
    on_sample: &mut S,
    on_descriptor: &mut D,
    summary: &mut EncodeSummary,
) -> Result<()>
where
    S: FnMut(EncodedSample) -> Result<()>,
    D: FnMut(&TrackDescriptor) -> Result<()>,
{
    match codec.dequeue_output_buffer(timeouts.output)? {
        OutputEvent::TryAgainLater => Ok(()),
        OutputEvent::FormatChanged(descriptor) => {
            if summary.descriptor.is_some() {
                return Err(RecorderError::ConfigurationRejected(format!(
                    "Codec {} changed its output format mid-stream",
                    codec.name()
                )));
            }
            log::info!("Codec {} output format: {}", codec.name(), descriptor);
            on_descriptor(&descriptor)?;
            summary.descriptor = Some(descriptor);
            Ok(())
        }
        OutputEvent::Buffer { index, info } => {
            let delivered = if info.size > 1 && !info.flags.is_codec_config() {
                if summary.descriptor.is_none() {
                    release_after_fault(codec, index);
                    return Err(RecorderError::StreamIOFailure(format!(
                        "Codec {} produced a sample before its output format",
                        codec.name()
                    )));
                }
                let Some(end) = info.offset.checked_add(info.size) else {
                    release_after_fault(codec, index);
                    return Err(RecorderError::StreamIOFailure(format!(
                        "Output buffer {} info overflows: offset {} size {}",
                        index, info.offset, info.size
                    )));
                };
                let data = codec.output_buffer(index)?;
                let available = data.len();
                let payload = data
                    .get(info.offset..end)
                    .map(Bytes::copy_from_slice);
                let Some(payload) = payload else {
                    release_after_fault(codec, index);
                    return Err(RecorderError::StreamIOFailure(format!(
                        "Output buffer {} holds {} bytes, info claims {}..{}",
                        index, available, info.offset, end
                    )));
                };
                Some(EncodedSample {
                    payload,
                    presentation_time_us: info.presentation_time_us,
                    flags: info.flags,
                    track_index: 0,
                })
            } else {
                None
            };
            codec.release_output_buffer(index)?;

            if let Some(sample) = delivered {
                summary.samples_delivered += 1;
                summary.bytes_delivered += sample.size() as u64;
                summary.last_presentation_time_us = Some(sample.presentation_time_us);
                on_sample(sample)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BufferInfo, OutputEvent};
    use crate::testing::FakeAacCodec;
    use crate::types::MIME_AAC;
    use std::sync::{Arc, Mutex};

    fn aac_loop(codec: FakeAacCodec) -> SampleEncoderLoop {
        let mut encoder = SampleEncoderLoop::new(
            Box::new(codec),
            EncoderTimeouts::default(),
            &CaptureClock::new(),
        );
        encoder
            .configure(&EncoderFormat::audio(MIME_AAC, 44_100, 2, 192_000))
            .unwrap();
        encoder
    }

    #[test]
    fn test_zero_byte_pull_never_queues() {
        let codec = FakeAacCodec::new();
        let monitor = codec.monitor();
        let cancel = CancelToken::new();
        let mut pulls = 0;

        let summary = aac_loop(codec).run(
            &cancel,
            |_buf| {
                pulls += 1;
                if pulls >= 50 {
                    cancel.cancel();
                }
                Ok(0)
            },
            |_| Ok(()),
            |_| Ok(()),
        );

        assert!(summary.fault.is_none());
        assert_eq!(summary.inputs_queued, 0);
        assert_eq!(monitor.queued_inputs(), 0);
        assert!(monitor.released());
    }

    #[test]
    fn test_descriptor_before_samples() {
        let codec = FakeAacCodec::new();
        let cancel = CancelToken::new();
        let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let (ev_s, ev_d) = (events.clone(), events.clone());
        let mut pulls = 0;

        let summary = aac_loop(codec).run(
            &cancel,
            |buf| {
                pulls += 1;
                if pulls >= 40 {
                    cancel.cancel();
                }
                buf.fill(0);
                Ok(buf.len())
            },
            move |_| {
                ev_s.lock().unwrap().push("sample");
                Ok(())
            },
            move |_| {
                ev_d.lock().unwrap().push("descriptor");
                Ok(())
            },
        );

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&"descriptor"));
        assert_eq!(events.iter().filter(|e| **e == "descriptor").count(), 1);
        assert!(summary.samples_delivered > 0);
    }

    #[test]
    fn test_sink_fault_ends_loop_and_releases() {
        let codec = FakeAacCodec::new();
        let monitor = codec.monitor();
        let cancel = CancelToken::new();

        let summary = aac_loop(codec).run(
            &cancel,
            |buf| Ok(buf.len()),
            |_| Err(RecorderError::StreamIOFailure("disk full".into())),
            |_| Ok(()),
        );

        assert!(matches!(
            summary.fault,
            Some(RecorderError::StreamIOFailure(_))
        ));
        assert!(monitor.stopped());
        assert!(monitor.released());
    }

    #[test]
    fn test_second_format_change_is_a_fault() {
        let codec = FakeAacCodec::new().with_repeated_format_change();
        let cancel = CancelToken::new();
        let mut descriptors = 0;

        let summary = aac_loop(codec).run(
            &cancel,
            |buf| Ok(buf.len()),
            |_| Ok(()),
            |_| {
                descriptors += 1;
                Ok(())
            },
        );

        assert_eq!(descriptors, 1);
        assert!(matches!(
            summary.fault,
            Some(RecorderError::ConfigurationRejected(_))
        ));
    }

    /// Announces a format, then one output buffer with impossible bounds.
    struct OverflowingCodec {
        output: Vec<u8>,
        polls: usize,
        releases: Arc<Mutex<Vec<usize>>>,
    }

    impl MediaCodec for OverflowingCodec {
        fn name(&self) -> &str {
            "overflowing"
        }
        fn configure(&mut self, _: &EncoderFormat) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn dequeue_input_buffer(&mut self, _: Duration) -> Result<Option<usize>> {
            Ok(None)
        }
        fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]> {
            Err(RecorderError::InvalidState(format!("No input buffer {}", index)))
        }
        fn queue_input_buffer(&mut self, _: usize, _: usize, _: i64, _: SampleFlags) -> Result<()> {
            Ok(())
        }
        fn dequeue_output_buffer(&mut self, _: Duration) -> Result<OutputEvent> {
            self.polls += 1;
            Ok(match self.polls {
                1 => OutputEvent::FormatChanged(TrackDescriptor::audio(
                    MIME_AAC,
                    44_100,
                    2,
                    192_000,
                    vec![0x12u8, 0x10],
                )),
                2 => OutputEvent::Buffer {
                    index: 3,
                    info: BufferInfo {
                        offset: usize::MAX - 2,
                        size: 8,
                        presentation_time_us: 0,
                        flags: SampleFlags::NONE,
                    },
                },
                _ => OutputEvent::TryAgainLater,
            })
        }
        fn output_buffer(&mut self, _: usize) -> Result<&[u8]> {
            Ok(&self.output)
        }
        fn release_output_buffer(&mut self, index: usize) -> Result<()> {
            self.releases.lock().unwrap().push(index);
            Err(RecorderError::InvalidState("already released".into()))
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn release(&mut self) {}
    }

    #[test]
    fn test_overflowing_buffer_info_is_a_fault() {
        let releases = Arc::new(Mutex::new(Vec::new()));
        let codec = OverflowingCodec {
            output: vec![0u8; 16],
            polls: 0,
            releases: releases.clone(),
        };
        let encoder = SampleEncoderLoop::new(
            Box::new(codec),
            EncoderTimeouts::default(),
            &CaptureClock::new(),
        );
        let mut samples = 0;

        let summary = encoder.run(
            &CancelToken::new(),
            |_| Ok(0),
            |_| {
                samples += 1;
                Ok(())
            },
            |_| Ok(()),
        );

        assert!(matches!(
            summary.fault,
            Some(RecorderError::StreamIOFailure(_))
        ));
        assert_eq!(samples, 0);
        // the failed release is logged, not fatal
        assert_eq!(*releases.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_start_failure_still_releases() {
        let codec = FakeAacCodec::new().failing_start();
        let monitor = codec.monitor();
        let summary = aac_loop(codec).run(&CancelToken::new(), |_| Ok(0), |_| Ok(()), |_| Ok(()));
        assert!(summary.fault.is_some());
        assert!(!monitor.stopped());
        assert!(monitor.released());
    }
}
