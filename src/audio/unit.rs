use std::cell::RefCell;
use std::path::{Path, PathBuf};

use super::encoder::AudioEncoder;
use super::source::{pcm_frame_bytes, PcmSource};
use crate::cancel::CancelToken;
use crate::codec::{EncoderTimeouts, MediaCodec};
use crate::config::AudioSettings;
use crate::container::Mp4TrackWriter;
use crate::errors::{RecorderError, Result};
use crate::timing::CaptureClock;
use crate::types::TrackDescriptor;

/// What the audio path left behind.
#[derive(Debug)]
pub struct AudioOutcome {
    pub file: PathBuf,
    /// True once a track was registered and the file finalized
    pub track_written: bool,
    pub samples: u64,
    /// Fault that ended the encoder loop early, if any
    pub fault: Option<RecorderError>,
}

/// Writer plus the track it registered, shared by the descriptor and sample
/// callbacks of one run.
struct TrackSink {
    writer: Mp4TrackWriter,
    track: Option<usize>,
    samples: u64,
}

impl TrackSink {
    fn on_descriptor(&mut self, descriptor: &TrackDescriptor) -> Result<()> {
        let track = self.writer.add_track(descriptor)?;
        self.writer.start()?;
        self.track = Some(track);
        Ok(())
    }
}

/// PCM source + AAC encoder loop + single-track MP4 writer.
pub struct AudioCaptureUnit {
    source: Box<dyn PcmSource>,
    encoder: AudioEncoder,
    output: PathBuf,
    read_buffer_bytes: usize,
}

impl AudioCaptureUnit {
    pub fn new(
        source: Box<dyn PcmSource>,
        codec: Box<dyn MediaCodec>,
        output: impl AsRef<Path>,
        settings: &AudioSettings,
        timeouts: EncoderTimeouts,
        clock: &CaptureClock,
    ) -> Self {
        let frame = pcm_frame_bytes(source.channel_count());
        // whole PCM frames only
        let read_buffer_bytes = (settings.read_buffer_bytes / frame).max(1) * frame;
        Self {
            source,
            encoder: AudioEncoder::new(codec, timeouts, clock),
            output: output.as_ref().to_path_buf(),
            read_buffer_bytes,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Configure the encoder. Must precede [`start`](Self::start).
    pub fn prepare(&mut self, sample_rate: u32, channel_count: u16, bit_rate: u32) -> Result<()> {
        if sample_rate != self.source.sample_rate() || channel_count != self.source.channel_count() {
            log::warn!(
                "Audio encoder {}Hz x{} differs from capture {}Hz x{}",
                sample_rate,
                channel_count,
                self.source.sample_rate(),
                self.source.channel_count()
            );
        }
        self.encoder.prepare(sample_rate, channel_count, bit_rate)
    }

    /// Tear down a unit that will never be started.
    pub fn release(self) {
        let AudioCaptureUnit {
            mut source,
            encoder,
            ..
        } = self;
        source.release();
        encoder.release();
    }

    /// Capture and encode until `cancel` fires. Blocks the calling thread.
    ///
    /// The source is stopped and released, then the file finalized, on
    /// every exit path.
    pub fn start(self, cancel: &CancelToken) -> Result<AudioOutcome> {
        let AudioCaptureUnit {
            mut source,
            encoder,
            output,
            read_buffer_bytes,
        } = self;

        if !encoder.is_prepared() {
            source.release();
            encoder.release();
            return Err(RecorderError::ConfigurationRejected(
                "Audio capture started before prepare".to_string(),
            ));
        }

        let writer = match Mp4TrackWriter::create(&output) {
            Ok(w) => w,
            Err(e) => {
                source.release();
                encoder.release();
                return Err(e);
            }
        };
        if let Err(e) = source.start() {
            source.release();
            encoder.release();
            return Err(RecorderError::CapabilityUnavailable(format!(
                "Audio capture could not start: {}",
                e
            )));
        }
        log::info!("Audio capture started, writing {:?}", output);

        let sink = RefCell::new(TrackSink {
            writer,
            track: None,
            samples: 0,
        });
        let summary = {
            let source = &mut source;
            encoder.encode(
                cancel,
                |buf| {
                    let len = buf.len().min(read_buffer_bytes);
                    source.read(&mut buf[..len])
                },
                |sample| {
                    let mut sink = sink.borrow_mut();
                    let track = sink.track.ok_or_else(|| {
                        RecorderError::StreamIOFailure("Sample arrived before track".to_string())
                    })?;
                    sink.writer.write_sample(track, &sample)?;
                    sink.samples += 1;
                    Ok(())
                },
                |descriptor| sink.borrow_mut().on_descriptor(descriptor),
            )
        };

        if let Err(e) = source.stop() {
            log::warn!("Audio source did not stop cleanly: {}", e);
        }
        source.release();

        let sink = sink.into_inner();
        let summary = summary?;
        let track_written = match sink.track {
            Some(_) => {
                sink.writer.finish()?;
                true
            }
            None => {
                log::warn!("Audio encoder never produced a format, no audio track written");
                false
            }
        };

        Ok(AudioOutcome {
            file: output,
            track_written,
            samples: sink.samples,
            fault: summary.fault,
        })
    }
}
