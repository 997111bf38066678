//! Software video path: openh264 encoding and muxide MP4 muxing on a
//! dedicated encoder thread.
//!
//! # Spell: SoftwareVideoPath
//! ^ Intent: turn presented frames into a finalized single-track H.264 file
//!
//! @SoftwareVideoCapability
//!   : (VideoSettings, output) -> VideoCapability
//!   ! first_sample_is_keyframe
//!   ! timestamps_relative_to_first_frame
//!   ! file_finalized_on_stop
//!   - render_thread_blocked_by_encoder

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbaImage;
use muxide::api::{Metadata, MuxerBuilder, VideoCodec};

use super::encoder::H264Encoder;
use crate::config::VideoSettings;
use crate::errors::{RecorderError, Result};
use crate::orchestrator::VideoCapability;
use crate::render::EncoderInput;

/// Frames the render thread may run ahead of the encoder.
const ENCODER_QUEUE_FRAMES: usize = 8;

enum EncoderMsg {
    Frame(RgbaImage, i64),
    Finish,
}

/// What the encoder thread produced.
#[derive(Debug, Clone, Default)]
pub struct VideoStats {
    pub video_frames: u64,
    pub dropped_frames: u64,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

/// Encoder input handed to the render surface.
struct EncoderFeed {
    tx: Sender<EncoderMsg>,
    dimensions: (u32, u32),
}

impl EncoderInput for EncoderFeed {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn queue_frame(&mut self, frame: &RgbaImage, presentation_time_us: i64) -> Result<()> {
        match self
            .tx
            .try_send(EncoderMsg::Frame(frame.clone(), presentation_time_us))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::debug!("Encoder behind, dropping frame at {}us", presentation_time_us);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(RecorderError::StreamIOFailure(
                "Video encoder has stopped".to_string(),
            )),
        }
    }
}

pub struct SoftwareVideoCapability {
    settings: VideoSettings,
    output: PathBuf,
    tx: Sender<EncoderMsg>,
    rx: Option<Receiver<EncoderMsg>>,
    worker: Option<JoinHandle<Result<VideoStats>>>,
    stats: Option<VideoStats>,
}

impl SoftwareVideoCapability {
    pub fn new(settings: &VideoSettings, output: impl AsRef<Path>) -> Result<Self> {
        if settings.width % 2 != 0 || settings.height % 2 != 0 || settings.frame_rate == 0 {
            return Err(RecorderError::ConfigurationRejected(format!(
                "Unsupported video format {}x{}@{}",
                settings.width, settings.height, settings.frame_rate
            )));
        }
        let (tx, rx) = bounded(ENCODER_QUEUE_FRAMES);
        Ok(Self {
            settings: settings.clone(),
            output: output.as_ref().to_path_buf(),
            tx,
            rx: Some(rx),
            worker: None,
            stats: None,
        })
    }

    /// Stats of the finalized file, once stopped.
    pub fn stats(&self) -> Option<&VideoStats> {
        self.stats.as_ref()
    }
}

impl VideoCapability for SoftwareVideoCapability {
    fn input_surface(&mut self) -> Result<Box<dyn EncoderInput>> {
        Ok(Box::new(EncoderFeed {
            tx: self.tx.clone(),
            dimensions: (self.settings.width, self.settings.height),
        }))
    }

    fn start(&mut self) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| RecorderError::InvalidState("Video path already started".to_string()))?;

        let file = File::create(&self.output).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Failed to create {:?}: {}", self.output, e))
        })?;
        let encoder = H264Encoder::new(self.settings.width, self.settings.height)?;
        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(
                VideoCodec::H264,
                self.settings.width,
                self.settings.height,
                f64::from(self.settings.frame_rate),
            )
            .with_fast_start(false)
            .with_metadata(Metadata::new().with_current_time())
            .build()
            .map_err(|e| RecorderError::ConfigurationRejected(format!("Failed to create muxer: {}", e)))?;

        let gop = u64::from(self.settings.frame_rate * self.settings.key_frame_interval_secs.max(1));
        let worker = std::thread::Builder::new()
            .name("screenrec-h264".to_string())
            .spawn(move || encode_frames(rx, encoder, muxer, gop))
            .map_err(|e| {
                RecorderError::CapabilityUnavailable(format!("Failed to spawn encoder thread: {}", e))
            })?;
        self.worker = Some(worker);
        log::info!(
            "Video encoder started: {}x{}@{} -> {:?}",
            self.settings.width,
            self.settings.height,
            self.settings.frame_rate,
            self.output
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // blocks behind queued frames so none are lost
        let _ = self.tx.send(EncoderMsg::Finish);
        let stats = worker
            .join()
            .map_err(|_| RecorderError::StreamIOFailure("Video encoder thread panicked".to_string()))??;
        log::info!(
            "Video finalized: {} frames ({} dropped), {:.2}s, {} bytes",
            stats.video_frames,
            stats.dropped_frames,
            stats.duration_secs,
            stats.bytes_written
        );
        self.stats = Some(stats);
        Ok(())
    }

    fn release(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Video encoder stopped with error during release: {}", e);
            }
        }
        self.rx = None;
    }

    fn output_file(&self) -> &Path {
        &self.output
    }
}

fn encode_frames(
    rx: Receiver<EncoderMsg>,
    mut encoder: H264Encoder,
    mut muxer: muxide::api::Muxer<BufWriter<File>>,
    gop: u64,
) -> Result<VideoStats> {
    let mut first_pts: Option<i64> = None;
    let mut written = 0u64;
    let mut dropped = 0u64;

    for msg in rx.iter() {
        let (frame, pts_us) = match msg {
            EncoderMsg::Frame(frame, pts) => (frame, pts),
            EncoderMsg::Finish => break,
        };
        if gop > 0 && encoder.frame_count() % gop == 0 {
            encoder.force_keyframe();
        }
        let encoded = encoder.encode_rgba(&frame)?;
        if encoded.data.is_empty() || (written == 0 && !encoded.is_keyframe) {
            dropped += 1;
            continue;
        }
        let base = *first_pts.get_or_insert(pts_us);
        let pts_secs = (pts_us - base) as f64 / 1_000_000.0;
        muxer
            .write_video(pts_secs, &encoded.data, encoded.is_keyframe)
            .map_err(|e| RecorderError::StreamIOFailure(format!("Failed to mux frame: {}", e)))?;
        written += 1;
    }

    let stats = muxer
        .finish_with_stats()
        .map_err(|e| RecorderError::StreamIOFailure(format!("Failed to finalize video: {}", e)))?;
    Ok(VideoStats {
        video_frames: stats.video_frames,
        dropped_frames: dropped,
        duration_secs: stats.duration_secs,
        bytes_written: stats.bytes_written,
    })
}
