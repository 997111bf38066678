//! Capture-side fakes: encoder inputs, PCM sources, a video path and a
//! complete [`CaptureBackend`] that needs no display or sound device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use image::RgbaImage;

use super::fake_codec::FakeAacCodec;
use super::synthetic_data::{synthetic_avc_config, synthetic_frame};
use crate::audio::{pcm_frame_bytes, PcmSource};
use crate::codec::MediaCodec;
use crate::config::{AudioSettings, VideoSettings};
use crate::container::Mp4TrackWriter;
use crate::errors::{RecorderError, Result};
use crate::orchestrator::{CaptureBackend, VideoCapability};
use crate::render::{capture_feed, CaptureFeed, EncoderInput, RenderSurface, SoftwareSurface, VisibilityFlag};
use crate::types::{EncodedSample, SampleFlags, TrackDescriptor, MIME_AVC};

/// Encoder input that keeps every presented frame.
#[derive(Debug, Clone)]
pub struct FrameCollector {
    dimensions: (u32, u32),
    frames: Arc<Mutex<Vec<(RgbaImage, i64)>>>,
}

impl FrameCollector {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            dimensions: (width, height),
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn frames(&self) -> Vec<(RgbaImage, i64)> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EncoderInput for FrameCollector {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn queue_frame(&mut self, frame: &RgbaImage, presentation_time_us: i64) -> Result<()> {
        self.frames
            .lock()
            .map_err(|_| RecorderError::StreamIOFailure("Frame collector poisoned".to_string()))?
            .push((frame.clone(), presentation_time_us));
        Ok(())
    }
}

/// Digital silence, optionally limited to a number of reads and optionally
/// paced like a real device.
#[derive(Debug)]
pub struct SilenceSource {
    sample_rate: u32,
    channels: u16,
    buffers_left: Option<usize>,
    realtime: bool,
    running: bool,
    released: Arc<AtomicBool>,
}

impl SilenceSource {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            buffers_left: None,
            realtime: false,
            running: false,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver `count` buffers, then report no data.
    pub fn with_buffer_limit(mut self, count: usize) -> Self {
        self.buffers_left = Some(count);
        self
    }

    /// Sleep for the playback duration of every read.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Becomes true once the source has been released.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl PcmSource for SilenceSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn start(&mut self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(RecorderError::InvalidState("Source released".to_string()));
        }
        self.running = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.running {
            return Err(RecorderError::InvalidState("Source not started".to_string()));
        }
        match self.buffers_left.as_mut() {
            Some(0) => {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(0);
            }
            Some(left) => *left -= 1,
            None => {}
        }
        let frame = pcm_frame_bytes(self.channels);
        let n = (buf.len() / frame) * frame;
        buf[..n].fill(0);
        if self.realtime {
            let frames = (n / frame) as u64;
            std::thread::sleep(Duration::from_micros(
                frames * 1_000_000 / self.sample_rate.max(1) as u64,
            ));
        }
        Ok(n)
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn release(&mut self) {
        self.running = false;
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Stand-in H.264 path: records presented frame times and writes one
/// `video/avc` track with a small payload per frame when stopped.
pub struct FakeVideoCapability {
    settings: VideoSettings,
    output: PathBuf,
    frames: FrameCollector,
    started: bool,
    finished: bool,
}

impl FakeVideoCapability {
    pub fn new(settings: &VideoSettings, output: &Path) -> Self {
        Self {
            settings: settings.clone(),
            output: output.to_path_buf(),
            frames: FrameCollector::new(settings.width, settings.height),
            started: false,
            finished: false,
        }
    }

    fn write_track(&self) -> Result<()> {
        let descriptor = TrackDescriptor::video(
            MIME_AVC,
            self.settings.width,
            self.settings.height,
            self.settings.frame_rate,
            synthetic_avc_config(),
        );
        let mut writer = Mp4TrackWriter::create(&self.output)?;
        let track = writer.add_track(&descriptor)?;
        writer.start()?;
        let gop = (self.settings.frame_rate * self.settings.key_frame_interval_secs).max(1) as usize;
        for (n, (frame, pts)) in self.frames.frames().iter().enumerate() {
            let flags = if n % gop == 0 {
                SampleFlags::KEY_FRAME
            } else {
                SampleFlags::NONE
            };
            // tag with the top-left pixel so frames can be told apart
            let mut payload = vec![0u8, 0, 0, 4, 0x65];
            payload.extend_from_slice(&frame.get_pixel(0, 0).0);
            writer.write_sample(track, &EncodedSample::new(payload, *pts, flags))?;
        }
        writer.finish()?;
        Ok(())
    }
}

impl VideoCapability for FakeVideoCapability {
    fn input_surface(&mut self) -> Result<Box<dyn EncoderInput>> {
        Ok(Box::new(self.frames.clone()))
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started || self.finished {
            return Ok(());
        }
        self.finished = true;
        self.write_track()
    }

    fn release(&mut self) {
        self.started = false;
    }

    fn output_file(&self) -> &Path {
        &self.output
    }
}

/// A complete backend built from the fakes above and the software render
/// surface. Frames pushed into [`feed`](Self::feed) reach the recording.
pub struct SyntheticBackend {
    feed: CaptureFeed,
    frames: Receiver<RgbaImage>,
    audio: bool,
    video_available: bool,
    visibility: Mutex<Option<VisibilityFlag>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        let (feed, frames) = capture_feed();
        Self {
            feed,
            frames,
            audio: true,
            video_available: true,
            visibility: Mutex::new(None),
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.audio = false;
        self
    }

    /// Make `open_video` report the capability as unavailable.
    pub fn without_video(mut self) -> Self {
        self.video_available = false;
        self
    }

    pub fn feed(&self) -> CaptureFeed {
        self.feed.clone()
    }

    /// Push `count` synthetic frames of the given size.
    pub fn push_frames(&self, first: u64, count: u64, width: u32, height: u32) -> u64 {
        (first..first + count)
            .filter(|n| self.feed.push(synthetic_frame(*n, width, height)))
            .count() as u64
    }

    /// Simulate the mirrored region being shown or hidden.
    pub fn set_visible(&self, visible: bool) {
        if let Ok(guard) = self.visibility.lock() {
            if let Some(flag) = guard.as_ref() {
                flag.set(visible);
            }
        }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open_video(
        &self,
        settings: &VideoSettings,
        output: &Path,
        visibility: VisibilityFlag,
    ) -> Result<Box<dyn VideoCapability>> {
        if !self.video_available {
            return Err(RecorderError::CapabilityUnavailable(
                "Synthetic video disabled".to_string(),
            ));
        }
        if let Ok(mut guard) = self.visibility.lock() {
            *guard = Some(visibility);
        }
        Ok(Box::new(FakeVideoCapability::new(settings, output)))
    }

    fn open_render_surface(&self, input: Box<dyn EncoderInput>) -> Result<Box<dyn RenderSurface>> {
        Ok(Box::new(SoftwareSurface::new(self.frames.clone(), input)))
    }

    fn open_audio_source(&self, settings: &AudioSettings) -> Result<Option<Box<dyn PcmSource>>> {
        if !self.audio {
            return Ok(None);
        }
        Ok(Some(Box::new(
            SilenceSource::new(settings.sample_rate, settings.channel_count).realtime(),
        )))
    }

    fn open_audio_codec(&self) -> Result<Box<dyn MediaCodec>> {
        Ok(Box::new(FakeAacCodec::new()))
    }
}
