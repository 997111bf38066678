use std::path::Path;

use crossbeam_channel::Receiver;
use image::RgbaImage;

use super::capability::SoftwareVideoCapability;
use crate::audio::PcmSource;
use crate::codec::MediaCodec;
use crate::config::{AudioSettings, VideoSettings};
use crate::errors::{RecorderError, Result};
use crate::orchestrator::{CaptureBackend, VideoCapability};
use crate::render::{EncoderInput, RenderSurface, SoftwareSurface, VisibilityFlag};

type CodecFactory = Box<dyn Fn() -> Result<Box<dyn MediaCodec>> + Send + Sync>;

/// Desktop backend: frames arrive through a [`CaptureFeed`](crate::render::CaptureFeed),
/// video is encoded in software, internal audio comes from system loopback
/// (feature `audio`) when an audio codec has been supplied.
pub struct SoftwareBackend {
    frames: Receiver<RgbaImage>,
    audio_codec: Option<CodecFactory>,
    loopback_device: Option<String>,
}

impl SoftwareBackend {
    pub fn new(frames: Receiver<RgbaImage>) -> Self {
        Self {
            frames,
            audio_codec: None,
            loopback_device: None,
        }
    }

    /// Codec used for internal audio. Without one, recordings carry video only.
    pub fn with_audio_codec<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn MediaCodec>> + Send + Sync + 'static,
    {
        self.audio_codec = Some(Box::new(factory));
        self
    }

    /// Output device to loop back instead of the default one.
    pub fn with_loopback_device(mut self, name: impl Into<String>) -> Self {
        self.loopback_device = Some(name.into());
        self
    }
}

impl CaptureBackend for SoftwareBackend {
    fn open_video(
        &self,
        settings: &VideoSettings,
        output: &Path,
        _visibility: VisibilityFlag,
    ) -> Result<Box<dyn VideoCapability>> {
        Ok(Box::new(SoftwareVideoCapability::new(settings, output)?))
    }

    fn open_render_surface(&self, input: Box<dyn EncoderInput>) -> Result<Box<dyn RenderSurface>> {
        Ok(Box::new(SoftwareSurface::new(self.frames.clone(), input)))
    }

    #[cfg(feature = "audio")]
    fn open_audio_source(&self, settings: &AudioSettings) -> Result<Option<Box<dyn PcmSource>>> {
        if self.audio_codec.is_none() {
            return Ok(None);
        }
        let source = crate::audio::LoopbackSource::open(
            self.loopback_device.as_deref(),
            settings.sample_rate,
            settings.channel_count,
        )?;
        Ok(Some(Box::new(source)))
    }

    #[cfg(not(feature = "audio"))]
    fn open_audio_source(&self, _settings: &AudioSettings) -> Result<Option<Box<dyn PcmSource>>> {
        if let Some(device) = &self.loopback_device {
            log::warn!("Built without audio support, ignoring loopback device {}", device);
        }
        Ok(None)
    }

    fn open_audio_codec(&self) -> Result<Box<dyn MediaCodec>> {
        match &self.audio_codec {
            Some(factory) => factory(),
            None => Err(RecorderError::CapabilityUnavailable(
                "No audio codec configured".to_string(),
            )),
        }
    }
}
