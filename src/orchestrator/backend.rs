use std::path::Path;

use crate::audio::PcmSource;
use crate::codec::MediaCodec;
use crate::config::{AudioSettings, VideoSettings};
use crate::errors::Result;
use crate::render::{EncoderInput, RenderSurface, VisibilityFlag};

/// Video encoder, muxer and screen mirror of one recording.
pub trait VideoCapability: Send {
    /// Encoder input the render bridge draws into. Called once, before `start`.
    fn input_surface(&mut self) -> Result<Box<dyn EncoderInput>>;

    fn start(&mut self) -> Result<()>;

    /// Stop encoding and finalize the output file.
    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);

    fn output_file(&self) -> &Path;
}

/// Platform factory for everything a recording needs.
pub trait CaptureBackend: Send + Sync {
    /// Open the video path writing to `output`. The backend keeps
    /// `visibility` updated while the mirrored region is shown or hidden.
    fn open_video(
        &self,
        settings: &VideoSettings,
        output: &Path,
        visibility: VisibilityFlag,
    ) -> Result<Box<dyn VideoCapability>>;

    /// Create the rendering context. Runs on the render thread.
    fn open_render_surface(&self, input: Box<dyn EncoderInput>) -> Result<Box<dyn RenderSurface>>;

    /// Internal audio capture, or `None` where the platform does not offer it.
    fn open_audio_source(&self, settings: &AudioSettings) -> Result<Option<Box<dyn PcmSource>>>;

    fn open_audio_codec(&self) -> Result<Box<dyn MediaCodec>>;
}
