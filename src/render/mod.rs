//! Render bridge between the screen capture and the video encoder
//!
//! Submodules:
//! - `thread`: the single worker thread every rendering call runs on
//! - `bridge`: surface binding and the per-tick drive loop
//! - `placeholder`: the image shown while the capture is hidden
//! - `software`: CPU compositor implementing [`RenderSurface`]

mod bridge;
mod placeholder;
mod software;
mod thread;

pub use bridge::{DriveSummary, RenderBridge};
pub use placeholder::PlaceholderImage;
pub use software::{capture_feed, CaptureFeed, SoftwareSurface};
pub use thread::GpuThread;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;

use crate::errors::Result;

/// Whether the captured region is currently visible.
///
/// Written by the capture collaborator, read once per tick by the drive loop.
#[derive(Debug, Clone, Default)]
pub struct VisibilityFlag(Arc<AtomicBool>);

impl VisibilityFlag {
    pub fn new(visible: bool) -> Self {
        Self(Arc::new(AtomicBool::new(visible)))
    }

    pub fn set(&self, visible: bool) {
        self.0.store(visible, Ordering::Release);
    }

    pub fn is_visible(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Input side of a video encoder: frames are handed over with their
/// presentation time and encoded asynchronously.
pub trait EncoderInput: Send {
    /// Frame size the encoder was configured for
    fn dimensions(&self) -> (u32, u32);

    fn queue_frame(&mut self, frame: &RgbaImage, presentation_time_us: i64) -> Result<()>;
}

/// A rendering context bound to one thread.
///
/// Implementations are created on the render thread and never leave it, so
/// they need not be `Send`.
pub trait RenderSurface {
    /// Make the context current on the calling thread. Called once.
    fn bind_context(&mut self) -> Result<()>;

    fn load_placeholder(&mut self, placeholder: &PlaceholderImage) -> Result<()>;

    /// Wait up to `timeout` for the capture to deliver a new frame.
    fn await_new_frame(&mut self, timeout: Duration) -> Result<bool>;

    fn draw_captured_frame(&mut self) -> Result<()>;

    fn draw_placeholder(&mut self) -> Result<()>;

    /// Submit the drawn frame to the encoder input.
    fn present(&mut self, presentation_time_us: i64) -> Result<()>;

    fn release(&mut self);
}
