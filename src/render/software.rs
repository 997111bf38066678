use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::{imageops, RgbaImage};

use super::{EncoderInput, PlaceholderImage, RenderSurface};
use crate::errors::{RecorderError, Result};

/// Frames queued between the screen mirror and the render thread.
const CAPTURE_QUEUE_FRAMES: usize = 4;

/// Producer end of the capture texture. Cloneable.
#[derive(Debug, Clone)]
pub struct CaptureFeed {
    tx: Sender<RgbaImage>,
}

impl CaptureFeed {
    /// Offer a captured frame. Returns false if it was dropped because the
    /// renderer is behind or gone.
    pub fn push(&self, frame: RgbaImage) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Capture queue full, dropping frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Bounded channel standing in for the capture texture.
pub fn capture_feed() -> (CaptureFeed, Receiver<RgbaImage>) {
    let (tx, rx) = bounded(CAPTURE_QUEUE_FRAMES);
    (CaptureFeed { tx }, rx)
}

/// CPU compositor: draws the latest captured frame or the placeholder into a
/// back buffer sized for the encoder and presents it to the encoder input.
pub struct SoftwareSurface {
    frames: Receiver<RgbaImage>,
    output: Box<dyn EncoderInput>,
    texture: Option<RgbaImage>,
    placeholder: Option<RgbaImage>,
    back_buffer: RgbaImage,
    bound: bool,
    released: bool,
}

impl SoftwareSurface {
    pub fn new(frames: Receiver<RgbaImage>, output: Box<dyn EncoderInput>) -> Self {
        let (width, height) = output.dimensions();
        Self {
            frames,
            output,
            texture: None,
            placeholder: None,
            back_buffer: RgbaImage::new(width, height),
            bound: false,
            released: false,
        }
    }

    fn ensure_bound(&self) -> Result<()> {
        if self.released {
            return Err(RecorderError::InvalidState(
                "Render surface already released".to_string(),
            ));
        }
        if !self.bound {
            return Err(RecorderError::InvalidState(
                "Render context not bound".to_string(),
            ));
        }
        Ok(())
    }
}

impl RenderSurface for SoftwareSurface {
    fn bind_context(&mut self) -> Result<()> {
        if self.released {
            return Err(RecorderError::InvalidState(
                "Cannot bind a released surface".to_string(),
            ));
        }
        self.bound = true;
        Ok(())
    }

    fn load_placeholder(&mut self, placeholder: &PlaceholderImage) -> Result<()> {
        self.ensure_bound()?;
        let (w, h) = self.back_buffer.dimensions();
        self.placeholder = Some(placeholder.scaled_to(w, h));
        Ok(())
    }

    fn await_new_frame(&mut self, timeout: Duration) -> Result<bool> {
        self.ensure_bound()?;
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => {
                self.texture = Some(frame);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::StreamIOFailure(
                "Screen capture stopped delivering frames".to_string(),
            )),
        }
    }

    fn draw_captured_frame(&mut self) -> Result<()> {
        self.ensure_bound()?;
        let texture = self.texture.as_ref().ok_or_else(|| {
            RecorderError::InvalidState("No captured frame to draw".to_string())
        })?;
        let (w, h) = self.back_buffer.dimensions();
        if texture.dimensions() == (w, h) {
            self.back_buffer.copy_from_slice(texture);
        } else {
            self.back_buffer = imageops::resize(texture, w, h, imageops::FilterType::Nearest);
        }
        Ok(())
    }

    fn draw_placeholder(&mut self) -> Result<()> {
        self.ensure_bound()?;
        let placeholder = self.placeholder.as_ref().ok_or_else(|| {
            RecorderError::InvalidState("Placeholder not loaded".to_string())
        })?;
        self.back_buffer.copy_from_slice(placeholder);
        Ok(())
    }

    fn present(&mut self, presentation_time_us: i64) -> Result<()> {
        self.ensure_bound()?;
        self.output.queue_frame(&self.back_buffer, presentation_time_us)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.bound = false;
            self.texture = None;
            self.placeholder = None;
            log::debug!("Software render surface released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FrameCollector;
    use image::Rgba;

    fn surface(w: u32, h: u32) -> (CaptureFeed, SoftwareSurface, FrameCollector) {
        let (feed, frames) = capture_feed();
        let collector = FrameCollector::new(w, h);
        let surface = SoftwareSurface::new(frames, Box::new(collector.clone()));
        (feed, surface, collector)
    }

    #[test]
    fn test_calls_before_bind_fail() {
        let (_feed, mut s, _) = surface(16, 16);
        assert!(s.draw_placeholder().is_err());
        assert!(s.present(0).is_err());
    }

    #[test]
    fn test_captured_frame_is_scaled_and_presented() {
        let (feed, mut s, collector) = surface(16, 8);
        s.bind_context().unwrap();
        assert!(feed.push(RgbaImage::from_pixel(32, 16, Rgba([10, 20, 30, 255]))));
        assert!(s.await_new_frame(Duration::from_millis(50)).unwrap());
        s.draw_captured_frame().unwrap();
        s.present(1234).unwrap();

        let frames = collector.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 1234);
        assert_eq!(frames[0].0.dimensions(), (16, 8));
        assert_eq!(*frames[0].0.get_pixel(3, 3), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_timeout_and_disconnect() {
        let (feed, mut s, _) = surface(8, 8);
        s.bind_context().unwrap();
        assert!(!s.await_new_frame(Duration::from_millis(5)).unwrap());
        drop(feed);
        assert!(s.await_new_frame(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_released_surface_rejects_calls() {
        let (_feed, mut s, _) = surface(8, 8);
        s.bind_context().unwrap();
        s.release();
        s.release();
        assert!(s.bind_context().is_err());
        assert!(s.draw_placeholder().is_err());
    }
}
