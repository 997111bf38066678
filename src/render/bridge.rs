use std::time::Duration;

use tokio::sync::oneshot;

use super::{GpuThread, PlaceholderImage, RenderSurface, VisibilityFlag};
use crate::cancel::CancelToken;
use crate::config::RenderSettings;
use crate::errors::{RecorderError, Result};
use crate::timing::CaptureClock;

pub const RENDER_THREAD_NAME: &str = "screenrec-render";

/// Frame counts of one drive loop run.
#[derive(Debug, Default)]
pub struct DriveSummary {
    pub captured_frames: u64,
    pub placeholder_frames: u64,
    pub idle_ticks: u64,
    /// Set when a rendering fault ended the stream
    pub fault: Option<RecorderError>,
}

impl DriveSummary {
    pub fn frames_presented(&self) -> u64 {
        self.captured_frames + self.placeholder_frames
    }
}

enum Tick {
    Captured,
    Placeholder,
    Idle,
}

/// Owns the render thread and the surface bound on it.
pub struct RenderBridge {
    gpu: GpuThread,
    placeholder_interval: Duration,
    frame_wait: Duration,
}

impl RenderBridge {
    /// Spawn the render thread, create the surface there, bind its context
    /// once and prime the placeholder.
    pub fn bind<F>(factory: F, placeholder: PlaceholderImage, settings: &RenderSettings) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn RenderSurface>> + Send + 'static,
    {
        let gpu = GpuThread::spawn(RENDER_THREAD_NAME)?;
        gpu.install(factory)?;
        gpu.call(move |surface| {
            surface.bind_context()?;
            surface.load_placeholder(&placeholder)
        })?;
        log::info!(
            "Render bridge bound on '{}' (placeholder every {:?}, frame wait {:?})",
            gpu.name(),
            settings.placeholder_interval(),
            settings.frame_wait()
        );
        Ok(Self {
            gpu,
            placeholder_interval: settings.placeholder_interval(),
            frame_wait: settings.frame_wait(),
        })
    }

    /// Start the drive loop on the render thread. The receiver resolves when
    /// the loop ends (cancelled or faulted).
    pub fn drive(
        &self,
        cancel: CancelToken,
        visibility: VisibilityFlag,
        clock: CaptureClock,
    ) -> Result<oneshot::Receiver<Result<DriveSummary>>> {
        let (interval, wait) = (self.placeholder_interval, self.frame_wait);
        self.gpu.submit(move |surface| {
            Ok(drive_loop(surface, &cancel, &visibility, &clock, interval, wait))
        })
    }

    /// Release the surface on its thread and join the thread.
    pub fn release(mut self) -> Result<()> {
        let result = self.gpu.release_surface();
        self.gpu.shutdown();
        log::info!("Render bridge released");
        result
    }
}

fn drive_loop(
    surface: &mut dyn RenderSurface,
    cancel: &CancelToken,
    visibility: &VisibilityFlag,
    clock: &CaptureClock,
    placeholder_interval: Duration,
    frame_wait: Duration,
) -> DriveSummary {
    let mut summary = DriveSummary::default();
    let mut stamper = clock.stream();

    while !cancel.is_cancelled() {
        let tick = if visibility.is_visible() {
            match surface.await_new_frame(frame_wait) {
                Ok(true) => surface
                    .draw_captured_frame()
                    .and_then(|_| surface.present(stamper.next_us()))
                    .map(|_| Tick::Captured),
                Ok(false) => Ok(Tick::Idle),
                Err(e) => Err(e),
            }
        } else {
            let drawn = surface
                .draw_placeholder()
                .and_then(|_| surface.present(stamper.next_us()))
                .map(|_| Tick::Placeholder);
            std::thread::sleep(placeholder_interval);
            drawn
        };

        match tick {
            Ok(Tick::Captured) => summary.captured_frames += 1,
            Ok(Tick::Placeholder) => summary.placeholder_frames += 1,
            Ok(Tick::Idle) => summary.idle_ticks += 1,
            Err(e) => {
                log::error!("Render stream ended by fault ({}): {}", e.kind(), e);
                summary.fault = Some(e);
                break;
            }
        }
    }

    log::info!(
        "Drive loop finished: {} captured, {} placeholder frames",
        summary.captured_frames,
        summary.placeholder_frames
    );
    summary
}
