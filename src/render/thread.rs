use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use tokio::sync::oneshot;

use super::RenderSurface;
use crate::errors::{RecorderError, Result};

type SurfaceSlot = Option<Box<dyn RenderSurface>>;
type Job = Box<dyn FnOnce(&mut SurfaceSlot) + Send>;

/// Dedicated worker thread that owns the rendering surface.
///
/// Every rendering call is shipped to this thread as a job; the surface itself
/// is created there by a factory and never crosses threads.
pub struct GpuThread {
    name: String,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl GpuThread {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut slot: SurfaceSlot = None;
                for job in rx.iter() {
                    job(&mut slot);
                }
                if let Some(mut surface) = slot.take() {
                    log::debug!("Render thread exiting, releasing surface");
                    surface.release();
                }
            })
            .map_err(|e| {
                RecorderError::CapabilityUnavailable(format!(
                    "Failed to spawn render thread: {}",
                    e
                ))
            })?;
        log::debug!("Render thread '{}' started", name);
        Ok(Self {
            name: name.to_string(),
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| RecorderError::InvalidState("Render thread shut down".to_string()))?
            .send(job)
            .map_err(|_| RecorderError::StreamIOFailure("Render thread is gone".to_string()))
    }

    /// Create the surface on the worker thread. Replaces any previous one.
    pub fn install<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn RenderSurface>> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.send(Box::new(move |slot: &mut SurfaceSlot| {
            let result = factory().map(|surface| {
                if let Some(mut old) = slot.replace(surface) {
                    old.release();
                }
            });
            let _ = tx.send(result);
        }))?;
        rx.recv()
            .map_err(|_| RecorderError::StreamIOFailure("Render thread dropped a job".to_string()))?
    }

    /// Run `f` against the surface on the worker thread; the returned
    /// receiver resolves once it finishes.
    pub fn submit<R, F>(&self, f: F) -> Result<oneshot::Receiver<Result<R>>>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RenderSurface) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Box::new(move |slot: &mut SurfaceSlot| {
            let result = match slot.as_deref_mut() {
                Some(surface) => f(surface),
                None => Err(RecorderError::InvalidState(
                    "No render surface installed".to_string(),
                )),
            };
            let _ = tx.send(result);
        }))?;
        Ok(rx)
    }

    /// Blocking form of [`submit`](Self::submit). Must not be called from the worker thread.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RenderSurface) -> Result<R> + Send + 'static,
    {
        self.submit(f)?
            .blocking_recv()
            .map_err(|_| RecorderError::StreamIOFailure("Render thread dropped a job".to_string()))?
    }

    /// Release the surface on its thread.
    pub fn release_surface(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send(Box::new(move |slot: &mut SurfaceSlot| {
            if let Some(mut surface) = slot.take() {
                surface.release();
            }
            let _ = tx.send(());
        }))?;
        rx.recv()
            .map_err(|_| RecorderError::StreamIOFailure("Render thread dropped a job".to_string()))
    }

    /// Stop accepting jobs and join the worker.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Render thread '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
