//! System audio loopback capture
//!
//! # Spell: LoopbackCapturePCM
//! ^ Intent: capture what the device is playing as 16-bit PCM with bounded memory
//!
//! @LoopbackSource
//!   : (device_name, sample_rate, channels) -> LoopbackSource
//!   ! produces_interleaved_i16_le_pcm
//!   ! bounded_buffer
//!   ! start_is_idempotent
//!   ! stop_is_idempotent
//!   - unbounded_memory_growth
//!   - blocking_callback
//!
//! Loopback is opened as an input stream on an output device, which only
//! some hosts (WASAPI) support. Elsewhere `open` reports the capability as
//! unavailable and recordings carry video only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use super::source::{pcm_frame_bytes, PcmSource};
use crate::errors::{RecorderError, Result};

/// Callback chunks buffered before new ones are dropped.
const MAX_BUFFER_CHUNKS: usize = 256;

/// Upper bound on how long `read` waits for the first chunk.
const READ_WAIT: Duration = Duration::from_millis(10);

/// Names of output devices loopback capture could be opened on.
pub fn list_loopback_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let mut names: Vec<String> = host
        .output_devices()
        .map_err(|e| {
            RecorderError::CapabilityUnavailable(format!("Failed to enumerate outputs: {}", e))
        })?
        .filter_map(|d| d.name().ok())
        .collect();
    names.sort();
    Ok(names)
}

/// Commands for the thread that owns the cpal stream (streams are not `Send`).
enum Control {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
}

pub struct LoopbackSource {
    control: Option<Sender<Control>>,
    thread: Option<JoinHandle<()>>,
    receiver: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    is_running: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
}

fn build_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    channels: u16,
    sender: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> Result<(Stream, StreamConfig)> {
    let host = cpal::default_host();
    let device = match device_name {
        None | Some("") | Some("default") => host.default_output_device().ok_or_else(|| {
            RecorderError::CapabilityUnavailable("No default output device".to_string())
        })?,
        Some(name) => host
            .output_devices()
            .map_err(|e| {
                RecorderError::CapabilityUnavailable(format!("Failed to enumerate outputs: {}", e))
            })?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| {
                RecorderError::CapabilityUnavailable(format!("Output device not found: {}", name))
            })?,
    };

    let supported = device.default_output_config().map_err(|e| {
        RecorderError::CapabilityUnavailable(format!("No supported output config: {}", e))
    })?;
    let actual_rate = if sample_rate == 48_000 || sample_rate == 44_100 {
        sample_rate
    } else {
        supported.sample_rate().0
    };
    let actual_channels = if channels == 1 || channels == 2 {
        channels
    } else {
        supported.channels()
    };
    let config = StreamConfig {
        channels: actual_channels,
        sample_rate: cpal::SampleRate(actual_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let mut bytes = Vec::with_capacity(data.len() * 2);
                for &s in data {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                // never block the audio callback
                let _ = sender.try_send(bytes);
            },
            move |err| {
                log::error!("Loopback capture error: {}", err);
            },
            None,
        )
        .map_err(|e| {
            RecorderError::CapabilityUnavailable(format!(
                "Loopback capture not supported on this host: {}",
                e
            ))
        })?;
    Ok((stream, config))
}

impl LoopbackSource {
    /// Open loopback on the named output device, or the default one.
    pub fn open(device_name: Option<&str>, sample_rate: u32, channels: u16) -> Result<Self> {
        let (sender, receiver) = bounded(MAX_BUFFER_CHUNKS);
        let (control_tx, control_rx) = unbounded::<Control>();
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let is_running = Arc::new(AtomicBool::new(false));
        let running = is_running.clone();
        let device_name = device_name.map(str::to_string);

        let thread = std::thread::Builder::new()
            .name("screenrec-loopback".to_string())
            .spawn(move || {
                let (stream, config) =
                    match build_stream(device_name.as_deref(), sample_rate, channels, sender, running) {
                        Ok(built) => built,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok((config.sample_rate.0, config.channels)));
                for command in control_rx.iter() {
                    match command {
                        Control::Play(reply) => {
                            let _ = reply.send(stream.play().map_err(|e| {
                                RecorderError::CapabilityUnavailable(format!(
                                    "Failed to start loopback: {}",
                                    e
                                ))
                            }));
                        }
                        Control::Pause(reply) => {
                            let _ = reply.send(stream.pause().map_err(|e| {
                                RecorderError::StreamIOFailure(format!(
                                    "Failed to stop loopback: {}",
                                    e
                                ))
                            }));
                        }
                    }
                }
                // control channel closed: the stream drops here
            })
            .map_err(|e| {
                RecorderError::CapabilityUnavailable(format!("Failed to spawn loopback thread: {}", e))
            })?;

        let (rate, chans) = ready_rx.recv().map_err(|_| {
            RecorderError::CapabilityUnavailable("Loopback thread exited during setup".to_string())
        })??;

        log::info!("Loopback capture opened: {}Hz x{}", rate, chans);
        Ok(Self {
            control: Some(control_tx),
            thread: Some(thread),
            receiver,
            pending: VecDeque::new(),
            is_running,
            sample_rate: rate,
            channels: chans,
        })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    fn command(&self, make: impl FnOnce(Sender<Result<()>>) -> Control) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| RecorderError::InvalidState("Loopback source released".to_string()))?;
        let (tx, rx) = bounded(1);
        control
            .send(make(tx))
            .map_err(|_| RecorderError::StreamIOFailure("Loopback thread is gone".to_string()))?;
        rx.recv()
            .map_err(|_| RecorderError::StreamIOFailure("Loopback thread is gone".to_string()))?
    }
}

impl PcmSource for LoopbackSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.command(Control::Play)?;
        self.is_running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            match self.receiver.recv_timeout(READ_WAIT) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RecorderError::StreamIOFailure(
                        "Loopback stream closed".to_string(),
                    ))
                }
            }
        }
        while self.pending.len() < buf.len() {
            match self.receiver.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => break,
            }
        }

        let frame = pcm_frame_bytes(self.channels);
        let n = (self.pending.len().min(buf.len()) / frame) * frame;
        for (dst, src) in buf[..n].iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.is_running.store(false, Ordering::Relaxed);
        self.command(Control::Pause)
    }

    fn release(&mut self) {
        let _ = self.stop();
        self.control = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Loopback thread panicked");
            }
        }
        self.pending.clear();
    }
}

impl Drop for LoopbackSource {
    fn drop(&mut self) {
        self.release();
    }
}
