//! Session orchestration
//!
//! # Spell: ScreenRecordingSession
//! ^ Intent: run one screen + internal audio recording from start to a published file
//!
//! @ScreenRecorder
//!   : RecordingParams -> published file
//!   ! one_session_at_a_time
//!   ! state_changes_are_observable
//!   ! intermediates_deleted_after_verified_publish
//!   ! any_failure_ends_in_aborted
//!   ! stop_is_idempotent
//!   - partial_output_published
//!   - blocking_on_async_runtime

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backend::{CaptureBackend, VideoCapability};
use super::state::SessionState;
use crate::audio::{AudioCaptureUnit, AudioOutcome};
use crate::cancel::CancelToken;
use crate::codec::EncoderTimeouts;
use crate::config::RecorderConfig;
use crate::container::Mp4TrackReader;
use crate::errors::{RecorderError, Result};
use crate::merge::merge_tracks;
use crate::render::{DriveSummary, PlaceholderImage, RenderBridge, VisibilityFlag};
use crate::storage::DurableStorage;
use crate::timing::CaptureClock;
use crate::types::{RecordingParams, RecordingSession};

/// How the capture loops of a session ended.
#[derive(Debug, Default)]
struct LoopResults {
    drive: Option<DriveSummary>,
    audio: Option<AudioOutcome>,
}

/// Everything a live session owns, shared between `start` and `stop`.
#[derive(Default)]
struct ActiveSession {
    session: Option<RecordingSession>,
    file_prefix: String,
    cancel: Option<CancelToken>,
    video: Option<Box<dyn VideoCapability>>,
    bridge: Option<RenderBridge>,
    audio_enabled: bool,
    loops_done: Option<watch::Receiver<bool>>,
    results: Option<LoopResults>,
}

impl ActiveSession {
    fn belongs_to(&self, session: &RecordingSession) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session.id)
    }
}

/// Resources built while `Starting`.
struct Prepared {
    video: Box<dyn VideoCapability>,
    bridge: RenderBridge,
    audio: Option<AudioCaptureUnit>,
}

/// Screen recorder driving one session at a time through
/// Idle -> Starting -> Recording -> Stopping -> Merging -> Done.
pub struct ScreenRecorder {
    config: RecorderConfig,
    backend: Arc<dyn CaptureBackend>,
    storage: Arc<dyn DurableStorage>,
    state: watch::Sender<SessionState>,
    active: Mutex<ActiveSession>,
}

impl ScreenRecorder {
    pub fn new(
        config: RecorderConfig,
        backend: Arc<dyn CaptureBackend>,
        storage: Arc<dyn DurableStorage>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            backend,
            storage,
            state,
            active: Mutex::new(ActiveSession::default()),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<RecordingSession> {
        self.lock().session.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ActiveSession> {
        // a poisoned lock only means a panicking test thread; the data is still usable
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> Result<SessionState> {
        let mut previous = None;
        let changed = self.state.send_if_modified(|current| {
            if from.contains(current) && current.can_transition_to(to) {
                previous = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });
        match previous {
            Some(prev) if changed => {
                log::info!("Recorder state {} -> {}", prev, to);
                Ok(prev)
            }
            _ => Err(RecorderError::InvalidState(format!(
                "Cannot move from {} to {}",
                self.state(),
                to
            ))),
        }
    }

    /// Begin a recording. Resolves once both capture loops have finished,
    /// which normally happens when [`stop`](Self::stop) is called.
    pub async fn start(&self, params: RecordingParams) -> Result<()> {
        self.config
            .validate()
            .map_err(RecorderError::ConfigurationRejected)?;

        let session = self.new_session(&params);
        let cancel = CancelToken::new();
        let audio_enabled = self.config.audio.enabled && !params.disable_audio;
        let previous = {
            // Starting and its cancel token become visible together
            let mut active = self.lock();
            self.transition(
                &[SessionState::Idle, SessionState::Done, SessionState::Aborted],
                SessionState::Starting,
            )?;
            std::mem::replace(
                &mut *active,
                ActiveSession {
                    session: Some(session.clone()),
                    file_prefix: params
                        .file_prefix
                        .clone()
                        .unwrap_or_else(|| self.config.storage.file_prefix.clone()),
                    cancel: Some(cancel.clone()),
                    audio_enabled,
                    ..ActiveSession::default()
                },
            )
        };
        drop(previous);
        log::info!("Starting recording {} (audio: {})", session.id, audio_enabled);

        let clock = CaptureClock::new();
        let prepared = {
            let backend = self.backend.clone();
            let config = self.config.clone();
            let session = session.clone();
            let clock = clock.clone();
            tokio::task::spawn_blocking(move || {
                prepare(backend, &config, &session, audio_enabled, &clock)
            })
            .await
            .map_err(|e| RecorderError::InvalidState(format!("Session setup panicked: {}", e)))
            .and_then(|r| r)
        };

        let prepared = match prepared {
            Ok(p) => p,
            Err(e) => {
                log::error!("Recording {} failed to start: {}", session.id, e);
                self.abort(&session);
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        self.with_session(&session, |active| active.loops_done = Some(done_rx));

        // stop() while Starting wins; tear down what was built, then leave Starting.
        if cancel.is_cancelled()
            || self
                .transition(&[SessionState::Starting], SessionState::Recording)
                .is_err()
        {
            log::warn!("Recording {} stopped before it began", session.id);
            release_prepared(prepared).await;
            self.abort(&session);
            return Ok(());
        }

        let Prepared {
            video,
            bridge,
            audio,
        } = prepared;
        let drive = bridge.drive(cancel.clone(), session.visibility.clone(), clock);
        let audio_task: Option<JoinHandle<Result<AudioOutcome>>> = audio.map(|unit| {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || unit.start(&cancel))
        });

        let mut slot = Some((video, bridge));
        self.with_session(&session, |active| {
            if let Some((video, bridge)) = slot.take() {
                active.video = Some(video);
                active.bridge = Some(bridge);
            }
        });
        if let Some((video, bridge)) = slot {
            log::warn!("Recording {} lost its slot, releasing the video path", session.id);
            cancel.cancel();
            release_video_path(Some(video), Some(bridge)).await;
        }

        let mut results = LoopResults::default();
        match drive {
            Ok(rx) => match rx.await {
                Ok(Ok(summary)) => results.drive = Some(summary),
                Ok(Err(e)) => log::error!("Render loop failed: {}", e),
                Err(_) => log::error!("Render thread dropped the drive loop"),
            },
            Err(e) => {
                log::error!("Render loop could not start: {}", e);
                cancel.cancel();
            }
        }
        if let Some(task) = audio_task {
            match task.await {
                Ok(Ok(outcome)) => results.audio = Some(outcome),
                Ok(Err(e)) => log::error!("Audio capture failed: {}", e),
                Err(e) => log::error!("Audio capture task panicked: {}", e),
            }
        }

        self.with_session(&session, |active| active.results = Some(results));
        let _ = done_tx.send(true);
        log::info!("Capture loops of {} finished", session.id);
        Ok(())
    }

    /// Stop the recording, merge and publish it. Returns the published file,
    /// or `None` when there was nothing to publish.
    pub async fn stop(&self) -> Result<Option<PathBuf>> {
        loop {
            match self.state() {
                SessionState::Done | SessionState::Aborted => return Ok(None),
                SessionState::Stopping | SessionState::Merging => {
                    log::warn!("Stop already in progress");
                    return Ok(None);
                }
                SessionState::Idle => {
                    if self
                        .transition(&[SessionState::Idle], SessionState::Aborted)
                        .is_ok()
                    {
                        return Ok(None);
                    }
                }
                SessionState::Starting => {
                    let cancel = self.lock().cancel.clone();
                    if let Some(cancel) = cancel {
                        cancel.cancel();
                    }
                    // start() releases what it built before leaving Starting
                    let mut states = self.subscribe();
                    let _ = states
                        .wait_for(|state| *state != SessionState::Starting)
                        .await;
                }
                SessionState::Recording => {
                    if self
                        .transition(&[SessionState::Recording], SessionState::Stopping)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        let (session, cancel, loops_done) = {
            let active = self.lock();
            (
                active.session.clone(),
                active.cancel.clone(),
                active.loops_done.clone(),
            )
        };
        let session = match session {
            Some(s) => s,
            None => {
                let _ = self.transition(&[SessionState::Stopping], SessionState::Aborted);
                return Err(RecorderError::InvalidState(
                    "Recording without a session".to_string(),
                ));
            }
        };

        match self.finish(&session, cancel, loops_done).await {
            Ok(published) => {
                delete_intermediates(&session);
                self.reset(&session);
                self.transition(&[SessionState::Merging], SessionState::Done)?;
                log::info!("Recording {} published to {:?}", session.id, published);
                Ok(Some(published))
            }
            Err(e) => {
                log::error!("Recording {} aborted ({}): {}", session.id, e.kind(), e);
                let (video, bridge) = {
                    let mut active = self.lock();
                    (active.video.take(), active.bridge.take())
                };
                release_video_path(video, bridge).await;
                self.abort(&session);
                Err(e)
            }
        }
    }

    async fn finish(
        &self,
        session: &RecordingSession,
        cancel: Option<CancelToken>,
        loops_done: Option<watch::Receiver<bool>>,
    ) -> Result<PathBuf> {
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut done) = loops_done {
            done.wait_for(|finished| *finished).await.map_err(|_| {
                RecorderError::InvalidState("Capture loops vanished before finishing".to_string())
            })?;
        }

        let (video, bridge, results, audio_enabled, prefix) = {
            let mut active = self.lock();
            (
                active.video.take(),
                active.bridge.take(),
                active.results.take().unwrap_or_default(),
                active.audio_enabled,
                active.file_prefix.clone(),
            )
        };
        let mut video =
            video.ok_or_else(|| RecorderError::InvalidState("No video path to stop".to_string()))?;

        let teardown = tokio::task::spawn_blocking(move || {
            let stopped = video.stop();
            video.release();
            let released = bridge.map(RenderBridge::release).unwrap_or(Ok(()));
            stopped.and(released)
        })
        .await
        .map_err(|e| RecorderError::InvalidState(format!("Teardown panicked: {}", e)))?;
        teardown?;

        if let Some(summary) = &results.drive {
            log::info!(
                "Video: {} captured, {} placeholder frames",
                summary.captured_frames,
                summary.placeholder_frames
            );
            if let Some(fault) = &summary.fault {
                log::warn!("Video stream ended early: {}", fault);
            }
        }

        self.transition(&[SessionState::Stopping], SessionState::Merging)?;

        let audio_file = match (&results.audio, &session.audio_file) {
            (Some(outcome), Some(file)) if outcome.track_written => Some(file.clone()),
            _ => {
                if audio_enabled {
                    log::warn!("No audio track recorded, publishing video only");
                }
                None
            }
        };

        let (final_file, expected_tracks) = match audio_file {
            Some(audio) => {
                let video_file = session.video_file.clone();
                let merged = session.merged_file.clone();
                let stats = tokio::task::spawn_blocking(move || {
                    merge_tracks(&audio, &video_file, &merged)
                })
                .await
                .map_err(|e| RecorderError::MergeFailure(format!("Merge task panicked: {}", e)))??;
                log::info!(
                    "Merged {} audio and {} video samples",
                    stats.audio_samples,
                    stats.video_samples
                );
                (session.merged_file.clone(), 2)
            }
            None => (session.video_file.clone(), 1),
        };

        let name = format!("{}_{}.mp4", prefix, Utc::now().timestamp_millis());
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || publish_verified(storage, &final_file, &name, expected_tracks))
            .await
            .map_err(|e| RecorderError::StreamIOFailure(format!("Publish task panicked: {}", e)))?
    }

    fn new_session(&self, params: &RecordingParams) -> RecordingSession {
        let id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.config.storage.work_dir();
        let with_audio = self.config.audio.enabled && !params.disable_audio;
        RecordingSession {
            video_file: dir.join(format!("{}_video.mp4", id)),
            audio_file: with_audio.then(|| dir.join(format!("{}_audio.mp4", id))),
            merged_file: dir.join(format!("{}_mix.mp4", id)),
            visibility: VisibilityFlag::new(true),
            id,
        }
    }

    /// Run `f` on the active slot if it still belongs to `session`.
    fn with_session<R>(
        &self,
        session: &RecordingSession,
        f: impl FnOnce(&mut ActiveSession) -> R,
    ) -> Option<R> {
        let mut active = self.lock();
        active.belongs_to(session).then(|| f(&mut *active))
    }

    /// Empty the slot of `session`. What it held is dropped after the lock is released.
    fn reset(&self, session: &RecordingSession) -> bool {
        let Some(stale) = self.with_session(session, std::mem::take) else {
            return false;
        };
        if let Some(cancel) = &stale.cancel {
            cancel.cancel();
        }
        drop(stale);
        true
    }

    /// Drop intermediates and land in `Aborted`.
    fn abort(&self, session: &RecordingSession) {
        delete_intermediates(session);
        if !self.reset(session) {
            log::warn!("Recording {} was already replaced, leaving state alone", session.id);
            return;
        }
        let _ = self.transition(
            &[
                SessionState::Idle,
                SessionState::Starting,
                SessionState::Recording,
                SessionState::Stopping,
                SessionState::Merging,
            ],
            SessionState::Aborted,
        );
    }
}

fn prepare(
    backend: Arc<dyn CaptureBackend>,
    config: &RecorderConfig,
    session: &RecordingSession,
    audio_enabled: bool,
    clock: &CaptureClock,
) -> Result<Prepared> {
    std::fs::create_dir_all(&config.storage.work_directory).map_err(|e| {
        RecorderError::StreamIOFailure(format!(
            "Failed to create work directory {:?}: {}",
            config.storage.work_directory, e
        ))
    })?;

    let mut video = backend.open_video(&config.video, &session.video_file, session.visibility.clone())?;
    let input = match video.input_surface() {
        Ok(input) => input,
        Err(e) => {
            video.release();
            return Err(e);
        }
    };

    let placeholder = PlaceholderImage::generate(config.video.width, config.video.height);
    let factory_backend = backend.clone();
    let bridge = match RenderBridge::bind(
        move || factory_backend.open_render_surface(input),
        placeholder,
        &config.render,
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            video.release();
            return Err(e);
        }
    };

    let audio = match session.audio_file.as_deref() {
        Some(file) if audio_enabled => match open_audio(&backend, config, file, clock) {
            Ok(unit) => unit,
            Err(e) => {
                video.release();
                let _ = bridge.release();
                return Err(e);
            }
        },
        _ => None,
    };

    if let Err(e) = video.start() {
        video.release();
        let _ = bridge.release();
        if let Some(unit) = audio {
            unit.release();
        }
        return Err(e);
    }

    Ok(Prepared {
        video,
        bridge,
        audio,
    })
}

/// Build the audio unit, or `None` when the platform cannot capture audio.
fn open_audio(
    backend: &Arc<dyn CaptureBackend>,
    config: &RecorderConfig,
    file: &Path,
    clock: &CaptureClock,
) -> Result<Option<AudioCaptureUnit>> {
    let source = match backend.open_audio_source(&config.audio) {
        Ok(Some(source)) => source,
        Ok(None) => {
            log::warn!("Internal audio capture not offered, recording video only");
            return Ok(None);
        }
        Err(RecorderError::CapabilityUnavailable(reason)) => {
            log::warn!("Internal audio unavailable ({}), recording video only", reason);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let codec = match backend.open_audio_codec() {
        Ok(codec) => codec,
        Err(RecorderError::CapabilityUnavailable(reason)) => {
            log::warn!("No audio encoder ({}), recording video only", reason);
            let mut source = source;
            source.release();
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut unit = AudioCaptureUnit::new(
        source,
        codec,
        file,
        &config.audio,
        EncoderTimeouts::from(&config.encoder),
        clock,
    );
    unit.prepare(
        config.audio.sample_rate,
        config.audio.channel_count,
        config.audio.bit_rate,
    )?;
    Ok(Some(unit))
}

async fn release_prepared(prepared: Prepared) {
    let Prepared {
        video,
        bridge,
        audio,
    } = prepared;
    if let Some(unit) = audio {
        unit.release();
    }
    release_video_path(Some(video), Some(bridge)).await;
}

async fn release_video_path(video: Option<Box<dyn VideoCapability>>, bridge: Option<RenderBridge>) {
    let released = tokio::task::spawn_blocking(move || {
        if let Some(mut video) = video {
            let _ = video.stop();
            video.release();
        }
        if let Some(bridge) = bridge {
            if let Err(e) = bridge.release() {
                log::warn!("Render bridge release failed: {}", e);
            }
        }
    })
    .await;
    if released.is_err() {
        log::error!("Video teardown panicked");
    }
}

fn publish_verified(
    storage: Arc<dyn DurableStorage>,
    file: &Path,
    name: &str,
    expected_tracks: usize,
) -> Result<PathBuf> {
    let published = storage.publish(file, name)?;
    let tracks = Mp4TrackReader::open(&published).map(|r| r.track_count());
    match tracks {
        Ok(n) if n == expected_tracks => Ok(published),
        Ok(n) => {
            let _ = std::fs::remove_file(&published);
            Err(RecorderError::StreamIOFailure(format!(
                "Published file has {} tracks, expected {}",
                n, expected_tracks
            )))
        }
        Err(e) => {
            let _ = std::fs::remove_file(&published);
            Err(RecorderError::StreamIOFailure(format!(
                "Published file is unreadable: {}",
                e
            )))
        }
    }
}

fn delete_intermediates(session: &RecordingSession) {
    for file in session.intermediates() {
        match std::fs::remove_file(&file) {
            Ok(()) => log::debug!("Deleted {:?}", file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to delete {:?}: {}", file, e),
        }
    }
}
