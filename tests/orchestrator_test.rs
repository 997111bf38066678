//! Session lifecycle against the synthetic backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use screenrec::audio::PcmSource;
use screenrec::codec::MediaCodec;
use screenrec::config::{
    AudioSettings, RecorderConfig, RenderSettings, StorageSettings, VideoSettings,
};
use screenrec::container::Mp4TrackReader;
use screenrec::render::{EncoderInput, RenderSurface, VisibilityFlag};
use screenrec::testing::SyntheticBackend;
use screenrec::types::{MIME_AAC, MIME_AVC};
use screenrec::{
    CaptureBackend, DirectoryStorage, DurableStorage, RecorderError, RecordingParams,
    ScreenRecorder, SessionState, VideoCapability,
};

const W: u32 = 64;
const H: u32 = 48;

fn test_config(root: &Path) -> RecorderConfig {
    RecorderConfig {
        video: VideoSettings {
            width: W,
            height: H,
            frame_rate: 30,
            ..VideoSettings::default()
        },
        render: RenderSettings {
            placeholder_interval_ms: 5,
            frame_wait_ms: 10,
        },
        storage: StorageSettings {
            work_directory: root.join("work").to_string_lossy().into_owned(),
            output_directory: root.join("out").to_string_lossy().into_owned(),
            file_prefix: "ScreenRecording".to_string(),
        },
        ..RecorderConfig::default()
    }
}

fn make_recorder(root: &Path, backend: Arc<SyntheticBackend>) -> Arc<ScreenRecorder> {
    let config = test_config(root);
    let storage = Arc::new(DirectoryStorage::new(&config.storage.output_directory));
    Arc::new(ScreenRecorder::new(config, backend, storage))
}

/// Synthetic backend whose first `open_video` takes a while, keeping the
/// session in `Starting`.
struct SlowStartBackend {
    inner: Arc<SyntheticBackend>,
    delay: Duration,
    delayed: AtomicBool,
}

impl SlowStartBackend {
    fn new(inner: Arc<SyntheticBackend>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            delayed: AtomicBool::new(false),
        }
    }
}

impl CaptureBackend for SlowStartBackend {
    fn open_video(
        &self,
        settings: &VideoSettings,
        output: &Path,
        visibility: VisibilityFlag,
    ) -> screenrec::Result<Box<dyn VideoCapability>> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.delay);
        }
        self.inner.open_video(settings, output, visibility)
    }

    fn open_render_surface(
        &self,
        input: Box<dyn EncoderInput>,
    ) -> screenrec::Result<Box<dyn RenderSurface>> {
        self.inner.open_render_surface(input)
    }

    fn open_audio_source(
        &self,
        settings: &AudioSettings,
    ) -> screenrec::Result<Option<Box<dyn PcmSource>>> {
        self.inner.open_audio_source(settings)
    }

    fn open_audio_codec(&self) -> screenrec::Result<Box<dyn MediaCodec>> {
        self.inner.open_audio_codec()
    }
}

/// Storage that never accepts a file.
struct FullStorage;

impl DurableStorage for FullStorage {
    fn publish(&self, _source: &Path, desired_name: &str) -> screenrec::Result<PathBuf> {
        Err(RecorderError::StreamIOFailure(format!(
            "No space left for {}",
            desired_name
        )))
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

async fn record_for_a_while(
    recorder: &Arc<ScreenRecorder>,
    backend: &SyntheticBackend,
    params: RecordingParams,
) -> (Option<std::path::PathBuf>, screenrec::Result<()>) {
    let running = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(params).await })
    };
    let mut states = recorder.subscribe();
    states
        .wait_for(|s| *s == SessionState::Recording || s.is_terminal())
        .await
        .unwrap();

    for n in 0..8 {
        backend.push_frames(n, 1, W, H);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    backend.set_visible(false);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let published = recorder.stop().await.unwrap();
    let started = running.await.unwrap();
    (published, started)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_session_publishes_merged_file() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new());
    let recorder = make_recorder(dir.path(), backend.clone());

    let (published, started) =
        record_for_a_while(&recorder, &backend, RecordingParams::default()).await;
    started.unwrap();
    let published = published.expect("a published file");

    assert_eq!(recorder.state(), SessionState::Done);
    let name = published.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("ScreenRecording_") && name.ends_with(".mp4"), "{}", name);

    let reader = Mp4TrackReader::open(&published).unwrap();
    assert_eq!(reader.track_count(), 2);
    let mimes: Vec<String> = (0..2)
        .map(|i| reader.track_format(i).unwrap().mime.clone())
        .collect();
    assert!(mimes.contains(&MIME_AAC.to_string()));
    assert!(mimes.contains(&MIME_AVC.to_string()));
    for i in 0..2 {
        assert!(reader.sample_count(i).unwrap() > 0, "track {} is empty", i);
    }

    assert!(files_in(&dir.path().join("work")).is_empty(), "intermediates left behind");
    assert!(recorder.session().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_video_only_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new().without_audio());
    let recorder = make_recorder(dir.path(), backend.clone());

    let params = RecordingParams {
        file_prefix: Some("Clip".to_string()),
        ..RecordingParams::default()
    };
    let (published, started) = record_for_a_while(&recorder, &backend, params).await;
    started.unwrap();
    let published = published.unwrap();

    assert!(published
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("Clip_"));
    let reader = Mp4TrackReader::open(&published).unwrap();
    assert_eq!(reader.track_count(), 1);
    assert_eq!(reader.track_format(0).unwrap().mime, MIME_AVC);
    assert!(files_in(&dir.path().join("work")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_audio_param_skips_audio() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new());
    let recorder = make_recorder(dir.path(), backend.clone());

    let params = RecordingParams {
        disable_audio: true,
        ..RecordingParams::default()
    };
    let (published, started) = record_for_a_while(&recorder, &backend, params).await;
    started.unwrap();
    let reader = Mp4TrackReader::open(published.unwrap()).unwrap();
    assert_eq!(reader.track_count(), 1);
}

#[tokio::test]
async fn test_stop_before_start_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = make_recorder(dir.path(), Arc::new(SyntheticBackend::new()));

    assert_eq!(recorder.state(), SessionState::Idle);
    assert_eq!(recorder.stop().await.unwrap(), None);
    assert_eq!(recorder.state(), SessionState::Aborted);

    // a second stop is a no-op
    assert_eq!(recorder.stop().await.unwrap(), None);
    assert_eq!(recorder.state(), SessionState::Aborted);
    assert!(files_in(&dir.path().join("out")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_after_done_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new().without_audio());
    let recorder = make_recorder(dir.path(), backend.clone());

    let (published, started) =
        record_for_a_while(&recorder, &backend, RecordingParams::default()).await;
    started.unwrap();
    assert!(published.is_some());

    assert_eq!(recorder.stop().await.unwrap(), None);
    assert_eq!(recorder.state(), SessionState::Done);
    assert_eq!(files_in(&dir.path().join("out")).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_video_capability_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new().without_video());
    let recorder = make_recorder(dir.path(), backend);

    let result = recorder.start(RecordingParams::default()).await;
    assert!(matches!(result, Err(RecorderError::CapabilityUnavailable(_))));
    assert_eq!(recorder.state(), SessionState::Aborted);
    assert!(files_in(&dir.path().join("work")).is_empty());
    assert_eq!(recorder.stop().await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_start_is_rejected_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new().without_audio());
    let recorder = make_recorder(dir.path(), backend);

    let running = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(RecordingParams::default()).await })
    };
    recorder
        .subscribe()
        .wait_for(|s| *s == SessionState::Recording)
        .await
        .unwrap();

    let second = recorder.start(RecordingParams::default()).await;
    assert!(matches!(second, Err(RecorderError::InvalidState(_))));
    assert_eq!(recorder.state(), SessionState::Recording);

    recorder.stop().await.unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(recorder.state(), SessionState::Done);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_starting() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.video.width = 63;
    let storage = Arc::new(DirectoryStorage::new(dir.path().join("out")));
    let recorder = ScreenRecorder::new(config, Arc::new(SyntheticBackend::new()), storage);

    let result = recorder.start(RecordingParams::default()).await;
    assert!(matches!(result, Err(RecorderError::ConfigurationRejected(_))));
    assert_eq!(recorder.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_changes_are_observable_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new().without_audio());
    let recorder = make_recorder(dir.path(), backend.clone());

    let mut states = recorder.subscribe();
    let seen = tokio::spawn(async move {
        let mut seen = vec![*states.borrow()];
        while states.changed().await.is_ok() {
            let s = *states.borrow();
            seen.push(s);
            if s.is_terminal() {
                break;
            }
        }
        seen
    });

    let (published, started) =
        record_for_a_while(&recorder, &backend, RecordingParams::default()).await;
    started.unwrap();
    assert!(published.is_some());

    let seen = seen.await.unwrap();
    assert_eq!(seen.first(), Some(&SessionState::Idle));
    assert_eq!(seen.last(), Some(&SessionState::Done));
    // watch channels may coalesce, but never reorder
    let order = [
        SessionState::Idle,
        SessionState::Starting,
        SessionState::Recording,
        SessionState::Stopping,
        SessionState::Merging,
        SessionState::Done,
    ];
    let positions: Vec<usize> = seen
        .iter()
        .map(|s| order.iter().position(|o| o == s).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[1] > w[0]), "{:?}", seen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_starting_then_restart() {
    let dir = tempfile::tempdir().unwrap();
    let synthetic = Arc::new(SyntheticBackend::new().without_audio());
    let backend = Arc::new(SlowStartBackend::new(
        synthetic.clone(),
        Duration::from_millis(300),
    ));
    let config = test_config(dir.path());
    let storage = Arc::new(DirectoryStorage::new(&config.storage.output_directory));
    let recorder = Arc::new(ScreenRecorder::new(config, backend, storage));

    let first = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(RecordingParams::default()).await })
    };
    recorder
        .subscribe()
        .wait_for(|s| *s == SessionState::Starting)
        .await
        .unwrap();

    let stopping = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the stopped session still holds its resources, so nothing new may start
    assert_eq!(recorder.state(), SessionState::Starting);
    let early = recorder.start(RecordingParams::default()).await;
    assert!(matches!(early, Err(RecorderError::InvalidState(_))));

    let stopped = tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .expect("stop returns once setup is released")
        .unwrap();
    assert_eq!(stopped.unwrap(), None);
    assert_eq!(recorder.state(), SessionState::Aborted);
    first.await.unwrap().unwrap();
    assert!(recorder.session().is_none());
    assert!(files_in(&dir.path().join("work")).is_empty());

    // restart right away
    let second = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(RecordingParams::default()).await })
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        recorder
            .subscribe()
            .wait_for(|s| *s == SessionState::Recording),
    )
    .await
    .expect("second session reaches Recording")
    .unwrap();
    for n in 0..4 {
        synthetic.push_frames(n, 1, W, H);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    let published = recorder.stop().await.unwrap().expect("second session publishes");
    second.await.unwrap().unwrap();

    assert_eq!(recorder.state(), SessionState::Done);
    assert_eq!(Mp4TrackReader::open(&published).unwrap().track_count(), 1);
    assert_eq!(files_in(&dir.path().join("out")).len(), 1);
    assert!(files_in(&dir.path().join("work")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_failure_during_stop_aborts_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SyntheticBackend::new());
    let recorder = Arc::new(ScreenRecorder::new(
        test_config(dir.path()),
        backend.clone(),
        Arc::new(FullStorage),
    ));

    let running = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(RecordingParams::default()).await })
    };
    recorder
        .subscribe()
        .wait_for(|s| *s == SessionState::Recording)
        .await
        .unwrap();
    for n in 0..4 {
        backend.push_frames(n, 1, W, H);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let result = recorder.stop().await;
    assert!(matches!(result, Err(RecorderError::StreamIOFailure(_))), "{:?}", result);
    running.await.unwrap().unwrap();

    assert_eq!(recorder.state(), SessionState::Aborted);
    assert!(recorder.session().is_none());
    assert!(files_in(&dir.path().join("work")).is_empty(), "intermediates left behind");
    assert!(files_in(&dir.path().join("out")).is_empty());

    // the failure is reported once
    assert_eq!(recorder.stop().await.unwrap(), None);

    // and the recorder accepts a new session
    let next = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start(RecordingParams::default()).await })
    };
    recorder
        .subscribe()
        .wait_for(|s| *s == SessionState::Recording)
        .await
        .unwrap();
    assert!(recorder.stop().await.is_err());
    next.await.unwrap().unwrap();
    assert_eq!(recorder.state(), SessionState::Aborted);
}
