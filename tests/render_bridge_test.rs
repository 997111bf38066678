//! Render bridge: placeholder while hidden, captured frames while visible,
//! every rendering call on the render thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use screenrec::config::RenderSettings;
use screenrec::render::{
    capture_feed, PlaceholderImage, RenderBridge, RenderSurface, SoftwareSurface, VisibilityFlag,
};
use screenrec::testing::FrameCollector;
use screenrec::timing::CaptureClock;
use screenrec::{CancelToken, RecorderError, Result};

const W: u32 = 32;
const H: u32 = 24;

fn fast_settings() -> RenderSettings {
    RenderSettings {
        placeholder_interval_ms: 5,
        frame_wait_ms: 10,
    }
}

#[test]
fn test_hidden_region_presents_only_placeholder() {
    let (_feed, frames) = capture_feed();
    let collector = FrameCollector::new(W, H);
    let output = collector.clone();
    let placeholder = PlaceholderImage::generate(W, H);
    let expected = placeholder.image().clone();

    let bridge = RenderBridge::bind(
        move || Ok(Box::new(SoftwareSurface::new(frames, Box::new(output))) as Box<dyn RenderSurface>),
        placeholder,
        &fast_settings(),
    )
    .unwrap();

    let cancel = CancelToken::new();
    let done = bridge
        .drive(cancel.clone(), VisibilityFlag::new(false), CaptureClock::new())
        .unwrap();
    std::thread::sleep(Duration::from_millis(120));
    cancel.cancel();
    let summary = done.blocking_recv().unwrap().unwrap();
    bridge.release().unwrap();

    assert!(summary.placeholder_frames > 0);
    assert_eq!(summary.captured_frames, 0);
    assert!(summary.fault.is_none());

    let presented = collector.frames();
    assert_eq!(presented.len() as u64, summary.placeholder_frames);
    assert!(presented.iter().all(|(frame, _)| *frame == expected));
    assert!(presented.windows(2).all(|w| w[1].1 > w[0].1));
}

#[test]
fn test_visible_region_presents_captured_frames() {
    let (feed, frames) = capture_feed();
    let collector = FrameCollector::new(W, H);
    let output = collector.clone();

    let bridge = RenderBridge::bind(
        move || Ok(Box::new(SoftwareSurface::new(frames, Box::new(output))) as Box<dyn RenderSurface>),
        PlaceholderImage::generate(W, H),
        &fast_settings(),
    )
    .unwrap();

    let colour = Rgba([200, 40, 90, 255]);
    for _ in 0..3 {
        assert!(feed.push(RgbaImage::from_pixel(W, H, colour)));
    }

    let cancel = CancelToken::new();
    let done = bridge
        .drive(cancel.clone(), VisibilityFlag::new(true), CaptureClock::new())
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    let summary = done.blocking_recv().unwrap().unwrap();
    bridge.release().unwrap();

    assert_eq!(summary.captured_frames, 3);
    assert_eq!(summary.placeholder_frames, 0);
    assert!(summary.idle_ticks > 0);
    let presented = collector.frames();
    assert_eq!(presented.len(), 3);
    assert!(presented.iter().all(|(f, _)| *f.get_pixel(0, 0) == colour));
}

/// Records the thread of every call; optionally fails on `present`.
struct ThreadRecordingSurface {
    calls: Arc<Mutex<Vec<String>>>,
    fail_present: bool,
}

impl ThreadRecordingSurface {
    fn record(&self) {
        let name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        self.calls.lock().unwrap().push(name);
    }
}

impl RenderSurface for ThreadRecordingSurface {
    fn bind_context(&mut self) -> Result<()> {
        self.record();
        Ok(())
    }

    fn load_placeholder(&mut self, _placeholder: &PlaceholderImage) -> Result<()> {
        self.record();
        Ok(())
    }

    fn await_new_frame(&mut self, _timeout: Duration) -> Result<bool> {
        self.record();
        Ok(false)
    }

    fn draw_captured_frame(&mut self) -> Result<()> {
        self.record();
        Ok(())
    }

    fn draw_placeholder(&mut self) -> Result<()> {
        self.record();
        Ok(())
    }

    fn present(&mut self, _presentation_time_us: i64) -> Result<()> {
        self.record();
        if self.fail_present {
            return Err(RecorderError::StreamIOFailure("encoder input gone".to_string()));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.record();
    }
}

fn recording_bridge(fail_present: bool) -> (RenderBridge, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let surface_calls = calls.clone();
    let bridge = RenderBridge::bind(
        move || {
            Ok(Box::new(ThreadRecordingSurface {
                calls: surface_calls,
                fail_present,
            }) as Box<dyn RenderSurface>)
        },
        PlaceholderImage::generate(8, 8),
        &fast_settings(),
    )
    .unwrap();
    (bridge, calls)
}

#[test]
fn test_every_call_runs_on_the_render_thread() {
    let (bridge, calls) = recording_bridge(false);
    let visibility = VisibilityFlag::new(true);
    let cancel = CancelToken::new();
    let done = bridge
        .drive(cancel.clone(), visibility.clone(), CaptureClock::new())
        .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    visibility.set(false);
    std::thread::sleep(Duration::from_millis(30));
    cancel.cancel();
    done.blocking_recv().unwrap().unwrap();
    bridge.release().unwrap();

    let calls = calls.lock().unwrap();
    assert!(calls.len() > 4);
    assert!(calls.iter().all(|name| name == "screenrec-render"), "{:?}", calls);
}

#[test]
fn test_render_fault_ends_the_stream() {
    let (bridge, _calls) = recording_bridge(true);
    let done = bridge
        .drive(CancelToken::new(), VisibilityFlag::new(false), CaptureClock::new())
        .unwrap();
    // never cancelled: the failing present must end the loop on its own
    let summary = done.blocking_recv().unwrap().unwrap();
    assert!(matches!(summary.fault, Some(RecorderError::StreamIOFailure(_))));
    assert_eq!(summary.frames_presented(), 0);
    bridge.release().unwrap();
}
