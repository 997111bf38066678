//! Recording session orchestration
//!
//! `ScreenRecorder` wires a [`CaptureBackend`] (video path, render surface,
//! audio source and codec) into one recording and publishes the result
//! through a [`DurableStorage`](crate::storage::DurableStorage).

mod backend;
mod recorder;
mod state;

pub use backend::{CaptureBackend, VideoCapability};
pub use recorder::ScreenRecorder;
pub use state::SessionState;
