//! Software video recording
//!
//! This module provides the desktop video path using:
//! - openh264 for H.264 encoding
//! - muxide for MP4 muxing
//!
//! # Example
//! ```rust,ignore
//! use screenrec::recording::SoftwareBackend;
//! use screenrec::render::capture_feed;
//!
//! let (feed, frames) = capture_feed();
//! let backend = SoftwareBackend::new(frames);
//!
//! // In your screen grab loop:
//! feed.push(frame);
//! ```

mod backend;
mod capability;
mod encoder;

pub use backend::SoftwareBackend;
pub use capability::{SoftwareVideoCapability, VideoStats};
pub use encoder::{EncodedFrame, H264Encoder};
