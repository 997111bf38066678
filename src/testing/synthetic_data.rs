//! Synthetic media for offline tests
//!
//! Frames, PCM and codec configuration shaped like what a real screen
//! capture and AAC/H.264 encoder produce, so the pipeline can be exercised
//! without a display, a sound device or a hardware codec.

use image::{Rgba, RgbaImage};

/// A frame whose content changes every frame (tests temporal encoding).
pub fn synthetic_frame(frame_number: u64, width: u32, height: u32) -> RgbaImage {
    let base = (frame_number % 256) as u8;
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            base.wrapping_add((x % 256) as u8),
            base.wrapping_add((y % 256) as u8),
            base.wrapping_add(((x + y) % 256) as u8),
            255,
        ])
    })
}

/// 440 Hz sine as interleaved 16-bit little-endian PCM.
pub fn synthetic_pcm(first_frame: u64, frames: usize, sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * channels as usize * 2);
    for i in 0..frames {
        let t = (first_frame + i as u64) as f64 / sample_rate as f64;
        let value = ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.3 * i16::MAX as f64) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// AVCDecoderConfigurationRecord for a 1-SPS/1-PPS baseline stream.
pub fn synthetic_avc_config() -> Vec<u8> {
    vec![
        0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x42, 0xC0, 0x1E, 0x01, 0x00, 0x04,
        0x68, 0xCE, 0x3C, 0x80,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_differ_over_time() {
        let a = synthetic_frame(0, 8, 8);
        let b = synthetic_frame(1, 8, 8);
        assert_eq!(a.dimensions(), (8, 8));
        assert_ne!(a, b);
    }

    #[test]
    fn test_pcm_is_whole_frames() {
        let pcm = synthetic_pcm(0, 100, 44_100, 2);
        assert_eq!(pcm.len(), 400);
        // sin(0) == 0
        assert_eq!(&pcm[..4], &[0, 0, 0, 0]);
    }
}
