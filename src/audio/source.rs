use crate::errors::Result;

/// A pull-style PCM producer (16-bit little-endian, interleaved).
///
/// The caller owns the buffer; `read` fills as much of it as is available.
pub trait PcmSource: Send {
    fn sample_rate(&self) -> u32;

    fn channel_count(&self) -> u16;

    fn start(&mut self) -> Result<()>;

    /// Copy available PCM into `buf`. Returns the number of bytes written;
    /// 0 means no data yet, not end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);
}

/// Bytes per interleaved 16-bit PCM frame.
pub fn pcm_frame_bytes(channel_count: u16) -> usize {
    2 * channel_count.max(1) as usize
}
