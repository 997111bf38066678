//! Track merge tool
//!
//! # Spell: MergeTracks
//! ^ Intent: remux one audio-only and one video-only file into a single two-track file
//!
//! @merge_tracks
//!
//! - first audio/* track of the audio file, first video/* track of the video file
//! - both tracks registered before the output starts
//! - payloads, timestamps and flags copied verbatim
//! - no re-encoding, no resampling, no retiming
//! - output finalized only after both tracks are drained

use std::path::Path;

use crate::container::{Mp4TrackReader, Mp4TrackWriter};
use crate::errors::{RecorderError, Result};
use crate::types::EncodedSample;

/// Initial capacity of the shared copy buffer.
const COPY_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Sample counts of a completed merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MergeStats {
    pub audio_samples: u64,
    pub video_samples: u64,
    pub bytes_written: u64,
    pub duration_us: u64,
}

impl MergeStats {
    pub fn total_samples(&self) -> u64 {
        self.audio_samples + self.video_samples
    }
}

/// Merge the audio track of `audio_file` and the video track of `video_file`
/// into `merged_file`.
///
/// Every failure is reported as [`RecorderError::MergeFailure`].
pub fn merge_tracks<A, V, M>(audio_file: A, video_file: V, merged_file: M) -> Result<MergeStats>
where
    A: AsRef<Path>,
    V: AsRef<Path>,
    M: AsRef<Path>,
{
    let (audio_file, video_file, merged_file) =
        (audio_file.as_ref(), video_file.as_ref(), merged_file.as_ref());
    log::info!(
        "Merging {:?} + {:?} -> {:?}",
        audio_file,
        video_file,
        merged_file
    );
    merge_inner(audio_file, video_file, merged_file).map_err(|e| {
        log::error!("Merge into {:?} failed: {}", merged_file, e);
        e.into_merge_failure()
    })
}

fn merge_inner(audio_file: &Path, video_file: &Path, merged_file: &Path) -> Result<MergeStats> {
    let mut audio = Mp4TrackReader::open(audio_file)?;
    let mut video = Mp4TrackReader::open(video_file)?;

    let audio_track = select_by_prefix(&mut audio, "audio/")?;
    let video_track = select_by_prefix(&mut video, "video/")?;

    let mut writer = Mp4TrackWriter::create(merged_file)?;
    let audio_out = writer.add_track(audio.track_format(audio_track)?)?;
    let video_out = writer.add_track(video.track_format(video_track)?)?;
    writer.start()?;

    let mut buffer = Vec::with_capacity(COPY_BUFFER_BYTES);
    let audio_samples = copy_track(&mut audio, &mut writer, audio_out, &mut buffer)?;
    let video_samples = copy_track(&mut video, &mut writer, video_out, &mut buffer)?;

    let stats = writer.finish()?;
    log::info!(
        "Merged {} audio and {} video samples into {:?}",
        audio_samples,
        video_samples,
        merged_file
    );
    Ok(MergeStats {
        audio_samples,
        video_samples,
        bytes_written: stats.bytes_written,
        duration_us: stats.duration_us,
    })
}

/// Select the first track whose mime type starts with `prefix`.
fn select_by_prefix(reader: &mut Mp4TrackReader, prefix: &str) -> Result<usize> {
    let track = (0..reader.track_count())
        .find(|&i| {
            reader
                .track_format(i)
                .map(|d| d.mime.starts_with(prefix))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            RecorderError::MergeFailure(format!(
                "No {}* track in {:?}",
                prefix,
                reader.path()
            ))
        })?;
    reader.select_track(track)?;
    Ok(track)
}

fn copy_track(
    reader: &mut Mp4TrackReader,
    writer: &mut Mp4TrackWriter,
    track: usize,
    buffer: &mut Vec<u8>,
) -> Result<u64> {
    let mut copied = 0u64;
    while let Some(size) = reader.read_sample_data(buffer)? {
        let (Some(time), Some(flags)) = (reader.sample_time(), reader.sample_flags()) else {
            break;
        };
        let sample = EncodedSample::new(buffer[..size].to_vec(), time, flags).with_track(track);
        writer.write_sample(track, &sample)?;
        copied += 1;
        if !reader.advance() {
            break;
        }
    }
    Ok(copied)
}
