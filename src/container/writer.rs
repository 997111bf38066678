//! Streaming MP4 writer for one or two elementary streams.
//!
//! Payloads are streamed into a single 64-bit `mdat` as they arrive; the
//! `moov` index is written at `finish`. All tracks use a microsecond media
//! timescale so sample times read back exactly as written.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::boxes::{
    build_box, build_container, build_ftyp_box, build_full_box, undetermined_language,
    UNITY_MATRIX,
};
use super::sample_entry::build_stsd_box;
use super::MICROS_TIMESCALE;
use crate::errors::{RecorderError, Result};
use crate::types::{EncodedSample, MediaParams, TrackDescriptor};

const MDAT_HEADER_LEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Configuring,
    Writing,
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct SampleRecord {
    offset: u64,
    size: u32,
    time_us: i64,
    sync: bool,
}

#[derive(Debug)]
struct TrackState {
    descriptor: TrackDescriptor,
    samples: Vec<SampleRecord>,
}

/// Summary of a finalized file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub tracks: usize,
    pub samples_per_track: Vec<u64>,
    pub duration_us: u64,
    pub bytes_written: u64,
}

impl WriterStats {
    pub fn total_samples(&self) -> u64 {
        self.samples_per_track.iter().sum()
    }
}

/// Container writer: register tracks, start, append samples, finish.
pub struct Mp4TrackWriter {
    path: PathBuf,
    out: BufWriter<File>,
    tracks: Vec<TrackState>,
    state: WriterState,
    mdat_start: u64,
    position: u64,
}

impl Mp4TrackWriter {
    /// Create (or truncate) the output file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Failed to create {:?}: {}", path, e))
        })?;
        log::debug!("Opened container writer at {:?}", path);
        Ok(Self {
            path,
            out: BufWriter::new(file),
            tracks: Vec::new(),
            state: WriterState::Configuring,
            mdat_start: 0,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_started(&self) -> bool {
        self.state == WriterState::Writing
    }

    /// Register a track. Only valid before `start`.
    pub fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<usize> {
        if self.state != WriterState::Configuring {
            return Err(RecorderError::InvalidState(
                "Tracks must be added before the writer is started".to_string(),
            ));
        }
        // Validate the sample entry now rather than at finish.
        build_stsd_box(descriptor)?;

        self.tracks.push(TrackState {
            descriptor: descriptor.clone(),
            samples: Vec::new(),
        });
        let index = self.tracks.len() - 1;
        log::info!("Track {} registered in {:?}: {}", index, self.path, descriptor);
        Ok(index)
    }

    /// Write the file header and open the media data box.
    pub fn start(&mut self) -> Result<()> {
        if self.state != WriterState::Configuring {
            return Err(RecorderError::InvalidState(
                "Writer already started".to_string(),
            ));
        }
        if self.tracks.is_empty() {
            return Err(RecorderError::ConfigurationRejected(
                "Cannot start a container with no tracks".to_string(),
            ));
        }

        let ftyp = build_ftyp_box();
        self.write_all(&ftyp)?;
        self.mdat_start = self.position;
        let mut mdat_header = Vec::with_capacity(MDAT_HEADER_LEN as usize);
        mdat_header.extend_from_slice(&1u32.to_be_bytes());
        mdat_header.extend_from_slice(b"mdat");
        mdat_header.extend_from_slice(&MDAT_HEADER_LEN.to_be_bytes());
        self.write_all(&mdat_header)?;

        self.state = WriterState::Writing;
        Ok(())
    }

    /// Append one sample to `track`.
    ///
    /// Empty payloads (typically a bare end-of-stream marker) are skipped.
    /// Timestamps must not decrease within a track.
    pub fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<()> {
        if self.state != WriterState::Writing {
            return Err(RecorderError::InvalidState(
                "Writer is not started".to_string(),
            ));
        }
        if track >= self.tracks.len() {
            return Err(RecorderError::StreamIOFailure(format!(
                "No track {} in {:?}",
                track, self.path
            )));
        }
        if sample.flags.is_codec_config() {
            return Err(RecorderError::ConfigurationRejected(
                "Codec configuration must travel in the track descriptor, not as a sample"
                    .to_string(),
            ));
        }
        if sample.payload.is_empty() {
            return Ok(());
        }
        if sample.presentation_time_us < 0 {
            return Err(RecorderError::StreamIOFailure(format!(
                "Negative presentation time {}us on track {}",
                sample.presentation_time_us, track
            )));
        }
        let size = u32::try_from(sample.payload.len()).map_err(|_| {
            RecorderError::StreamIOFailure("Sample larger than 4 GiB".to_string())
        })?;

        if let Some(last) = self.tracks[track].samples.last() {
            let delta = sample.presentation_time_us - last.time_us;
            if delta < 0 {
                return Err(RecorderError::StreamIOFailure(format!(
                    "Timestamp went backwards on track {}: {}us after {}us",
                    track, sample.presentation_time_us, last.time_us
                )));
            }
            if delta > u32::MAX as i64 {
                return Err(RecorderError::StreamIOFailure(format!(
                    "Gap of {}us between samples on track {} is too large",
                    delta, track
                )));
            }
        }

        let sync = sample.flags.is_key_frame() || self.tracks[track].descriptor.is_audio();
        let offset = self.position;
        self.write_all(&sample.payload)?;
        self.tracks[track].samples.push(SampleRecord {
            offset,
            size,
            time_us: sample.presentation_time_us,
            sync,
        });
        Ok(())
    }

    /// Patch the media data size, write the index and close the file.
    pub fn finish(mut self) -> Result<WriterStats> {
        if self.state != WriterState::Writing {
            return Err(RecorderError::InvalidState(
                "Writer finished before it was started".to_string(),
            ));
        }
        self.state = WriterState::Finished;

        let mdat_size = self.position - self.mdat_start;
        let moov = build_moov(&self.tracks)?;
        self.write_all(&moov)?;

        let io_err = |e: std::io::Error| {
            RecorderError::StreamIOFailure(format!("Failed to finalize container: {}", e))
        };
        self.out
            .seek(SeekFrom::Start(self.mdat_start + 8))
            .map_err(io_err)?;
        self.out.write_all(&mdat_size.to_be_bytes()).map_err(io_err)?;
        self.out.flush().map_err(io_err)?;
        self.out.get_ref().sync_all().map_err(io_err)?;

        let stats = WriterStats {
            tracks: self.tracks.len(),
            samples_per_track: self.tracks.iter().map(|t| t.samples.len() as u64).collect(),
            duration_us: self
                .tracks
                .iter()
                .map(|t| track_timing(t).total_us)
                .max()
                .unwrap_or(0),
            bytes_written: self.position,
        };
        log::info!(
            "Finalized {:?}: {} track(s), {} samples, {} bytes",
            self.path,
            stats.tracks,
            stats.total_samples(),
            stats.bytes_written
        );
        Ok(stats)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Write to {:?} failed: {}", self.path, e))
        })?;
        self.position += data.len() as u64;
        Ok(())
    }
}

struct TrackTiming {
    deltas: Vec<u32>,
    /// Presentation time of the first sample
    start_us: u64,
    /// Sum of sample durations
    media_us: u64,
    /// start + media
    total_us: u64,
}

fn default_sample_duration_us(descriptor: &TrackDescriptor) -> u32 {
    match descriptor.media {
        MediaParams::Video { frame_rate, .. } if frame_rate > 0 => 1_000_000 / frame_rate,
        MediaParams::Audio { sample_rate, .. } if sample_rate > 0 => {
            (1024u64 * 1_000_000 / u64::from(sample_rate)) as u32
        }
        _ => 0,
    }
}

fn track_timing(track: &TrackState) -> TrackTiming {
    let samples = &track.samples;
    let mut deltas: Vec<u32> = samples
        .windows(2)
        .map(|w| (w[1].time_us - w[0].time_us) as u32)
        .collect();
    if !samples.is_empty() {
        let last = deltas
            .last()
            .copied()
            .unwrap_or_else(|| default_sample_duration_us(&track.descriptor));
        deltas.push(last);
    }
    let start_us = samples.first().map(|s| s.time_us as u64).unwrap_or(0);
    let media_us: u64 = deltas.iter().map(|&d| u64::from(d)).sum();
    TrackTiming {
        deltas,
        start_us,
        media_us,
        total_us: start_us + media_us,
    }
}

fn build_moov(tracks: &[TrackState]) -> Result<Vec<u8>> {
    let timings: Vec<TrackTiming> = tracks.iter().map(track_timing).collect();
    let movie_duration = timings.iter().map(|t| t.total_us).max().unwrap_or(0);

    let mut children = vec![build_mvhd_box(movie_duration, tracks.len() as u32 + 1)];
    for (index, (track, timing)) in tracks.iter().zip(&timings).enumerate() {
        children.push(build_trak_box(index as u32 + 1, track, timing)?);
    }
    Ok(build_container(b"moov", &children))
}

fn build_mvhd_box(duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u64.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u64.to_be_bytes()); // modification_time
    payload.extend_from_slice(&MICROS_TIMESCALE.to_be_bytes());
    payload.extend_from_slice(&duration.to_be_bytes());
    payload.extend_from_slice(&0x0001_0000_u32.to_be_bytes()); // rate 1.0
    payload.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    payload.extend_from_slice(&[0u8; 10]);
    for value in UNITY_MATRIX {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload.extend_from_slice(&[0u8; 24]);
    payload.extend_from_slice(&next_track_id.to_be_bytes());
    build_full_box(b"mvhd", 1, 0, &payload)
}

fn build_trak_box(track_id: u32, track: &TrackState, timing: &TrackTiming) -> Result<Vec<u8>> {
    let mut children = vec![build_tkhd_box(track_id, &track.descriptor, timing.total_us)];
    if timing.start_us > 0 {
        children.push(build_edts_box(timing));
    }
    children.push(build_mdia_box(track, timing)?);
    Ok(build_container(b"trak", &children))
}

fn build_tkhd_box(track_id: u32, descriptor: &TrackDescriptor, duration: u64) -> Vec<u8> {
    let (volume, width, height) = match descriptor.media {
        MediaParams::Video { width, height, .. } => (0u16, width, height),
        MediaParams::Audio { .. } => (0x0100u16, 0, 0),
    };
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u64.to_be_bytes());
    payload.extend_from_slice(&0u64.to_be_bytes());
    payload.extend_from_slice(&track_id.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&duration.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&0u16.to_be_bytes()); // layer
    payload.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    payload.extend_from_slice(&volume.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    for value in UNITY_MATRIX {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload.extend_from_slice(&(width << 16).to_be_bytes());
    payload.extend_from_slice(&(height << 16).to_be_bytes());
    // enabled | in_movie
    build_full_box(b"tkhd", 1, 0x3, &payload)
}

/// An empty edit shifts the track so its first sample plays at `start_us`.
fn build_edts_box(timing: &TrackTiming) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2u32.to_be_bytes());
    payload.extend_from_slice(&timing.start_us.to_be_bytes());
    payload.extend_from_slice(&(-1i64).to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&timing.media_us.to_be_bytes());
    payload.extend_from_slice(&0i64.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    let elst = build_full_box(b"elst", 1, 0, &payload);
    build_box(b"edts", &elst)
}

fn build_mdia_box(track: &TrackState, timing: &TrackTiming) -> Result<Vec<u8>> {
    let mut mdhd = Vec::new();
    mdhd.extend_from_slice(&0u64.to_be_bytes());
    mdhd.extend_from_slice(&0u64.to_be_bytes());
    mdhd.extend_from_slice(&MICROS_TIMESCALE.to_be_bytes());
    mdhd.extend_from_slice(&timing.media_us.to_be_bytes());
    mdhd.extend_from_slice(&undetermined_language());
    mdhd.extend_from_slice(&0u16.to_be_bytes());
    let mdhd = build_full_box(b"mdhd", 1, 0, &mdhd);

    let (handler, name, media_header) = if track.descriptor.is_video() {
        (b"vide", &b"VideoHandler\0"[..], build_full_box(b"vmhd", 0, 1, &[0u8; 8]))
    } else {
        (b"soun", &b"SoundHandler\0"[..], build_full_box(b"smhd", 0, 0, &[0u8; 4]))
    };
    let mut hdlr = Vec::new();
    hdlr.extend_from_slice(&0u32.to_be_bytes());
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0u8; 12]);
    hdlr.extend_from_slice(name);
    let hdlr = build_full_box(b"hdlr", 0, 0, &hdlr);

    let url = build_full_box(b"url ", 0, 1, &[]);
    let mut dref = Vec::new();
    dref.extend_from_slice(&1u32.to_be_bytes());
    dref.extend_from_slice(&url);
    let dinf = build_box(b"dinf", &build_full_box(b"dref", 0, 0, &dref));

    let stbl = build_stbl_box(track, timing)?;
    let minf = build_container(b"minf", &[media_header, dinf, stbl]);
    Ok(build_container(b"mdia", &[mdhd, hdlr, minf]))
}

fn build_stbl_box(track: &TrackState, timing: &TrackTiming) -> Result<Vec<u8>> {
    let samples = &track.samples;
    let mut children = vec![build_stsd_box(&track.descriptor)?, build_stts_box(&timing.deltas)];

    if samples.iter().any(|s| !s.sync) {
        let mut stss = Vec::new();
        let sync: Vec<u32> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        stss.extend_from_slice(&(sync.len() as u32).to_be_bytes());
        for n in sync {
            stss.extend_from_slice(&n.to_be_bytes());
        }
        children.push(build_full_box(b"stss", 0, 0, &stss));
    }

    // One sample per chunk.
    let mut stsc = Vec::new();
    if samples.is_empty() {
        stsc.extend_from_slice(&0u32.to_be_bytes());
    } else {
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
    }
    children.push(build_full_box(b"stsc", 0, 0, &stsc));

    let mut stsz = Vec::new();
    stsz.extend_from_slice(&0u32.to_be_bytes());
    stsz.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for s in samples {
        stsz.extend_from_slice(&s.size.to_be_bytes());
    }
    children.push(build_full_box(b"stsz", 0, 0, &stsz));

    let needs_co64 = samples.iter().any(|s| s.offset > u32::MAX as u64);
    let mut offsets = Vec::new();
    offsets.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for s in samples {
        if needs_co64 {
            offsets.extend_from_slice(&s.offset.to_be_bytes());
        } else {
            offsets.extend_from_slice(&(s.offset as u32).to_be_bytes());
        }
    }
    let typ = if needs_co64 { b"co64" } else { b"stco" };
    children.push(build_full_box(typ, 0, 0, &offsets));

    Ok(build_container(b"stbl", &children))
}

/// Run-length encoded sample durations.
fn build_stts_box(deltas: &[u32]) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &delta in deltas {
        match runs.last_mut() {
            Some((count, d)) if *d == delta => *count += 1,
            _ => runs.push((1, delta)),
        }
    }
    let mut payload = Vec::new();
    payload.extend_from_slice(&(runs.len() as u32).to_be_bytes());
    for (count, delta) in runs {
        payload.extend_from_slice(&count.to_be_bytes());
        payload.extend_from_slice(&delta.to_be_bytes());
    }
    build_full_box(b"stts", 0, 0, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleFlags, MIME_AAC};

    fn aac() -> TrackDescriptor {
        TrackDescriptor::audio(MIME_AAC, 44_100, 2, 192_000, vec![0x12u8, 0x10])
    }

    #[test]
    fn test_add_track_after_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Mp4TrackWriter::create(dir.path().join("a.mp4")).unwrap();
        writer.add_track(&aac()).unwrap();
        writer.start().unwrap();
        assert!(matches!(
            writer.add_track(&aac()),
            Err(RecorderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_start_without_tracks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Mp4TrackWriter::create(dir.path().join("a.mp4")).unwrap();
        assert!(matches!(
            writer.start(),
            Err(RecorderError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn test_backwards_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Mp4TrackWriter::create(dir.path().join("a.mp4")).unwrap();
        let t = writer.add_track(&aac()).unwrap();
        writer.start().unwrap();
        writer
            .write_sample(t, &EncodedSample::new(vec![1u8, 2], 1000, SampleFlags::NONE))
            .unwrap();
        assert!(writer
            .write_sample(t, &EncodedSample::new(vec![1u8, 2], 999, SampleFlags::NONE))
            .is_err());
    }

    #[test]
    fn test_codec_config_sample_rejected_and_empty_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Mp4TrackWriter::create(dir.path().join("a.mp4")).unwrap();
        let t = writer.add_track(&aac()).unwrap();
        writer.start().unwrap();
        assert!(writer
            .write_sample(t, &EncodedSample::new(vec![0x12u8, 0x10], 0, SampleFlags::CODEC_CONFIG))
            .is_err());
        writer
            .write_sample(t, &EncodedSample::new(Vec::<u8>::new(), 0, SampleFlags::END_OF_STREAM))
            .unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.samples_per_track, vec![0]);
    }

    #[test]
    fn test_file_layout_and_mdat_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.mp4");
        let mut writer = Mp4TrackWriter::create(&path).unwrap();
        let t = writer.add_track(&aac()).unwrap();
        writer.start().unwrap();
        for i in 0..3 {
            writer
                .write_sample(t, &EncodedSample::new(vec![0xAAu8; 10], i * 23_220, SampleFlags::NONE))
                .unwrap();
        }
        let stats = writer.finish().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
        let ftyp_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        assert_eq!(&data[ftyp_len + 4..ftyp_len + 8], b"mdat");
        let mdat_size = u64::from_be_bytes(data[ftyp_len + 8..ftyp_len + 16].try_into().unwrap());
        assert_eq!(mdat_size, 16 + 30);
        assert_eq!(&data[ftyp_len + mdat_size as usize + 4..ftyp_len + mdat_size as usize + 8], b"moov");
        assert_eq!(stats.bytes_written, data.len() as u64);
        assert_eq!(stats.duration_us, 3 * 23_220);
    }

    #[test]
    fn test_stts_runs() {
        let stts = build_stts_box(&[10, 10, 10, 20]);
        // header(8) + version/flags(4) + entry_count(4) + 2 runs * 8
        assert_eq!(stts.len(), 32);
        assert_eq!(&stts[12..16], &2u32.to_be_bytes());
    }
}
