//! MP4 demuxer: track enumeration and sample-by-sample access.
//!
//! The whole `moov` index is loaded at open; sample data is read on demand.
//! Handles both trailing and fast-start `moov` placement, 32/64-bit chunk
//! offsets, multi-sample chunks, composition offsets and edit lists.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::boxes::{children, find_child, require_child, BoxHeader, ByteReader};
use super::sample_entry::parse_stsd;
use crate::errors::{RecorderError, Result};
use crate::types::{SampleFlags, TrackDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SampleEntry {
    offset: u64,
    size: u32,
    time_us: i64,
    flags: SampleFlags,
}

#[derive(Debug)]
struct TrackIndex {
    descriptor: TrackDescriptor,
    samples: Vec<SampleEntry>,
}

/// Reads samples from the selected tracks in file order.
pub struct Mp4TrackReader {
    path: PathBuf,
    file: BufReader<File>,
    tracks: Vec<TrackIndex>,
    selected: Vec<usize>,
    /// (track, sample) pairs of the selected tracks, ordered by file offset
    order: Vec<(usize, usize)>,
    cursor: usize,
}

impl Mp4TrackReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Failed to open {:?}: {}", path, e))
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| RecorderError::StreamIOFailure(format!("Failed to stat {:?}: {}", path, e)))?
            .len();
        let mut file = BufReader::new(file);
        let moov = read_moov(&mut file, &path)?;
        let tracks = parse_moov(&moov, file_len)?;
        log::debug!("Opened {:?}: {} track(s)", path, tracks.len());
        Ok(Self {
            path,
            file,
            tracks,
            selected: Vec::new(),
            order: Vec::new(),
            cursor: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_format(&self, track: usize) -> Result<&TrackDescriptor> {
        self.tracks
            .get(track)
            .map(|t| &t.descriptor)
            .ok_or_else(|| RecorderError::StreamIOFailure(format!("No track {}", track)))
    }

    pub fn sample_count(&self, track: usize) -> Result<usize> {
        self.tracks
            .get(track)
            .map(|t| t.samples.len())
            .ok_or_else(|| RecorderError::StreamIOFailure(format!("No track {}", track)))
    }

    /// Include `track` in the sample walk. Resets the walk to the beginning.
    pub fn select_track(&mut self, track: usize) -> Result<()> {
        if track >= self.tracks.len() {
            return Err(RecorderError::StreamIOFailure(format!(
                "Cannot select track {} of {}",
                track,
                self.tracks.len()
            )));
        }
        if !self.selected.contains(&track) {
            self.selected.push(track);
        }
        self.rebuild_order();
        Ok(())
    }

    pub fn unselect_track(&mut self, track: usize) {
        self.selected.retain(|&t| t != track);
        self.rebuild_order();
    }

    fn rebuild_order(&mut self) {
        let mut order: Vec<(usize, usize)> = self
            .selected
            .iter()
            .flat_map(|&t| (0..self.tracks[t].samples.len()).map(move |s| (t, s)))
            .collect();
        let tracks = &self.tracks;
        order.sort_by_key(|&(t, s)| tracks[t].samples[s].offset);
        self.order = order;
        self.cursor = 0;
    }

    fn current(&self) -> Option<(usize, &SampleEntry)> {
        self.order
            .get(self.cursor)
            .map(|&(t, s)| (t, &self.tracks[t].samples[s]))
    }

    /// Copy the current sample into `buf`. `None` once the walk is exhausted.
    pub fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        let Some((_, entry)) = self.current() else {
            return Ok(None);
        };
        let (offset, size) = (entry.offset, entry.size as usize);
        buf.resize(size, 0);
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Seek in {:?} failed: {}", self.path, e))
        })?;
        self.file.read_exact(buf).map_err(|e| {
            RecorderError::StreamIOFailure(format!(
                "Sample at offset {} in {:?} unreadable: {}",
                offset, self.path, e
            ))
        })?;
        Ok(Some(size))
    }

    pub fn sample_time(&self) -> Option<i64> {
        self.current().map(|(_, e)| e.time_us)
    }

    pub fn sample_flags(&self) -> Option<SampleFlags> {
        self.current().map(|(_, e)| e.flags)
    }

    pub fn sample_track_index(&self) -> Option<usize> {
        self.current().map(|(t, _)| t)
    }

    pub fn sample_size(&self) -> Option<usize> {
        self.current().map(|(_, e)| e.size as usize)
    }

    /// Move to the next sample. Returns false once past the last one.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.order.len() {
            self.cursor += 1;
        }
        self.cursor < self.order.len()
    }
}

/// Scan top-level boxes for `moov` and load it.
fn read_moov<R: Read + Seek>(file: &mut R, path: &Path) -> Result<Vec<u8>> {
    let io_err = |e: std::io::Error| {
        RecorderError::StreamIOFailure(format!("Failed to read {:?}: {}", path, e))
    };
    let file_len = file.seek(SeekFrom::End(0)).map_err(io_err)?;
    let mut pos = 0u64;
    let mut saw_ftyp = false;

    while pos + 8 <= file_len {
        file.seek(SeekFrom::Start(pos)).map_err(io_err)?;
        let mut header = [0u8; 16];
        let available = (file_len - pos).min(16) as usize;
        file.read_exact(&mut header[..available]).map_err(io_err)?;
        let header = BoxHeader::parse(&header[..available])?;
        let size = header.size.unwrap_or(file_len - pos);
        if pos + size > file_len {
            return Err(RecorderError::StreamIOFailure(format!(
                "'{}' box at {} runs past end of {:?}",
                header.type_str(),
                pos,
                path
            )));
        }

        match &header.typ {
            b"ftyp" => saw_ftyp = true,
            b"moov" => {
                let mut moov = vec![0u8; (size - header.header_len) as usize];
                file.seek(SeekFrom::Start(pos + header.header_len))
                    .map_err(io_err)?;
                file.read_exact(&mut moov).map_err(io_err)?;
                return Ok(moov);
            }
            _ => {}
        }
        pos += size;
    }

    Err(RecorderError::StreamIOFailure(if saw_ftyp {
        format!("{:?} has no movie index (unfinished recording?)", path)
    } else {
        format!("{:?} is not an MP4 file", path)
    }))
}

fn parse_moov(moov: &[u8], file_len: u64) -> Result<Vec<TrackIndex>> {
    let mvhd = require_child(moov, b"mvhd", "moov")?;
    let mut r = ByteReader::new(mvhd);
    let (version, _) = r.full_box_header()?;
    r.versioned_u64(version)?;
    r.versioned_u64(version)?;
    let movie_timescale = r.u32()?;

    let mut tracks = Vec::new();
    for child in children(moov) {
        let (typ, trak) = child?;
        if &typ == b"trak" {
            tracks.push(parse_trak(trak, movie_timescale, file_len)?);
        }
    }
    Ok(tracks)
}

fn rescale(value: i128, from: u32, to: u32) -> i64 {
    if from == 0 {
        return 0;
    }
    let from = from as i128;
    let scaled = value * to as i128;
    // round half away from zero
    let rounded = if scaled >= 0 {
        (scaled + from / 2) / from
    } else {
        (scaled - from / 2) / from
    };
    rounded as i64
}

/// Presentation shift of a track in microseconds and the media time its
/// first edit starts at.
struct EditShift {
    empty_us: i64,
    media_start: i64,
}

fn parse_edits(trak: &[u8], movie_timescale: u32) -> Result<EditShift> {
    let mut shift = EditShift {
        empty_us: 0,
        media_start: 0,
    };
    let Some(edts) = find_child(trak, b"edts")? else {
        return Ok(shift);
    };
    let Some(elst) = find_child(edts, b"elst")? else {
        return Ok(shift);
    };
    let mut r = ByteReader::new(elst);
    let (version, _) = r.full_box_header()?;
    let count = r.table_len(if version == 1 { 20 } else { 12 }, "Edit list")?;
    for _ in 0..count {
        let (duration, media_time) = if version == 1 {
            (r.u64()?, r.i64()?)
        } else {
            (u64::from(r.u32()?), i64::from(r.i32()?))
        };
        r.skip(4)?;
        if media_time == -1 {
            shift.empty_us += rescale(duration as i128, movie_timescale, 1_000_000);
        } else {
            shift.media_start = media_time;
            break;
        }
    }
    Ok(shift)
}

fn parse_trak(trak: &[u8], movie_timescale: u32, file_len: u64) -> Result<TrackIndex> {
    let shift = parse_edits(trak, movie_timescale)?;
    let mdia = require_child(trak, b"mdia", "trak")?;

    let mdhd = require_child(mdia, b"mdhd", "mdia")?;
    let mut r = ByteReader::new(mdhd);
    let (version, _) = r.full_box_header()?;
    r.versioned_u64(version)?;
    r.versioned_u64(version)?;
    let timescale = r.u32()?;
    if timescale == 0 {
        return Err(RecorderError::StreamIOFailure(
            "Track media timescale is zero".to_string(),
        ));
    }

    let minf = require_child(mdia, b"minf", "mdia")?;
    let stbl = require_child(minf, b"stbl", "minf")?;

    let sizes = parse_stsz(require_child(stbl, b"stsz", "stbl")?, file_len)?;
    let count = sizes.len();
    let offsets = sample_offsets(stbl, &sizes)?;
    let dts = decode_times(require_child(stbl, b"stts", "stbl")?, count)?;
    let cts_offsets = match find_child(stbl, b"ctts")? {
        Some(ctts) => composition_offsets(ctts, count)?,
        None => vec![0; count],
    };
    let sync: Option<HashSet<usize>> = match find_child(stbl, b"stss")? {
        Some(stss) => Some(sync_samples(stss)?),
        None => None,
    };

    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let media_time = dts[i] as i128 + cts_offsets[i] as i128 - shift.media_start as i128;
        let is_sync = sync.as_ref().map_or(true, |s| s.contains(&(i + 1)));
        samples.push(SampleEntry {
            offset: offsets[i],
            size: sizes[i],
            time_us: rescale(media_time, timescale, 1_000_000) + shift.empty_us,
            flags: if is_sync {
                SampleFlags::KEY_FRAME
            } else {
                SampleFlags::NONE
            },
        });
    }

    let frame_rate = estimate_frame_rate(&samples);
    let stsd = require_child(stbl, b"stsd", "stbl")?;
    let descriptor = parse_stsd(stsd, frame_rate)?;

    Ok(TrackIndex {
        descriptor,
        samples,
    })
}

fn estimate_frame_rate(samples: &[SampleEntry]) -> u32 {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return 0;
    };
    let span = last.time_us - first.time_us;
    if samples.len() < 2 || span <= 0 {
        return 0;
    }
    (((samples.len() - 1) as f64) * 1_000_000.0 / span as f64).round() as u32
}

fn parse_stsz(stsz: &[u8], file_len: u64) -> Result<Vec<u32>> {
    let mut r = ByteReader::new(stsz);
    r.full_box_header()?;
    let uniform = r.u32()?;
    if uniform == 0 {
        let count = r.table_len(4, "Sample size")?;
        return (0..count).map(|_| r.u32()).collect();
    }
    // uniform samples must all fit in the file
    let count = r.u32()?;
    if u64::from(uniform) * u64::from(count) > file_len {
        return Err(RecorderError::StreamIOFailure(format!(
            "{} samples of {} bytes do not fit in a {} byte file",
            count, uniform, file_len
        )));
    }
    Ok(vec![uniform; count as usize])
}

fn sample_offsets(stbl: &[u8], sizes: &[u32]) -> Result<Vec<u64>> {
    let chunk_offsets: Vec<u64> = if let Some(stco) = find_child(stbl, b"stco")? {
        let mut r = ByteReader::new(stco);
        r.full_box_header()?;
        let n = r.table_len(4, "Chunk offset")?;
        (0..n).map(|_| r.u32().map(u64::from)).collect::<Result<_>>()?
    } else {
        let co64 = require_child(stbl, b"co64", "stbl")?;
        let mut r = ByteReader::new(co64);
        r.full_box_header()?;
        let n = r.table_len(8, "Chunk offset")?;
        (0..n).map(|_| r.u64()).collect::<Result<_>>()?
    };

    let mut r = ByteReader::new(require_child(stbl, b"stsc", "stbl")?);
    r.full_box_header()?;
    let n = r.table_len(12, "Sample-to-chunk")?;
    let mut runs = Vec::with_capacity(n);
    for _ in 0..n {
        let first_chunk = r.u32()?;
        let per_chunk = r.u32()?;
        r.skip(4)?;
        runs.push((first_chunk.max(1) as usize, per_chunk as usize));
    }

    let mut offsets = Vec::with_capacity(sizes.len());
    let mut sample = 0usize;
    for (run, &(first_chunk, per_chunk)) in runs.iter().enumerate() {
        let last_chunk = runs
            .get(run + 1)
            .map(|&(next, _)| next - 1)
            .unwrap_or(chunk_offsets.len());
        for chunk in first_chunk..=last_chunk {
            let Some(&base) = chunk_offsets.get(chunk - 1) else {
                break;
            };
            let mut offset = base;
            for _ in 0..per_chunk {
                let Some(&size) = sizes.get(sample) else {
                    break;
                };
                offsets.push(offset);
                offset += u64::from(size);
                sample += 1;
            }
        }
    }

    if offsets.len() != sizes.len() {
        return Err(RecorderError::StreamIOFailure(format!(
            "Chunk tables locate {} of {} samples",
            offsets.len(),
            sizes.len()
        )));
    }
    Ok(offsets)
}

fn decode_times(stts: &[u8], count: usize) -> Result<Vec<i64>> {
    let mut r = ByteReader::new(stts);
    r.full_box_header()?;
    let entries = r.table_len(8, "Time-to-sample")?;
    let mut times = Vec::with_capacity(count);
    let mut t = 0i64;
    for _ in 0..entries {
        let n = r.u32()?;
        let delta = i64::from(r.u32()?);
        for _ in 0..n {
            if times.len() == count {
                break;
            }
            times.push(t);
            t += delta;
        }
    }
    if times.len() != count {
        return Err(RecorderError::StreamIOFailure(format!(
            "Time-to-sample table covers {} of {} samples",
            times.len(),
            count
        )));
    }
    Ok(times)
}

fn composition_offsets(ctts: &[u8], count: usize) -> Result<Vec<i64>> {
    let mut r = ByteReader::new(ctts);
    r.full_box_header()?;
    let entries = r.table_len(8, "Composition offset")?;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..entries {
        let n = r.u32()?;
        // Version 0 offsets are unsigned but writers routinely store signed values.
        let offset = i64::from(r.i32()?);
        for _ in 0..n {
            if offsets.len() == count {
                break;
            }
            offsets.push(offset);
        }
    }
    offsets.resize(count, 0);
    Ok(offsets)
}

fn sync_samples(stss: &[u8]) -> Result<HashSet<usize>> {
    let mut r = ByteReader::new(stss);
    r.full_box_header()?;
    let n = r.table_len(4, "Sync sample")?;
    (0..n).map(|_| r.u32().map(|v| v as usize)).collect()
}
