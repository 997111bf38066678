//! Sample description entries (`stsd` children) for the supported codecs.
//!
//! The `codec_config` blob of a [`TrackDescriptor`] maps onto the container as:
//! - `video/avc`: body of the `avcC` box (AVCDecoderConfigurationRecord)
//! - `video/hevc`: body of the `hvcC` box (HEVCDecoderConfigurationRecord)
//! - `audio/mp4a-latm`: AudioSpecificConfig, carried inside `esds`
//! - `audio/opus`: body of the `dOps` box

use bytes::Bytes;

use super::boxes::{build_box, build_full_box, children, find_child, ByteReader};
use crate::errors::{RecorderError, Result};
use crate::types::{MediaParams, TrackDescriptor, MIME_AAC, MIME_AVC, MIME_HEVC, MIME_OPUS};

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Two-byte AAC-LC AudioSpecificConfig for the given stream layout.
pub fn audio_specific_config(sample_rate: u32, channel_count: u16) -> [u8; 2] {
    let sfi = AAC_SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(4) as u8;
    let aot = 2u8;
    let chan = (channel_count.min(15) as u8) & 0x0f;
    [(aot << 3) | (sfi >> 1), ((sfi & 1) << 7) | (chan << 3)]
}

/// Default `dOps` body (channel mapping family 0).
pub fn opus_identification(channel_count: u16, input_sample_rate: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(11);
    body.push(0);
    body.push(channel_count.min(2) as u8);
    body.extend_from_slice(&312u16.to_be_bytes());
    body.extend_from_slice(&input_sample_rate.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    body.push(0);
    body
}

/// Build the `stsd` box for one track.
pub(crate) fn build_stsd_box(descriptor: &TrackDescriptor) -> Result<Vec<u8>> {
    let entry = build_sample_entry(descriptor)?;
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(&entry);
    Ok(build_full_box(b"stsd", 0, 0, &payload))
}

fn build_sample_entry(descriptor: &TrackDescriptor) -> Result<Vec<u8>> {
    match (descriptor.mime.as_str(), &descriptor.media) {
        (MIME_AVC, MediaParams::Video { width, height, .. }) => {
            let config = require_config(descriptor)?;
            build_visual_entry(b"avc1", *width, *height, &build_box(b"avcC", config))
        }
        (MIME_HEVC, MediaParams::Video { width, height, .. }) => {
            let config = require_config(descriptor)?;
            build_visual_entry(b"hvc1", *width, *height, &build_box(b"hvcC", config))
        }
        (
            MIME_AAC,
            MediaParams::Audio {
                sample_rate,
                channel_count,
                bit_rate,
            },
        ) => {
            let asc = if descriptor.codec_config.is_empty() {
                audio_specific_config(*sample_rate, *channel_count).to_vec()
            } else {
                descriptor.codec_config.to_vec()
            };
            let esds = build_esds_box(&asc, *bit_rate);
            Ok(build_audio_entry(b"mp4a", *channel_count, *sample_rate, &esds))
        }
        (
            MIME_OPUS,
            MediaParams::Audio {
                sample_rate,
                channel_count,
                ..
            },
        ) => {
            let dops = if descriptor.codec_config.is_empty() {
                opus_identification(*channel_count, *sample_rate)
            } else {
                descriptor.codec_config.to_vec()
            };
            Ok(build_audio_entry(
                b"Opus",
                *channel_count,
                48_000,
                &build_box(b"dOps", &dops),
            ))
        }
        (mime, media) => Err(RecorderError::ConfigurationRejected(format!(
            "Unsupported track format {} ({:?})",
            mime, media
        ))),
    }
}

fn require_config(descriptor: &TrackDescriptor) -> Result<&[u8]> {
    if descriptor.codec_config.is_empty() {
        return Err(RecorderError::ConfigurationRejected(format!(
            "{} track is missing its decoder configuration record",
            descriptor.mime
        )));
    }
    Ok(&descriptor.codec_config)
}

fn build_visual_entry(fourcc: &[u8; 4], width: u32, height: u32, config_box: &[u8]) -> Result<Vec<u8>> {
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(RecorderError::ConfigurationRejected(format!(
            "Frame size {}x{} does not fit a visual sample entry",
            width, height
        )));
    }
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0u8; 6]);
    payload.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    payload.extend_from_slice(&[0u8; 16]);
    payload.extend_from_slice(&(width as u16).to_be_bytes());
    payload.extend_from_slice(&(height as u16).to_be_bytes());
    payload.extend_from_slice(&0x0048_0000_u32.to_be_bytes());
    payload.extend_from_slice(&0x0048_0000_u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    payload.extend_from_slice(&[0u8; 32]);
    payload.extend_from_slice(&0x0018u16.to_be_bytes());
    payload.extend_from_slice(&0xffffu16.to_be_bytes());
    payload.extend_from_slice(config_box);
    Ok(build_box(fourcc, &payload))
}

fn build_audio_entry(fourcc: &[u8; 4], channel_count: u16, sample_rate: u32, config_box: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0u8; 6]);
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&channel_count.to_be_bytes());
    payload.extend_from_slice(&16u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    // 16.16 fixed point; rates above 65535 Hz saturate
    let rate_fixed = sample_rate.min(0xffff) << 16;
    payload.extend_from_slice(&rate_fixed.to_be_bytes());
    payload.extend_from_slice(config_box);
    build_box(fourcc, &payload)
}

fn push_descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    let len = body.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&[
            0x80 | ((len >> 21) & 0x7f) as u8,
            0x80 | ((len >> 14) & 0x7f) as u8,
            0x80 | ((len >> 7) & 0x7f) as u8,
            (len & 0x7f) as u8,
        ]);
    }
    out.extend_from_slice(body);
}

fn build_esds_box(asc: &[u8], bit_rate: u32) -> Vec<u8> {
    let mut dec_specific = Vec::new();
    push_descriptor(&mut dec_specific, 0x05, asc);

    let mut dec_config_body = Vec::new();
    dec_config_body.push(0x40); // MPEG-4 audio
    dec_config_body.push(0x15); // audio stream
    dec_config_body.extend_from_slice(&[0x00, 0x00, 0x00]);
    dec_config_body.extend_from_slice(&bit_rate.to_be_bytes());
    dec_config_body.extend_from_slice(&bit_rate.to_be_bytes());
    dec_config_body.extend_from_slice(&dec_specific);

    let mut es_body = Vec::new();
    es_body.extend_from_slice(&0u16.to_be_bytes());
    es_body.push(0);
    push_descriptor(&mut es_body, 0x04, &dec_config_body);
    push_descriptor(&mut es_body, 0x06, &[0x02]);

    let mut es = Vec::new();
    push_descriptor(&mut es, 0x03, &es_body);
    build_full_box(b"esds", 0, 0, &es)
}

/// Parse the first sample entry of an `stsd` payload into a descriptor.
///
/// `frame_rate` is not stored in the container; callers pass an estimate.
pub(crate) fn parse_stsd(stsd: &[u8], frame_rate: u32) -> Result<TrackDescriptor> {
    let mut reader = ByteReader::new(stsd);
    reader.full_box_header()?;
    let count = reader.u32()?;
    if count == 0 {
        return Err(RecorderError::StreamIOFailure(
            "Sample description table is empty".to_string(),
        ));
    }
    let (fourcc, entry) = children(reader.rest()).next().ok_or_else(|| {
        RecorderError::StreamIOFailure("Sample description entry missing".to_string())
    })??;

    match &fourcc {
        b"avc1" | b"avc3" => parse_visual_entry(entry, MIME_AVC, b"avcC", frame_rate),
        b"hvc1" | b"hev1" => parse_visual_entry(entry, MIME_HEVC, b"hvcC", frame_rate),
        b"mp4a" => {
            let (channel_count, sample_rate, boxes) = parse_audio_entry(entry)?;
            let esds = find_child(boxes, b"esds")?.ok_or_else(|| {
                RecorderError::StreamIOFailure("mp4a entry has no esds box".to_string())
            })?;
            let (asc, bit_rate) = parse_esds(esds)?;
            Ok(TrackDescriptor::audio(
                MIME_AAC,
                sample_rate,
                channel_count,
                bit_rate,
                Bytes::copy_from_slice(asc),
            ))
        }
        b"Opus" => {
            let (channel_count, _, boxes) = parse_audio_entry(entry)?;
            let dops = find_child(boxes, b"dOps")?.ok_or_else(|| {
                RecorderError::StreamIOFailure("Opus entry has no dOps box".to_string())
            })?;
            let mut r = ByteReader::new(dops);
            r.skip(4)?;
            let input_rate = r.u32()?;
            Ok(TrackDescriptor::audio(
                MIME_OPUS,
                input_rate,
                channel_count,
                0,
                Bytes::copy_from_slice(dops),
            ))
        }
        other => Err(RecorderError::ConfigurationRejected(format!(
            "Unsupported sample entry '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn parse_visual_entry(entry: &[u8], mime: &str, config_typ: &[u8; 4], frame_rate: u32) -> Result<TrackDescriptor> {
    let mut r = ByteReader::new(entry);
    r.skip(24)?;
    let width = r.u16()? as u32;
    let height = r.u16()? as u32;
    r.skip(50)?;
    let config = find_child(r.rest(), config_typ)?.ok_or_else(|| {
        RecorderError::StreamIOFailure(format!(
            "{} entry has no '{}' box",
            mime,
            String::from_utf8_lossy(config_typ)
        ))
    })?;
    Ok(TrackDescriptor::video(
        mime,
        width,
        height,
        frame_rate,
        Bytes::copy_from_slice(config),
    ))
}

fn parse_audio_entry(entry: &[u8]) -> Result<(u16, u32, &[u8])> {
    let mut r = ByteReader::new(entry);
    r.skip(8)?;
    let version = r.u16()?;
    if version != 0 {
        return Err(RecorderError::ConfigurationRejected(format!(
            "Unsupported sound sample entry version {}",
            version
        )));
    }
    r.skip(6)?;
    let channel_count = r.u16()?;
    r.skip(6)?;
    let sample_rate = r.u32()? >> 16;
    Ok((channel_count, sample_rate, r.rest()))
}

fn read_descriptor<'a>(r: &mut ByteReader<'a>) -> Result<(u8, &'a [u8])> {
    let tag = r.u8()?;
    let mut len = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        len = (len << 7) | (b & 0x7f) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, r.bytes(len)?))
}

/// AudioSpecificConfig and average bitrate from an `esds` payload.
fn parse_esds(esds: &[u8]) -> Result<(&[u8], u32)> {
    let mut r = ByteReader::new(esds);
    r.full_box_header()?;
    let (tag, es) = read_descriptor(&mut r)?;
    if tag != 0x03 {
        return Err(RecorderError::StreamIOFailure(format!(
            "esds starts with descriptor tag {:#04x}",
            tag
        )));
    }
    let mut es = ByteReader::new(es);
    es.skip(2)?;
    let flags = es.u8()?;
    if flags & 0x80 != 0 {
        es.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = es.u8()? as usize;
        es.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        es.skip(2)?;
    }

    while es.remaining() > 0 {
        let (tag, body) = read_descriptor(&mut es)?;
        if tag != 0x04 {
            continue;
        }
        let mut dc = ByteReader::new(body);
        dc.skip(5)?;
        let _max_bitrate = dc.u32()?;
        let avg_bitrate = dc.u32()?;
        while dc.remaining() > 0 {
            let (tag, asc) = read_descriptor(&mut dc)?;
            if tag == 0x05 {
                return Ok((asc, avg_bitrate));
            }
        }
    }
    Err(RecorderError::StreamIOFailure(
        "esds carries no AudioSpecificConfig".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stsd_payload(descriptor: &TrackDescriptor) -> Vec<u8> {
        build_stsd_box(descriptor).unwrap()[8..].to_vec()
    }

    #[test]
    fn test_asc_for_44100_stereo() {
        assert_eq!(audio_specific_config(44_100, 2), [0x12, 0x10]);
        assert_eq!(audio_specific_config(48_000, 1), [0x11, 0x88]);
    }

    #[test]
    fn test_aac_entry_roundtrip() {
        let d = TrackDescriptor::audio(MIME_AAC, 44_100, 2, 192_000, vec![0x12u8, 0x10]);
        let parsed = parse_stsd(&stsd_payload(&d), 0).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_aac_entry_fills_missing_asc() {
        let d = TrackDescriptor::audio(MIME_AAC, 48_000, 1, 96_000, Bytes::new());
        let parsed = parse_stsd(&stsd_payload(&d), 0).unwrap();
        assert_eq!(&parsed.codec_config[..], &[0x11, 0x88]);
    }

    #[test]
    fn test_avc_entry_roundtrip() {
        let avcc = vec![1u8, 0x42, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x02, 0x67, 0x42, 0x01, 0x00, 0x01, 0x68];
        let d = TrackDescriptor::video(MIME_AVC, 1280, 720, 60, avcc);
        let parsed = parse_stsd(&stsd_payload(&d), 60).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_opus_entry_roundtrip() {
        let d = TrackDescriptor::audio(MIME_OPUS, 48_000, 2, 0, opus_identification(2, 48_000));
        let parsed = parse_stsd(&stsd_payload(&d), 0).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_video_without_config_rejected() {
        let d = TrackDescriptor::video(MIME_AVC, 640, 480, 30, Bytes::new());
        assert!(matches!(
            build_stsd_box(&d),
            Err(RecorderError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let d = TrackDescriptor::audio("audio/flac", 44_100, 2, 0, vec![1u8]);
        assert!(matches!(
            build_stsd_box(&d),
            Err(RecorderError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn test_long_descriptor_length_encoding() {
        let mut out = Vec::new();
        push_descriptor(&mut out, 0x05, &[7u8; 200]);
        let mut r = ByteReader::new(&out);
        let (tag, body) = read_descriptor(&mut r).unwrap();
        assert_eq!(tag, 0x05);
        assert_eq!(body.len(), 200);
    }
}
