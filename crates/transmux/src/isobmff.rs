//! ISOBMFF box reading for fragmented MP4 passthrough.
//!
//! Just enough parsing to describe an init segment (tracks, timescales, codecs)
//! and to time media fragments from `tfdt` and `trun`.

use bytes::Bytes;
use tracing::debug;

/// Parsed view over a single box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fourcc: [u8; 4],
    pub(crate) body_start: usize,
    pub(crate) body_end: usize,
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`),
/// and box-extends-to-EOF (`size == 0`).
pub(crate) fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some((ext_size as usize, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Parse a single complete box located at `offset` within `[0..end)`.
pub(crate) fn box_at(data: &[u8], offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }
    let (size, fourcc, header_size) = read_box_header(&data[offset..end])?;
    if size < header_size || offset + size > end {
        return None;
    }
    Some(BoxView {
        start: offset,
        end: offset + size,
        fourcc,
        body_start: offset + header_size,
        body_end: offset + size,
    })
}

/// All complete child boxes inside `[start..end)`.
pub(crate) fn children(data: &[u8], start: usize, end: usize) -> Vec<BoxView> {
    let mut boxes = Vec::new();
    let mut offset = start;
    while let Some(parsed) = box_at(data, offset, end) {
        offset = parsed.end;
        boxes.push(parsed);
    }
    boxes
}

/// Find the first child box with the given FourCC inside `[start..end)`.
pub(crate) fn find_first_box(
    data: &[u8],
    start: usize,
    end: usize,
    target: [u8; 4],
) -> Option<BoxView> {
    children(data, start, end)
        .into_iter()
        .find(|b| b.fourcc == target)
}

/// Follow a path of FourCCs from the top level.
pub(crate) fn find_path(data: &[u8], path: &[[u8; 4]]) -> Option<BoxView> {
    let (mut start, mut end) = (0, data.len());
    let mut found = None;
    for fourcc in path {
        let parsed = find_first_box(data, start, end, *fourcc)?;
        start = parsed.body_start;
        end = parsed.body_end;
        found = Some(parsed);
    }
    found
}

fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u64(data: &[u8], offset: usize) -> Option<u64> {
    let b = data.get(offset..offset + 8)?;
    Some(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    pub id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub codec: String,
    /// `trex` default sample duration.
    pub default_duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitSegmentInfo {
    pub tracks: Vec<InitTrack>,
}

impl InitSegmentInfo {
    pub fn track(&self, id: u32) -> Option<&InitTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn first_of(&self, kind: TrackKind) -> Option<&InitTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Bytes in a visual sample entry body before its child boxes.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 78;
/// Bytes in an audio sample entry body before its child boxes.
const AUDIO_SAMPLE_ENTRY_HEADER: usize = 28;

/// Parse `moov` into a track list. Returns `None` when there is no `moov`.
pub fn parse_init_segment(data: &[u8]) -> Option<InitSegmentInfo> {
    let moov = find_first_box(data, 0, data.len(), *b"moov")?;
    let mut info = InitSegmentInfo::default();

    for trak in children(data, moov.body_start, moov.body_end)
        .into_iter()
        .filter(|b| b.fourcc == *b"trak")
    {
        let Some(track) = parse_trak(data, trak) else {
            continue;
        };
        debug!(id = track.id, kind = ?track.kind, timescale = track.timescale, codec = %track.codec, "Found fMP4 track");
        info.tracks.push(track);
    }

    if let Some(mvex) = find_first_box(data, moov.body_start, moov.body_end, *b"mvex") {
        for trex in children(data, mvex.body_start, mvex.body_end)
            .into_iter()
            .filter(|b| b.fourcc == *b"trex")
        {
            let (Some(id), Some(duration)) = (
                be_u32(data, trex.body_start + 4),
                be_u32(data, trex.body_start + 12),
            ) else {
                continue;
            };
            if let Some(track) = info.tracks.iter_mut().find(|t| t.id == id) {
                track.default_duration = duration;
            }
        }
    }
    Some(info)
}

fn parse_trak(data: &[u8], trak: BoxView) -> Option<InitTrack> {
    let tkhd = find_first_box(data, trak.body_start, trak.body_end, *b"tkhd")?;
    let version = *data.get(tkhd.body_start)?;
    let id_offset = if version == 1 { 20 } else { 12 };
    let id = be_u32(data, tkhd.body_start + id_offset)?;

    let mdia = find_first_box(data, trak.body_start, trak.body_end, *b"mdia")?;
    let mdhd = find_first_box(data, mdia.body_start, mdia.body_end, *b"mdhd")?;
    let mdhd_version = *data.get(mdhd.body_start)?;
    let timescale_offset = if mdhd_version == 1 { 20 } else { 12 };
    let timescale = be_u32(data, mdhd.body_start + timescale_offset)?;

    let hdlr = find_first_box(data, mdia.body_start, mdia.body_end, *b"hdlr")?;
    let handler = data.get(hdlr.body_start + 8..hdlr.body_start + 12)?;
    let kind = match handler {
        b"soun" => TrackKind::Audio,
        b"vide" => TrackKind::Video,
        _ => TrackKind::Other,
    };

    let stbl = find_first_box(data, mdia.body_start, mdia.body_end, *b"minf")
        .and_then(|minf| find_first_box(data, minf.body_start, minf.body_end, *b"stbl"));
    let codec = stbl
        .and_then(|stbl| find_first_box(data, stbl.body_start, stbl.body_end, *b"stsd"))
        .and_then(|stsd| sample_entry_codec(data, stsd))
        .unwrap_or_default();

    Some(InitTrack {
        id,
        kind,
        timescale,
        codec,
        default_duration: 0,
    })
}

/// RFC 6381 codec string of the first sample entry.
fn sample_entry_codec(data: &[u8], stsd: BoxView) -> Option<String> {
    let entry = box_at(data, stsd.body_start + 8, stsd.body_end)?;
    let fourcc = String::from_utf8_lossy(&entry.fourcc).into_owned();
    match &entry.fourcc {
        b"avc1" | b"avc3" => {
            let avcc = find_first_box(
                data,
                entry.body_start + VISUAL_SAMPLE_ENTRY_HEADER,
                entry.body_end,
                *b"avcC",
            )?;
            let p = data.get(avcc.body_start + 1..avcc.body_start + 4)?;
            Some(format!("{fourcc}.{:02x}{:02x}{:02x}", p[0], p[1], p[2]))
        }
        b"mp4a" => {
            let object_type = find_first_box(
                data,
                entry.body_start + AUDIO_SAMPLE_ENTRY_HEADER,
                entry.body_end,
                *b"esds",
            )
            .and_then(|esds| esds_audio_object_type(&data[esds.body_start..esds.body_end]))
            .unwrap_or(2);
            Some(format!("mp4a.40.{object_type}"))
        }
        _ => Some(fourcc),
    }
}

/// Audio object type from the DecoderSpecificInfo inside an `esds` body.
fn esds_audio_object_type(esds: &[u8]) -> Option<u8> {
    // Walk descriptors after version and flags: ES (0x03), DecoderConfig (0x04),
    // DecoderSpecificInfo (0x05).
    let mut offset = 4;
    while offset < esds.len() {
        let tag = esds[offset];
        offset += 1;
        let mut len = 0usize;
        for _ in 0..4 {
            let b = *esds.get(offset)?;
            offset += 1;
            len = (len << 7) | (b & 0x7F) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        match tag {
            0x03 => {
                let flags = *esds.get(offset + 2)?;
                offset += 3;
                if flags & 0x80 != 0 {
                    offset += 2;
                }
                if flags & 0x40 != 0 {
                    offset += 1 + *esds.get(offset)? as usize;
                }
                if flags & 0x20 != 0 {
                    offset += 2;
                }
            }
            0x04 => offset += 13,
            0x05 => return esds.get(offset).map(|b| b >> 3),
            _ => offset += len,
        }
    }
    None
}

/// Timing of one track within a `moof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentTiming {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub duration: u64,
}

/// Timing of every `traf` in every `moof` of `data`.
pub fn fragment_timings(data: &[u8], init: &InitSegmentInfo) -> Vec<FragmentTiming> {
    let mut timings = Vec::new();
    for moof in children(data, 0, data.len())
        .into_iter()
        .filter(|b| b.fourcc == *b"moof")
    {
        for traf in children(data, moof.body_start, moof.body_end)
            .into_iter()
            .filter(|b| b.fourcc == *b"traf")
        {
            if let Some(timing) = parse_traf(data, traf, init) {
                timings.push(timing);
            }
        }
    }
    timings
}

fn parse_traf(data: &[u8], traf: BoxView, init: &InitSegmentInfo) -> Option<FragmentTiming> {
    let tfhd = find_first_box(data, traf.body_start, traf.body_end, *b"tfhd")?;
    let tfhd_flags = be_u32(data, tfhd.body_start)? & 0x00FF_FFFF;
    let track_id = be_u32(data, tfhd.body_start + 4)?;
    let mut cursor = tfhd.body_start + 8;
    if tfhd_flags & 0x01 != 0 {
        cursor += 8;
    }
    if tfhd_flags & 0x02 != 0 {
        cursor += 4;
    }
    let default_duration = if tfhd_flags & 0x08 != 0 {
        be_u32(data, cursor)?
    } else {
        init.track(track_id).map_or(0, |t| t.default_duration)
    };

    let tfdt = find_first_box(data, traf.body_start, traf.body_end, *b"tfdt")?;
    let base_decode_time = if data.get(tfdt.body_start) == Some(&1) {
        be_u64(data, tfdt.body_start + 4)?
    } else {
        be_u32(data, tfdt.body_start + 4)? as u64
    };

    let mut duration = 0u64;
    for trun in children(data, traf.body_start, traf.body_end)
        .into_iter()
        .filter(|b| b.fourcc == *b"trun")
    {
        duration += trun_duration(data, trun, default_duration)?;
    }

    Some(FragmentTiming {
        track_id,
        base_decode_time,
        duration,
    })
}

fn trun_duration(data: &[u8], trun: BoxView, default_duration: u32) -> Option<u64> {
    let flags = be_u32(data, trun.body_start)? & 0x00FF_FFFF;
    let sample_count = be_u32(data, trun.body_start + 4)? as u64;
    if flags & 0x100 == 0 {
        return Some(sample_count * default_duration as u64);
    }
    let mut cursor = trun.body_start + 8;
    if flags & 0x01 != 0 {
        cursor += 4;
    }
    if flags & 0x04 != 0 {
        cursor += 4;
    }
    let stride = [0x100u32, 0x200, 0x400, 0x800]
        .iter()
        .filter(|f| flags & **f != 0)
        .count()
        * 4;
    let mut total = 0u64;
    for i in 0..sample_count as usize {
        total += be_u32(data, cursor + i * stride)? as u64;
    }
    Some(total)
}

/// Subtract `offset_90k` (converted to each track's timescale) from every `tfdt`.
///
/// Decode times are clamped at zero.
pub fn rebase_decode_times(data: &mut [u8], init: &InitSegmentInfo, offset_90k: i64) {
    let mut patches = Vec::new();
    for moof in children(data, 0, data.len())
        .into_iter()
        .filter(|b| b.fourcc == *b"moof")
    {
        for traf in children(data, moof.body_start, moof.body_end)
            .into_iter()
            .filter(|b| b.fourcc == *b"traf")
        {
            let Some(track_id) = find_first_box(data, traf.body_start, traf.body_end, *b"tfhd")
                .and_then(|tfhd| be_u32(data, tfhd.body_start + 4))
            else {
                continue;
            };
            let Some(timescale) = init.track(track_id).map(|t| t.timescale) else {
                continue;
            };
            if let Some(tfdt) = find_first_box(data, traf.body_start, traf.body_end, *b"tfdt") {
                patches.push((tfdt, timescale));
            }
        }
    }

    for (tfdt, timescale) in patches {
        let offset = (offset_90k as i128 * timescale as i128 / 90_000) as i64;
        let value_at = tfdt.body_start + 4;
        if data.get(tfdt.body_start) == Some(&1) {
            let Some(base) = be_u64(data, value_at) else {
                continue;
            };
            let rebased = (base as i64).saturating_sub(offset).max(0) as u64;
            data[value_at..value_at + 8].copy_from_slice(&rebased.to_be_bytes());
        } else {
            let Some(base) = be_u32(data, value_at) else {
                continue;
            };
            let rebased = (base as i64 - offset).clamp(0, u32::MAX as i64) as u32;
            data[value_at..value_at + 4].copy_from_slice(&rebased.to_be_bytes());
        }
    }
}

/// Split `data` at the end of its last complete top-level box.
///
/// Returns the complete prefix and the trailing partial box, if any.
pub fn split_complete_boxes(data: &Bytes) -> (Bytes, Bytes) {
    let mut offset = 0;
    while let Some(parsed) = box_at(data, offset, data.len()) {
        // A box claiming to run to EOF may still be growing.
        if u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
            == 0
        {
            break;
        }
        offset = parsed.end;
    }
    (data.slice(..offset), data.slice(offset..))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remux::boxes;

    pub(crate) fn init_segment(video_timescale: u32, audio_timescale: u32) -> Vec<u8> {
        boxes::tests::sample_init(video_timescale, audio_timescale)
    }

    #[test]
    fn test_read_box_header_variants() {
        let normal = [0, 0, 0, 16, b'f', b't', b'y', b'p'];
        assert_eq!(read_box_header(&normal), Some((16, *b"ftyp", 8)));

        let mut large = vec![0, 0, 0, 1, b'm', b'd', b'a', b't'];
        large.extend_from_slice(&32u64.to_be_bytes());
        assert_eq!(read_box_header(&large), Some((32, *b"mdat", 16)));

        let eof = [0, 0, 0, 0, b'm', b'd', b'a', b't', 1, 2];
        assert_eq!(read_box_header(&eof), Some((10, *b"mdat", 8)));
    }

    #[test]
    fn test_parse_generated_init_segment() {
        let data = init_segment(90_000, 44_100);
        let info = parse_init_segment(&data).unwrap();
        assert_eq!(info.tracks.len(), 2);
        let video = info.first_of(TrackKind::Video).unwrap();
        assert_eq!(video.timescale, 90_000);
        assert_eq!(video.codec, "avc1.42c01e");
        let audio = info.first_of(TrackKind::Audio).unwrap();
        assert_eq!(audio.timescale, 44_100);
        assert_eq!(audio.codec, "mp4a.40.2");
    }

    #[test]
    fn test_split_complete_boxes() {
        let mut data = vec![0, 0, 0, 8, b'f', b'r', b'e', b'e'];
        data.extend_from_slice(&[0, 0, 0, 20, b'm', b'd', b'a', b't', 1, 2]);
        let data = Bytes::from(data);
        let (complete, rest) = split_complete_boxes(&data);
        assert_eq!(complete.len(), 8);
        assert_eq!(rest.len(), 10);
    }
}
