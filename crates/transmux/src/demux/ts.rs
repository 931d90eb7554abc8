//! MPEG-2 transport stream demuxer.
//!
//! Packets are walked in 188-byte steps. PAT and PMT select the audio, video and
//! ID3 elementary streams, whose PES packets are reassembled per PID and parsed
//! into samples once the next unit start (or a flush) closes them.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::audio::{FrameScan, scan_frames};
use super::avc::{self, NAL_AUD, NAL_IDR, NAL_PPS, NAL_SEI, NAL_SLICE, NAL_SPS};
use super::{AudioCodecKind, AudioConfig, ElementaryTracks, TimedSample, VideoConfig, VideoSample};

pub const PACKET_LEN: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const MIN_PROBE_LEN: usize = PACKET_LEN * 3;
const SYNC_SCAN_WINDOW: usize = 1000;

const PID_PAT: u16 = 0x0000;

const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
const STREAM_TYPE_ADTS: u8 = 0x0F;
const STREAM_TYPE_METADATA: u8 = 0x15;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_SAMPLE_AES_ADTS: u8 = 0xCF;
const STREAM_TYPE_SAMPLE_AES_H264: u8 = 0xDB;

/// Offset of the first of three consecutive sync bytes, searched within the
/// first kilobyte.
pub fn sync_offset(data: &[u8]) -> Option<usize> {
    if data.len() < MIN_PROBE_LEN {
        return None;
    }
    let window = SYNC_SCAN_WINDOW.min(data.len() - MIN_PROBE_LEN + 1);
    (0..window).find(|&i| {
        data[i] == SYNC_BYTE
            && data[i + PACKET_LEN] == SYNC_BYTE
            && data[i + 2 * PACKET_LEN] == SYNC_BYTE
    })
}

pub fn probe(data: &[u8]) -> bool {
    match sync_offset(data) {
        Some(0) => true,
        Some(offset) => {
            warn!(offset, "MPEG-TS sync byte found after leading garbage");
            true
        }
        None => false,
    }
}

/// Parse a 33-bit PTS or DTS timestamp from 5 bytes.
fn parse_timestamp(data: &[u8]) -> i64 {
    (((data[0] as i64 >> 1) & 0x07) << 30)
        | ((data[1] as i64) << 22)
        | (((data[2] as i64 >> 1) & 0x7F) << 15)
        | ((data[3] as i64) << 7)
        | ((data[4] as i64 >> 1) & 0x7F)
}

#[derive(Debug)]
struct Pes {
    pts: Option<i64>,
    dts: Option<i64>,
    payload: Bytes,
}

fn parse_pes(data: Bytes) -> Option<Pes> {
    if data.len() < 9 || data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
        return None;
    }
    let pts_dts_flags = (data[7] >> 6) & 0x03;
    let header_end = 9 + data[8] as usize;
    if header_end > data.len() {
        return None;
    }
    let (pts, dts) = match pts_dts_flags {
        0b10 if header_end >= 14 => (Some(parse_timestamp(&data[9..14])), None),
        0b11 if header_end >= 19 => {
            let pts = parse_timestamp(&data[9..14]);
            let mut dts = parse_timestamp(&data[14..19]);
            // A DTS more than 10 s away from its PTS is treated as bogus.
            if (pts - dts).abs() > 60 * 90_000 / 6 {
                dts = pts;
            }
            (Some(pts), Some(dts))
        }
        _ => (None, None),
    };
    Some(Pes {
        pts,
        dts,
        payload: data.slice(header_end..),
    })
}

/// Payload bytes of one elementary stream, collected until the PES closes.
#[derive(Debug, Default)]
struct PesBuffer {
    chunks: Vec<Bytes>,
    len: usize,
}

impl PesBuffer {
    fn push(&mut self, payload: Bytes) {
        self.len += payload.len();
        self.chunks.push(payload);
    }

    fn take(&mut self) -> Option<Bytes> {
        if self.chunks.is_empty() {
            return None;
        }
        let len = std::mem::take(&mut self.len);
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.len() == 1 {
            return chunks.into_iter().next();
        }
        let mut out = BytesMut::with_capacity(len);
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        Some(out.freeze())
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[derive(Debug, Default)]
pub struct TsDemuxer {
    synced: bool,
    remainder: Option<Bytes>,
    pmt_pid: Option<u16>,
    audio_pid: Option<u16>,
    audio_kind: AudioCodecKind,
    video_pid: Option<u16>,
    id3_pid: Option<u16>,
    audio_pes: PesBuffer,
    video_pes: PesBuffer,
    id3_pes: PesBuffer,
    audio_overflow: Option<Bytes>,
    last_audio_pts: Option<i64>,
    audio_config: Option<AudioConfig>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    video_config: Option<VideoConfig>,
    audio_codec_hint: Option<String>,
    out: ElementaryTracks,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn demux(&mut self, data: Bytes) -> ElementaryTracks {
        let buf = match self.remainder.take() {
            Some(rem) => {
                let mut joined = BytesMut::with_capacity(rem.len() + data.len());
                joined.extend_from_slice(&rem);
                joined.extend_from_slice(&data);
                joined.freeze()
            }
            None => data,
        };

        let start = if self.synced {
            0
        } else {
            match sync_offset(&buf) {
                Some(offset) => offset,
                None if buf.len() < MIN_PROBE_LEN => {
                    self.remainder = (!buf.is_empty()).then_some(buf);
                    return self.take_output();
                }
                None => {
                    warn!("No MPEG-TS sync found, assuming packet alignment");
                    0
                }
            }
        };
        self.synced = true;

        let usable = (buf.len() - start) / PACKET_LEN * PACKET_LEN;
        let end = start + usable;
        if end < buf.len() {
            self.remainder = Some(buf.slice(end..));
        }

        let mut offset = start;
        while offset < end {
            let packet = buf.slice(offset..offset + PACKET_LEN);
            offset += PACKET_LEN;
            if packet[0] != SYNC_BYTE {
                warn!(offset = offset - PACKET_LEN, "Skipping packet with bad sync byte");
                continue;
            }
            self.handle_packet(&packet);
        }

        self.take_output()
    }

    pub fn flush(&mut self) -> ElementaryTracks {
        if let Some(rem) = self.remainder.take() {
            debug!(bytes = rem.len(), "Dropping incomplete TS packet on flush");
        }
        if let Some(data) = self.video_pes.take() {
            self.parse_video_pes(data);
        }
        if let Some(data) = self.audio_pes.take() {
            self.parse_audio_pes(data);
        }
        if let Some(data) = self.id3_pes.take() {
            self.parse_id3_pes(data);
        }
        self.take_output()
    }

    pub fn reset_init_segment(&mut self, audio_codec: Option<&str>, _video_codec: Option<&str>) {
        self.pmt_pid = None;
        self.audio_pid = None;
        self.video_pid = None;
        self.id3_pid = None;
        self.audio_config = None;
        self.video_config = None;
        self.sps = None;
        self.pps = None;
        self.audio_codec_hint = audio_codec.map(str::to_owned);
    }

    pub fn reset_contiguity(&mut self) {
        self.synced = false;
        self.remainder = None;
        self.audio_pes.clear();
        self.video_pes.clear();
        self.id3_pes.clear();
        self.audio_overflow = None;
        self.last_audio_pts = None;
    }

    fn take_output(&mut self) -> ElementaryTracks {
        let mut out = std::mem::take(&mut self.out);
        out.audio.config = self.audio_config.clone();
        out.video.config = self.video_config.clone();
        out
    }

    fn handle_packet(&mut self, packet: &Bytes) {
        let pusi = packet[1] & 0x40 != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let afc = (packet[3] >> 4) & 0x03;

        let mut payload_start = 4;
        if afc == 0x02 || afc == 0x03 {
            payload_start += 1 + packet[4] as usize;
        }
        if afc == 0x00 || afc == 0x02 || payload_start >= PACKET_LEN {
            return;
        }
        let payload = packet.slice(payload_start..);

        if pid == PID_PAT {
            if pusi {
                self.parse_pat(&payload);
            }
        } else if Some(pid) == self.pmt_pid {
            if pusi {
                self.parse_pmt(&payload);
            }
        } else if Some(pid) == self.video_pid {
            if pusi && let Some(data) = self.video_pes.take() {
                self.parse_video_pes(data);
            }
            self.video_pes.push(payload);
        } else if Some(pid) == self.audio_pid {
            if pusi && let Some(data) = self.audio_pes.take() {
                self.parse_audio_pes(data);
            }
            self.audio_pes.push(payload);
        } else if Some(pid) == self.id3_pid {
            if pusi && let Some(data) = self.id3_pes.take() {
                self.parse_id3_pes(data);
            }
            self.id3_pes.push(payload);
        }
    }

    /// Section payload after the pointer field.
    fn section(payload: &[u8]) -> Option<&[u8]> {
        let pointer = *payload.first()? as usize;
        payload.get(1 + pointer..)
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(section) = Self::section(payload) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
        let programs_end = (3 + section_length).saturating_sub(4).min(section.len());
        let mut offset = 8;
        while offset + 4 <= programs_end {
            let program_number = u16::from_be_bytes([section[offset], section[offset + 1]]);
            let pid = ((section[offset + 2] as u16 & 0x1F) << 8) | section[offset + 3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    trace!(pmt_pid = pid, "PAT parsed");
                }
                self.pmt_pid = Some(pid);
                return;
            }
            offset += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some(section) = Self::section(payload) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
        let program_info_length = ((section[10] as usize & 0x0F) << 8) | section[11] as usize;
        let streams_end = (3 + section_length).saturating_sub(4).min(section.len());
        let mut offset = 12 + program_info_length;

        while offset + 5 <= streams_end {
            let stream_type = section[offset];
            let pid = ((section[offset + 1] as u16 & 0x1F) << 8) | section[offset + 2] as u16;
            let es_info_length =
                ((section[offset + 3] as usize & 0x0F) << 8) | section[offset + 4] as usize;

            match stream_type {
                STREAM_TYPE_ADTS if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_kind = AudioCodecKind::Aac;
                }
                STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_kind = AudioCodecKind::Mpeg;
                }
                STREAM_TYPE_H264 if self.video_pid.is_none() => {
                    self.video_pid = Some(pid);
                }
                STREAM_TYPE_METADATA if self.id3_pid.is_none() => {
                    self.id3_pid = Some(pid);
                }
                STREAM_TYPE_SAMPLE_AES_ADTS | STREAM_TYPE_SAMPLE_AES_H264 => {
                    warn!(stream_type, pid, "SAMPLE-AES elementary stream is not supported");
                }
                _ => {
                    trace!(stream_type, pid, "Ignoring elementary stream");
                }
            }
            offset += 5 + es_info_length;
        }
        debug!(
            audio_pid = ?self.audio_pid,
            video_pid = ?self.video_pid,
            id3_pid = ?self.id3_pid,
            "PMT parsed"
        );
    }

    fn parse_audio_pes(&mut self, data: Bytes) {
        let Some(pes) = parse_pes(data) else {
            warn!("Dropping malformed audio PES");
            return;
        };
        let Some(pts) = pes.pts.or(self.last_audio_pts) else {
            warn!("Dropping audio PES without timestamp");
            return;
        };

        let (buf, had_overflow) = match self.audio_overflow.take() {
            Some(overflow) => {
                let mut joined = BytesMut::with_capacity(overflow.len() + pes.payload.len());
                joined.extend_from_slice(&overflow);
                joined.extend_from_slice(&pes.payload);
                (joined.freeze(), true)
            }
            None => (pes.payload, false),
        };

        let FrameScan {
            samples,
            config,
            leftover,
            frame_duration,
        } = scan_frames(self.audio_kind, &buf, pts, had_overflow);

        if let Some(mut config) = config {
            if let Some(hint) = &self.audio_codec_hint
                && self.audio_kind == AudioCodecKind::Aac
                && hint.starts_with("mp4a.")
            {
                config.codec.clone_from(hint);
            }
            if self.audio_config.as_ref() != Some(&config) {
                debug!(codec = %config.codec, rate = config.sample_rate, channels = config.channels, "Audio track configured");
                self.audio_config = Some(config);
            }
        }
        if let Some(last) = samples.last() {
            self.last_audio_pts = Some(last.pts + frame_duration.round() as i64);
        }
        self.out.audio.samples.extend(samples);
        self.audio_overflow = leftover;
    }

    fn parse_video_pes(&mut self, data: Bytes) {
        let Some(pes) = parse_pes(data) else {
            warn!("Dropping malformed video PES");
            return;
        };
        let Some(pts) = pes.pts else {
            warn!("Dropping video PES without timestamp");
            return;
        };
        let dts = pes.dts.unwrap_or(pts);

        let mut sample = VideoSample {
            pts,
            dts,
            key: false,
            units: Vec::new(),
        };
        let mut has_slice = false;

        for unit in avc::split_nal_units(&pes.payload) {
            match avc::nal_type(&unit) {
                NAL_IDR => {
                    sample.key = true;
                    has_slice = true;
                    sample.units.push(unit);
                }
                NAL_SLICE => {
                    has_slice = true;
                    sample.units.push(unit);
                }
                NAL_SEI => {
                    for data in avc::sei_user_data(&unit) {
                        self.out.text.push(TimedSample { pts, dts, data });
                    }
                    sample.units.push(unit);
                }
                NAL_SPS => {
                    if self.sps.as_ref() != Some(&unit) {
                        self.sps = Some(unit.clone());
                        self.update_video_config();
                    }
                    sample.units.push(unit);
                }
                NAL_PPS => {
                    if self.pps.as_ref() != Some(&unit) {
                        self.pps = Some(unit.clone());
                        self.update_video_config();
                    }
                    sample.units.push(unit);
                }
                NAL_AUD => {}
                _ => sample.units.push(unit),
            }
        }

        if has_slice {
            self.out.video.samples.push(sample);
        } else {
            trace!(pts, "Video PES without slice data");
        }
    }

    fn update_video_config(&mut self) {
        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            return;
        };
        let Some(info) = avc::parse_sps(sps) else {
            warn!("Unable to parse SPS");
            return;
        };
        debug!(codec = %info.codec, width = info.width, height = info.height, "Video track configured");
        self.video_config = Some(VideoConfig {
            codec: info.codec,
            width: info.width,
            height: info.height,
            sps: sps.clone(),
            pps: pps.clone(),
        });
    }

    fn parse_id3_pes(&mut self, data: Bytes) {
        let Some(pes) = parse_pes(data) else {
            return;
        };
        let Some(pts) = pes.pts else {
            return;
        };
        self.out.id3.push(TimedSample {
            pts,
            dts: pes.dts.unwrap_or(pts),
            data: pes.payload,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::demux::adts;
    use crate::demux::avc::tests::{PPS, SPS_64X64};
    use proptest::prelude::*;

    pub(crate) const PMT_PID: u16 = 0x1000;
    pub(crate) const VIDEO_PID: u16 = 0x100;
    pub(crate) const AUDIO_PID: u16 = 0x101;

    fn encode_timestamp(marker: u8, ts: i64) -> [u8; 5] {
        [
            (marker << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
            ((ts >> 22) & 0xFF) as u8,
            ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
            ((ts >> 7) & 0xFF) as u8,
            (((ts & 0x7F) as u8) << 1) | 1,
        ]
    }

    fn pes(stream_id: u8, pts: i64, dts: Option<i64>, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80];
        match dts {
            Some(dts) => {
                out.extend_from_slice(&[0xC0, 10]);
                out.extend_from_slice(&encode_timestamp(0x3, pts));
                out.extend_from_slice(&encode_timestamp(0x1, dts));
            }
            None => {
                out.extend_from_slice(&[0x80, 5]);
                out.extend_from_slice(&encode_timestamp(0x2, pts));
            }
        }
        out.extend_from_slice(payload);
        out
    }

    /// Split a PES into packets, padding the last one with an adaptation field.
    fn packetize(pid: u16, data: &[u8], cc: &mut u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first = true;
        let mut offset = 0;
        while offset < data.len() {
            let remaining = data.len() - offset;
            let mut packet = vec![
                SYNC_BYTE,
                ((pid >> 8) as u8 & 0x1F) | if first { 0x40 } else { 0 },
                pid as u8,
                0,
            ];
            let take = remaining.min(184);
            if take < 184 {
                let af_len = 184 - take - 1;
                packet[3] = 0x30 | (*cc & 0x0F);
                packet.push(af_len as u8);
                if af_len > 0 {
                    packet.push(0x00);
                    packet.extend(std::iter::repeat_n(0xFF, af_len - 1));
                }
            } else {
                packet[3] = 0x10 | (*cc & 0x0F);
            }
            packet.extend_from_slice(&data[offset..offset + take]);
            assert_eq!(packet.len(), PACKET_LEN);
            out.extend(packet);
            offset += take;
            *cc = cc.wrapping_add(1);
            first = false;
        }
        out
    }

    fn psi_packet(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packet = vec![SYNC_BYTE, 0x40 | ((pid >> 8) as u8 & 0x1F), pid as u8, 0x10, 0x00];
        packet.extend_from_slice(section);
        packet.resize(PACKET_LEN, 0xFF);
        packet
    }

    fn pat() -> Vec<u8> {
        let section = [
            0x00,
            0xB0,
            13,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0x00,
            0x01,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
            0,
            0,
            0,
            0,
        ];
        psi_packet(PID_PAT, &section)
    }

    fn pmt() -> Vec<u8> {
        let section = [
            0x02,
            0xB0,
            23,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
            STREAM_TYPE_H264,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
            STREAM_TYPE_ADTS,
            0xE0 | (AUDIO_PID >> 8) as u8,
            AUDIO_PID as u8,
            0xF0,
            0x00,
            0,
            0,
            0,
            0,
        ];
        psi_packet(PMT_PID, &section)
    }

    fn access_unit(key: bool, fill: u8) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, NAL_AUD, 0xF0];
        if key {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&SPS_64X64);
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&PPS);
            out.extend_from_slice(&[0, 0, 1, 0x65]);
        } else {
            out.extend_from_slice(&[0, 0, 1, 0x41]);
        }
        out.extend(std::iter::repeat_n(fill, 300));
        out
    }

    /// A segment with `frames` video access units (every 3000 ticks, the first a
    /// keyframe) and two ADTS frames per video frame.
    pub(crate) fn segment(frames: usize, base_pts: i64) -> Vec<u8> {
        let mut out = pat();
        out.extend(pmt());
        let mut video_cc = 0;
        let mut audio_cc = 0;
        for i in 0..frames {
            let pts = base_pts + i as i64 * 3000;
            let video = pes(0xE0, pts + 3000, Some(pts), &access_unit(i == 0, i as u8 + 1));
            out.extend(packetize(VIDEO_PID, &video, &mut video_cc));

            let mut adts_payload = adts::tests::frame(40, 0x11);
            adts_payload.extend(adts::tests::frame(40, 0x22));
            let audio = pes(0xC0, pts, None, &adts_payload);
            out.extend(packetize(AUDIO_PID, &audio, &mut audio_cc));
        }
        out
    }

    #[test]
    fn test_sync_offset_with_leading_garbage() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(segment(2, 0));
        assert_eq!(sync_offset(&data), Some(3));
        assert!(probe(&data));
        assert!(!probe(&data[..100]));
    }

    #[test]
    fn test_demux_segment() {
        let data = Bytes::from(segment(3, 900_000));
        let mut demuxer = TsDemuxer::new();
        let mut tracks = demuxer.demux(data);
        let flushed = demuxer.flush();
        tracks.video.samples.extend(flushed.video.samples);
        tracks.audio.samples.extend(flushed.audio.samples);

        assert_eq!(tracks.video.samples.len(), 3);
        assert!(tracks.video.samples[0].key);
        assert!(!tracks.video.samples[1].key);
        assert_eq!(tracks.video.samples[0].dts, 900_000);
        assert_eq!(tracks.video.samples[0].pts, 903_000);

        assert_eq!(tracks.audio.samples.len(), 6);
        assert_eq!(tracks.audio.samples[0].pts, 900_000);
        assert_eq!(tracks.audio.samples[0].data.len(), 40);
        let frame_90k = adts::frame_duration_90k(44100).round() as i64;
        assert_eq!(tracks.audio.samples[1].pts, 900_000 + frame_90k);

        let video = tracks.video.config.clone().unwrap();
        assert_eq!(video.codec, "avc1.42c01e");
        assert_eq!((video.width, video.height), (64, 64));
        let audio = tracks.audio.config.clone().unwrap();
        assert_eq!(audio.codec, "mp4a.40.2");
        assert_eq!(audio.sample_rate, 44100);
    }

    fn demux_chunked(data: &[u8], sizes: &[usize]) -> (Vec<VideoSample>, Vec<crate::demux::AudioSample>) {
        let mut demuxer = TsDemuxer::new();
        let mut video = Vec::new();
        let mut audio = Vec::new();
        let mut offset = 0;
        let mut sizes = sizes.iter().cycle();
        while offset < data.len() {
            let size = *sizes.next().unwrap_or(&data.len());
            let end = (offset + size).min(data.len());
            let tracks = demuxer.demux(Bytes::copy_from_slice(&data[offset..end]));
            video.extend(tracks.video.samples);
            audio.extend(tracks.audio.samples);
            offset = end;
        }
        let tracks = demuxer.flush();
        video.extend(tracks.video.samples);
        audio.extend(tracks.audio.samples);
        (video, audio)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunked_demux_matches_single_push(
            sizes in proptest::collection::vec(1usize..2000, 1..8),
        ) {
            let data = segment(4, 0);
            let whole = demux_chunked(&data, &[data.len()]);
            let chunked = demux_chunked(&data, &sizes);
            prop_assert_eq!(whole, chunked);
        }
    }
}
