//! ISO BMFF box writers for fMP4 init and media segments.
//!
//! Boxes are written in place into a `BytesMut`; the size field is patched once
//! the body closure returns.

use bytes::{BufMut, Bytes, BytesMut};

use crate::demux::{AudioCodecKind, AudioConfig, VideoConfig};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// Write a box whose body is produced by `body`.
pub(crate) fn write_box(out: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = out.len();
    out.put_u32(0);
    out.put_slice(fourcc);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box: version and flags precede the body.
pub(crate) fn write_full_box(
    out: &mut BytesMut,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(out, fourcc, |out| {
        out.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        body(out);
    });
}

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn put_matrix(out: &mut BytesMut) {
    for v in UNITY_MATRIX {
        out.put_u32(v);
    }
}

/// One track of an init segment.
#[derive(Debug, Clone, Copy)]
pub enum TrackSpec<'a> {
    Video {
        timescale: u32,
        config: &'a VideoConfig,
    },
    Audio {
        timescale: u32,
        config: &'a AudioConfig,
    },
}

impl TrackSpec<'_> {
    fn id(&self) -> u32 {
        match self {
            TrackSpec::Video { .. } => VIDEO_TRACK_ID,
            TrackSpec::Audio { .. } => AUDIO_TRACK_ID,
        }
    }

    fn timescale(&self) -> u32 {
        match self {
            TrackSpec::Video { timescale, .. } | TrackSpec::Audio { timescale, .. } => *timescale,
        }
    }
}

/// `ftyp` + `moov` for the given tracks.
pub fn init_segment(tracks: &[TrackSpec<'_>]) -> Bytes {
    let mut out = BytesMut::with_capacity(1024);
    write_box(&mut out, b"ftyp", |out| {
        out.put_slice(b"isom");
        out.put_u32(1);
        for brand in [b"isom", b"avc1", b"iso6", b"mp41"] {
            out.put_slice(brand);
        }
    });
    write_box(&mut out, b"moov", |out| {
        write_full_box(out, b"mvhd", 0, 0, |out| {
            out.put_u32(0); // creation_time
            out.put_u32(0); // modification_time
            out.put_u32(tracks.first().map_or(1000, TrackSpec::timescale));
            out.put_u32(0); // duration
            out.put_u32(0x0001_0000); // rate 1.0
            out.put_u16(0x0100); // volume 1.0
            out.put_bytes(0, 10);
            put_matrix(out);
            out.put_bytes(0, 24);
            out.put_u32(0xFFFF_FFFF); // next_track_ID
        });
        for track in tracks {
            write_trak(out, track);
        }
        write_box(out, b"mvex", |out| {
            for track in tracks {
                write_full_box(out, b"trex", 0, 0, |out| {
                    out.put_u32(track.id());
                    out.put_u32(1); // default_sample_description_index
                    out.put_u32(0); // default_sample_duration
                    out.put_u32(0); // default_sample_size
                    out.put_u32(0x0001_0001); // default_sample_flags
                });
            }
        });
    });
    out.freeze()
}

fn write_trak(out: &mut BytesMut, track: &TrackSpec<'_>) {
    let (width, height, is_video) = match track {
        TrackSpec::Video { config, .. } => (config.width, config.height, true),
        TrackSpec::Audio { .. } => (0, 0, false),
    };
    write_box(out, b"trak", |out| {
        // enabled | in_movie | in_preview
        write_full_box(out, b"tkhd", 0, 0x07, |out| {
            out.put_u32(0);
            out.put_u32(0);
            out.put_u32(track.id());
            out.put_u32(0); // reserved
            out.put_u32(0); // duration
            out.put_bytes(0, 8);
            out.put_u16(0); // layer
            out.put_u16(0); // alternate_group
            out.put_u16(if is_video { 0 } else { 0x0100 });
            out.put_u16(0);
            put_matrix(out);
            out.put_u32(width << 16);
            out.put_u32(height << 16);
        });
        write_box(out, b"mdia", |out| {
            write_full_box(out, b"mdhd", 0, 0, |out| {
                out.put_u32(0);
                out.put_u32(0);
                out.put_u32(track.timescale());
                out.put_u32(0);
                out.put_u16(0x55C4); // 'und'
                out.put_u16(0);
            });
            write_full_box(out, b"hdlr", 0, 0, |out| {
                out.put_u32(0);
                out.put_slice(if is_video { b"vide" } else { b"soun" });
                out.put_bytes(0, 12);
                out.put_slice(if is_video {
                    b"VideoHandler\0".as_slice()
                } else {
                    b"SoundHandler\0".as_slice()
                });
            });
            write_box(out, b"minf", |out| {
                if is_video {
                    write_full_box(out, b"vmhd", 0, 1, |out| out.put_bytes(0, 8));
                } else {
                    write_full_box(out, b"smhd", 0, 0, |out| out.put_u32(0));
                }
                write_box(out, b"dinf", |out| {
                    write_full_box(out, b"dref", 0, 0, |out| {
                        out.put_u32(1);
                        write_full_box(out, b"url ", 0, 1, |_| {});
                    });
                });
                write_box(out, b"stbl", |out| {
                    write_full_box(out, b"stsd", 0, 0, |out| {
                        out.put_u32(1);
                        match track {
                            TrackSpec::Video { config, .. } => write_avc1(out, config),
                            TrackSpec::Audio { config, .. } => write_audio_entry(out, config),
                        }
                    });
                    for empty in [b"stts", b"stsc", b"stco"] {
                        write_full_box(out, empty, 0, 0, |out| out.put_u32(0));
                    }
                    write_full_box(out, b"stsz", 0, 0, |out| {
                        out.put_u32(0);
                        out.put_u32(0);
                    });
                });
            });
        });
    });
}

fn write_avc1(out: &mut BytesMut, config: &VideoConfig) {
    write_box(out, b"avc1", |out| {
        out.put_bytes(0, 6);
        out.put_u16(1); // data_reference_index
        out.put_bytes(0, 16);
        out.put_u16(config.width as u16);
        out.put_u16(config.height as u16);
        out.put_u32(0x0048_0000); // 72 dpi
        out.put_u32(0x0048_0000);
        out.put_u32(0);
        out.put_u16(1); // frame_count
        out.put_bytes(0, 32); // compressorname
        out.put_u16(0x0018);
        out.put_i16(-1);
        write_box(out, b"avcC", |out| {
            let sps = &config.sps;
            out.put_u8(1);
            out.put_u8(sps.get(1).copied().unwrap_or(0x42));
            out.put_u8(sps.get(2).copied().unwrap_or(0));
            out.put_u8(sps.get(3).copied().unwrap_or(0x1E));
            out.put_u8(0xFF); // 4-byte NAL lengths
            out.put_u8(0xE1); // one SPS
            out.put_u16(sps.len() as u16);
            out.put_slice(sps);
            out.put_u8(1);
            out.put_u16(config.pps.len() as u16);
            out.put_slice(&config.pps);
        });
    });
}

fn write_audio_entry(out: &mut BytesMut, config: &AudioConfig) {
    let fourcc = match config.kind {
        AudioCodecKind::Aac => b"mp4a",
        AudioCodecKind::Mpeg => b".mp3",
    };
    write_box(out, fourcc, |out| {
        out.put_bytes(0, 6);
        out.put_u16(1);
        out.put_bytes(0, 8);
        out.put_u16(config.channels as u16);
        out.put_u16(16);
        out.put_u32(0);
        out.put_u32(config.sample_rate << 16);
        if config.kind == AudioCodecKind::Aac {
            write_esds(out, config);
        }
    });
}

fn write_esds(out: &mut BytesMut, config: &AudioConfig) {
    let asc = &config.specific_config;
    write_full_box(out, b"esds", 0, 0, |out| {
        // ES_Descriptor
        out.put_u8(0x03);
        out.put_u8((23 + asc.len()) as u8);
        out.put_u16(1); // ES_ID
        out.put_u8(0);
        // DecoderConfigDescriptor
        out.put_u8(0x04);
        out.put_u8((15 + asc.len()) as u8);
        out.put_u8(0x40); // MPEG-4 audio
        out.put_u8(0x15); // audio stream
        out.put_bytes(0, 3); // buffer size
        out.put_u32(0); // max bitrate
        out.put_u32(0); // avg bitrate
        // DecoderSpecificInfo
        out.put_u8(0x05);
        out.put_u8(asc.len() as u8);
        out.put_slice(asc);
        // SLConfigDescriptor
        out.put_u8(0x06);
        out.put_u8(1);
        out.put_u8(0x02);
    });
}

/// Per-sample `trun` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_offset: i32,
}

pub const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
pub const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// `moof` + `mdat` for one track.
///
/// `payload` must hold the sample data in `samples` order.
pub fn media_segment(
    sequence: u32,
    track_id: u32,
    base_decode_time: u64,
    samples: &[FragmentSample],
    payload: &[u8],
) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 128 + samples.len() * 16);
    let mut data_offset_pos = 0;
    write_box(&mut out, b"moof", |out| {
        write_full_box(out, b"mfhd", 0, 0, |out| out.put_u32(sequence));
        write_box(out, b"traf", |out| {
            // default-base-is-moof
            write_full_box(out, b"tfhd", 0, 0x02_0000, |out| out.put_u32(track_id));
            write_full_box(out, b"tfdt", 1, 0, |out| out.put_u64(base_decode_time));
            // data-offset, duration, size, flags, composition offset
            write_full_box(out, b"trun", 1, 0x0F01, |out| {
                out.put_u32(samples.len() as u32);
                data_offset_pos = out.len();
                out.put_i32(0);
                for s in samples {
                    out.put_u32(s.duration);
                    out.put_u32(s.size);
                    out.put_u32(s.flags);
                    out.put_i32(s.composition_offset);
                }
            });
        });
    });
    let data_offset = (out.len() + 8) as i32;
    out[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());
    write_box(&mut out, b"mdat", |out| out.put_slice(payload));
    out.freeze()
}
