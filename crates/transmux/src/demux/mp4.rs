//! Fragmented MP4 passthrough demuxer.
//!
//! Data is already in the target container; the demuxer only holds back a
//! trailing partial top-level box so every emitted chunk is box-aligned.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::FragmentedChunk;
use crate::isobmff;

pub const MIN_PROBE_LEN: usize = 1024;
/// How far into the data a `moof` is searched for.
const PROBE_WINDOW: usize = 16 * 1024;

/// A top-level `moof` within the first 16 KiB.
pub fn probe(data: &[u8]) -> bool {
    let window = &data[..data.len().min(PROBE_WINDOW)];
    let mut offset = 0;
    while offset + 8 <= window.len() {
        let Some((size, fourcc, _)) = isobmff::read_box_header(&data[offset..]) else {
            return false;
        };
        if fourcc == *b"moof" {
            return true;
        }
        if size < 8 {
            return false;
        }
        offset += size;
    }
    false
}

#[derive(Debug, Default)]
pub struct Mp4Demuxer {
    remainder: Option<Bytes>,
}

impl Mp4Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn demux(&mut self, data: Bytes) -> FragmentedChunk {
        let buf = match self.remainder.take() {
            Some(rem) => {
                let mut joined = BytesMut::with_capacity(rem.len() + data.len());
                joined.extend_from_slice(&rem);
                joined.extend_from_slice(&data);
                joined.freeze()
            }
            None => data,
        };
        let (complete, rest) = isobmff::split_complete_boxes(&buf);
        if !rest.is_empty() {
            self.remainder = Some(rest);
        }
        FragmentedChunk { data: complete }
    }

    pub fn flush(&mut self) -> FragmentedChunk {
        let data = self.remainder.take().unwrap_or_default();
        if !data.is_empty() {
            debug!(bytes = data.len(), "Flushing trailing MP4 bytes");
        }
        FragmentedChunk { data }
    }

    pub fn reset_init_segment(&mut self) {}

    pub fn reset_contiguity(&mut self) {
        self.remainder = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remux::boxes::{self, FragmentSample, SAMPLE_FLAGS_SYNC};

    fn fragment() -> Bytes {
        let samples = [FragmentSample {
            duration: 3000,
            size: 4,
            flags: SAMPLE_FLAGS_SYNC,
            composition_offset: 0,
        }];
        boxes::media_segment(1, boxes::VIDEO_TRACK_ID, 0, &samples, &[1, 2, 3, 4])
    }

    #[test]
    fn test_probe_finds_moof_after_init() {
        let mut data = boxes::tests::sample_init(90_000, 44_100);
        data.extend_from_slice(&fragment());
        assert!(probe(&data));
        assert!(!probe(&boxes::tests::sample_init(90_000, 44_100)));
    }

    #[test]
    fn test_holds_back_partial_box() {
        let frag = fragment();
        let mut demuxer = Mp4Demuxer::new();
        let first = demuxer.demux(frag.slice(..frag.len() - 3));
        assert_eq!(&first.data[4..8], b"moof");
        assert!(first.data.len() < frag.len() - 3);
        let second = demuxer.demux(frag.slice(frag.len() - 3..));
        assert_eq!(&second.data[4..8], b"mdat");
        let mut joined = first.data.to_vec();
        joined.extend_from_slice(&second.data);
        assert_eq!(joined, frag.to_vec());
        assert!(demuxer.flush().data.is_empty());
    }
}
