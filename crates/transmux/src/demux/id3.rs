//! ID3v2 tag detection and the Apple transport-stream timestamp frame.

const HEADER_LEN: usize = 10;
const TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp";

/// Whether an ID3v2 header starts at `offset`.
pub fn is_header(data: &[u8], offset: usize) -> bool {
    if offset + HEADER_LEN > data.len() {
        return false;
    }
    let d = &data[offset..];
    d[0] == b'I'
        && d[1] == b'D'
        && d[2] == b'3'
        && d[3] < 0xFF
        && d[4] < 0xFF
        && d[6] < 0x80
        && d[7] < 0x80
        && d[8] < 0x80
        && d[9] < 0x80
}

fn read_syncsafe(d: &[u8]) -> usize {
    ((d[0] as usize & 0x7F) << 21)
        | ((d[1] as usize & 0x7F) << 14)
        | ((d[2] as usize & 0x7F) << 7)
        | (d[3] as usize & 0x7F)
}

/// Total length of the ID3 tag(s) starting at `offset`, footer included.
///
/// Consecutive tags are treated as one block. Returns `None` when no tag starts
/// at `offset`.
pub fn tag_len(data: &[u8], offset: usize) -> Option<usize> {
    let mut cursor = offset;
    while is_header(data, cursor) {
        let flags = data[cursor + 5];
        let size = read_syncsafe(&data[cursor + 6..cursor + 10]);
        cursor += HEADER_LEN + size;
        if flags & 0x10 != 0 {
            cursor += HEADER_LEN;
        }
    }
    (cursor > offset).then_some(cursor - offset)
}

/// Extract the 33-bit MPEG-2 timestamp carried in the Apple PRIV frame.
///
/// `tag` must start with an ID3 header. The value is in 90 kHz units.
pub fn transport_stream_timestamp(tag: &[u8]) -> Option<i64> {
    if !is_header(tag, 0) {
        return None;
    }
    let version = tag[3];
    let size = read_syncsafe(&tag[6..10]);
    let end = (HEADER_LEN + size).min(tag.len());
    let mut offset = HEADER_LEN;

    while offset + HEADER_LEN <= end {
        let id = &tag[offset..offset + 4];
        let raw_size = &tag[offset + 4..offset + 8];
        let frame_size = if version >= 4 {
            read_syncsafe(raw_size)
        } else {
            u32::from_be_bytes([raw_size[0], raw_size[1], raw_size[2], raw_size[3]]) as usize
        };
        if frame_size == 0 {
            break;
        }
        let body_start = offset + HEADER_LEN;
        let body_end = body_start + frame_size;
        if body_end > end {
            break;
        }
        if id == b"PRIV" {
            let body = &tag[body_start..body_end];
            if let Some(ts) = parse_priv_timestamp(body) {
                return Some(ts);
            }
        }
        offset = body_end;
    }
    None
}

fn parse_priv_timestamp(body: &[u8]) -> Option<i64> {
    let nul = memchr::memchr(0, body)?;
    if &body[..nul] != TIMESTAMP_OWNER {
        return None;
    }
    let data = &body[nul + 1..];
    if data.len() != 8 {
        return None;
    }
    let high = (data[3] & 0x01) as i64;
    let low = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as i64;
    Some((high << 32) | low)
}
