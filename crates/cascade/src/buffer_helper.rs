//! Queries over buffered time ranges.

/// Buffered `[start, end)` intervals in seconds, as reported by a sink.
pub type TimeRanges = Vec<(f64, f64)>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    /// Seconds buffered ahead of the position.
    pub len: f64,
    pub start: f64,
    pub end: f64,
    /// Start of the next range after a hole, if any.
    pub next_start: Option<f64>,
}

/// Contiguous buffer around `pos`, treating holes shorter than `max_hole` as filled.
pub fn buffer_info(ranges: &[(f64, f64)], pos: f64, max_hole: f64) -> BufferInfo {
    let mut sorted: Vec<(f64, f64)> = ranges.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.total_cmp(&a.1)));

    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
    for (start, end) in sorted {
        match merged.last_mut() {
            Some(last) if max_hole > 0.0 && start - last.1 < max_hole => {
                if end > last.1 {
                    last.1 = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }

    let mut info = BufferInfo {
        len: 0.0,
        start: pos,
        end: pos,
        next_start: None,
    };
    for &(start, end) in &merged {
        if pos + max_hole >= start && pos < end {
            info.start = start;
            info.end = end;
            info.len = end - pos;
        } else if pos + max_hole < start {
            info.next_start = Some(start);
            break;
        }
    }
    info
}

pub fn is_buffered(ranges: &[(f64, f64)], pos: f64) -> bool {
    ranges.iter().any(|&(start, end)| pos >= start && pos <= end)
}

/// Time covered by every one of `sets`, like a media element over its buffers.
pub fn intersect(sets: &[&[(f64, f64)]]) -> TimeRanges {
    let Some((first, rest)) = sets.split_first() else {
        return Vec::new();
    };
    let mut acc: TimeRanges = first.to_vec();
    for set in rest {
        let mut out = Vec::new();
        for &(a0, a1) in &acc {
            for &(b0, b1) in set.iter() {
                let start = a0.max(b0);
                let end = a1.min(b1);
                if end > start {
                    out.push((start, end));
                }
            }
        }
        acc = out;
    }
    acc.sort_by(|a, b| a.0.total_cmp(&b.0));
    acc
}

/// Add `[start, end)` to `ranges`, merging overlapping or touching intervals.
pub fn insert_range(ranges: &mut TimeRanges, start: f64, end: f64) {
    if end <= start {
        return;
    }
    ranges.push((start, end));
    ranges.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut merged: TimeRanges = Vec::with_capacity(ranges.len());
    for &(s, e) in ranges.iter() {
        match merged.last_mut() {
            Some(last) if s <= last.1 + 1e-6 => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    *ranges = merged;
}

/// Remove `[start, end)` from `ranges`.
pub fn remove_range(ranges: &mut TimeRanges, start: f64, end: f64) {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, e) in ranges.iter() {
        if e <= start || s >= end {
            out.push((s, e));
            continue;
        }
        if s < start {
            out.push((s, start));
        }
        if e > end {
            out.push((end, e));
        }
    }
    *ranges = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_buffer_info_inside_range() {
        let info = buffer_info(&[(0.0, 10.0), (20.0, 30.0)], 4.0, 0.5);
        assert_eq!(info.len, 6.0);
        assert_eq!(info.end, 10.0);
        assert_eq!(info.next_start, Some(20.0));
    }

    #[test]
    fn test_buffer_info_bridges_small_hole() {
        let info = buffer_info(&[(0.0, 10.0), (10.3, 18.0)], 2.0, 0.5);
        assert_eq!(info.end, 18.0);
        assert_eq!(info.len, 16.0);

        let strict = buffer_info(&[(0.0, 10.0), (10.3, 18.0)], 2.0, 0.0);
        assert_eq!(strict.end, 10.0);
    }

    #[test]
    fn test_buffer_info_just_before_range() {
        // Playhead slightly ahead of a range start counts as inside it.
        let info = buffer_info(&[(5.2, 9.0)], 5.0, 0.5);
        assert_eq!(info.start, 5.2);
        assert_eq!(info.len, 4.0);

        let empty = buffer_info(&[], 3.0, 0.5);
        assert_eq!(empty.len, 0.0);
        assert_eq!(empty.end, 3.0);
        assert_eq!(empty.next_start, None);
    }

    #[test]
    fn test_intersect() {
        let audio: &[(f64, f64)] = &[(0.0, 10.0), (12.0, 20.0)];
        let video: &[(f64, f64)] = &[(1.0, 15.0)];
        assert_eq!(intersect(&[audio, video]), vec![(1.0, 10.0), (12.0, 15.0)]);
        assert_eq!(intersect(&[audio]), audio.to_vec());
        assert!(intersect(&[]).is_empty());
    }

    #[test]
    fn test_insert_and_remove() {
        let mut ranges = Vec::new();
        insert_range(&mut ranges, 0.0, 4.0);
        insert_range(&mut ranges, 4.0, 8.0);
        insert_range(&mut ranges, 10.0, 12.0);
        assert_eq!(ranges, vec![(0.0, 8.0), (10.0, 12.0)]);

        remove_range(&mut ranges, 2.0, 11.0);
        assert_eq!(ranges, vec![(0.0, 2.0), (11.0, 12.0)]);
        remove_range(&mut ranges, 0.0, f64::INFINITY);
        assert!(ranges.is_empty());
    }

    proptest! {
        #[test]
        fn prop_buffer_len_bounded_by_coverage(
            spans in prop::collection::vec((0.0f64..100.0, 0.1f64..10.0), 0..8),
            pos in 0.0f64..110.0,
        ) {
            let ranges: TimeRanges = spans.iter().map(|&(s, d)| (s, s + d)).collect();
            let info = buffer_info(&ranges, pos, 0.0);
            prop_assert!(info.len >= 0.0);
            if info.len > 0.0 {
                prop_assert!(is_buffered(&ranges, pos));
                prop_assert!(info.end > pos);
            }
        }
    }
}
