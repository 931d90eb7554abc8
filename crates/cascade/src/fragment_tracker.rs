//! Buffering state of loaded fragments.

use std::collections::HashMap;

use tracing::trace;

use crate::buffer_helper::TimeRanges;
use crate::fragment::{ElementaryStream, Fragment, PlaylistType};

/// Slack in seconds when checking whether a fragment's span is buffered.
const BUFFER_TOLERANCE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    NotLoaded,
    /// Loaded and being appended.
    Appending,
    /// Buffered, but the sink holds only part of its span.
    Partial,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    kind: PlaylistType,
    level: usize,
    sn: u64,
}

impl From<&Fragment> for FragmentKey {
    fn from(frag: &Fragment) -> Self {
        Self {
            kind: frag.kind,
            level: frag.level,
            sn: frag.sn,
        }
    }
}

#[derive(Debug)]
struct Entry {
    start: f64,
    end: f64,
    streams: Vec<ElementaryStream>,
    buffered: bool,
    partial: bool,
}

#[derive(Debug, Default)]
pub struct FragmentTracker {
    entries: HashMap<FragmentKey, Entry>,
}

impl FragmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, frag: &Fragment) -> FragmentState {
        match self.entries.get(&FragmentKey::from(frag)) {
            None => FragmentState::NotLoaded,
            Some(entry) if !entry.buffered => FragmentState::Appending,
            Some(entry) if entry.partial => FragmentState::Partial,
            Some(_) => FragmentState::Ok,
        }
    }

    /// Register a fragment whose payload has arrived.
    pub fn fragment_loaded(&mut self, frag: &Fragment) {
        if frag.is_init_segment {
            return;
        }
        self.entries.insert(
            FragmentKey::from(frag),
            Entry {
                start: frag.start,
                end: frag.end(),
                streams: Vec::new(),
                buffered: false,
                partial: false,
            },
        );
    }

    /// Mark a fragment buffered and classify how much of it the sink holds.
    pub fn fragment_buffered(
        &mut self,
        frag: &Fragment,
        buffered: &[(ElementaryStream, TimeRanges)],
    ) {
        let key = FragmentKey::from(frag);
        let start = frag.start_pts.unwrap_or(frag.start);
        let end = frag.end_pts.unwrap_or_else(|| frag.end());
        let streams = frag.elementary_streams();
        let partial = streams.iter().any(|stream| {
            buffered
                .iter()
                .find(|(s, _)| s == stream)
                .is_some_and(|(_, ranges)| !covers(ranges, start, end))
        });
        trace!(sn = frag.sn, level = frag.level, partial, "Fragment buffered");
        let entry = self.entries.entry(key).or_insert(Entry {
            start,
            end,
            streams: Vec::new(),
            buffered: false,
            partial: false,
        });
        entry.start = start;
        entry.end = end;
        entry.streams = streams;
        entry.buffered = true;
        entry.partial = partial;
    }

    /// Forget buffered fragments carrying `stream` that no longer overlap `ranges`.
    pub fn detect_evicted(&mut self, stream: ElementaryStream, ranges: &[(f64, f64)]) {
        self.entries.retain(|key, entry| {
            if !entry.buffered || !entry.streams.contains(&stream) {
                return true;
            }
            let kept = ranges
                .iter()
                .any(|&(s, e)| s < entry.end - BUFFER_TOLERANCE && e > entry.start + BUFFER_TOLERANCE);
            if !kept {
                trace!(sn = key.sn, level = key.level, "Fragment evicted from buffer");
            }
            kept
        });
    }

    pub fn remove(&mut self, frag: &Fragment) {
        self.entries.remove(&FragmentKey::from(frag));
    }

    /// Forget fragments that never finished buffering, e.g. after an abort.
    pub fn remove_appending(&mut self) {
        self.entries.retain(|_, entry| entry.buffered);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn covers(ranges: &[(f64, f64)], start: f64, end: f64) -> bool {
    ranges
        .iter()
        .any(|&(s, e)| s <= start + BUFFER_TOLERANCE && e >= end - BUFFER_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::ElementaryStreamInfo;

    fn buffered_frag(sn: u64, start: f64) -> Fragment {
        let mut frag = Fragment::new(PlaylistType::Main, 0, sn, start, 4.0);
        frag.set_elementary_stream_info(
            ElementaryStream::Video,
            ElementaryStreamInfo {
                start_pts: start,
                end_pts: start + 4.0,
                start_dts: start,
                end_dts: start + 4.0,
            },
        );
        frag
    }

    #[test]
    fn test_lifecycle() {
        let mut tracker = FragmentTracker::new();
        let frag = buffered_frag(1, 4.0);
        assert_eq!(tracker.state(&frag), FragmentState::NotLoaded);

        tracker.fragment_loaded(&frag);
        assert_eq!(tracker.state(&frag), FragmentState::Appending);

        tracker.fragment_buffered(&frag, &[(ElementaryStream::Video, vec![(0.0, 8.0)])]);
        assert_eq!(tracker.state(&frag), FragmentState::Ok);
    }

    #[test]
    fn test_partial() {
        let mut tracker = FragmentTracker::new();
        let frag = buffered_frag(1, 4.0);
        tracker.fragment_loaded(&frag);
        tracker.fragment_buffered(&frag, &[(ElementaryStream::Video, vec![(0.0, 6.0)])]);
        assert_eq!(tracker.state(&frag), FragmentState::Partial);
    }

    #[test]
    fn test_eviction_resets_to_not_loaded() {
        let mut tracker = FragmentTracker::new();
        let first = buffered_frag(0, 0.0);
        let second = buffered_frag(1, 4.0);
        for frag in [&first, &second] {
            tracker.fragment_loaded(frag);
            tracker.fragment_buffered(frag, &[(ElementaryStream::Video, vec![(0.0, 8.0)])]);
        }

        tracker.detect_evicted(ElementaryStream::Video, &[(4.0, 8.0)]);
        assert_eq!(tracker.state(&first), FragmentState::NotLoaded);
        assert_eq!(tracker.state(&second), FragmentState::Ok);

        // Other elementary streams leave the entry alone.
        tracker.detect_evicted(ElementaryStream::Audio, &[]);
        assert_eq!(tracker.state(&second), FragmentState::Ok);
    }

    #[test]
    fn test_remove_appending() {
        let mut tracker = FragmentTracker::new();
        let frag = buffered_frag(3, 12.0);
        tracker.fragment_loaded(&frag);
        tracker.remove_appending();
        assert_eq!(tracker.state(&frag), FragmentState::NotLoaded);
    }
}
