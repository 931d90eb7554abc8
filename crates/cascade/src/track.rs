//! Tracks (variants and alternate renditions) and their fragment lists.

use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::fragment::{Fragment, PlaylistType};

/// `EXT-X-MAP` init segment, loaded once before the first media fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegment {
    pub fragment: Fragment,
    pub data: Option<Bytes>,
}

/// Parsed media playlist of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDetails {
    pub url: Url,
    pub fragments: Vec<Fragment>,
    pub init_segment: Option<InitSegment>,
    pub target_duration: f64,
    pub live: bool,
    /// Fragment start times are anchored on parsed PTS values.
    pub pts_known: bool,
}

impl TrackDetails {
    pub fn start_sn(&self) -> u64 {
        self.fragments.first().map_or(0, |f| f.sn)
    }

    pub fn end_sn(&self) -> u64 {
        self.fragments.last().map_or(0, |f| f.sn)
    }

    pub fn total_duration(&self) -> f64 {
        self.fragments.iter().map(|f| f.duration).sum()
    }

    /// End time of the last fragment.
    pub fn edge(&self) -> f64 {
        self.fragments.last().map_or(0.0, Fragment::end)
    }

    pub fn has_program_date_time(&self) -> bool {
        self.fragments
            .first()
            .is_some_and(|f| f.program_date_time.is_some())
    }

    /// Index of the fragment with sequence number `sn`.
    pub fn index_of(&self, sn: u64) -> Option<usize> {
        let first = self.start_sn();
        let idx = usize::try_from(sn.checked_sub(first)?).ok()?;
        (idx < self.fragments.len()).then_some(idx)
    }

    /// Position `live_sync_duration_count` target durations behind the live edge.
    pub fn live_sync_position(&self, live_sync_duration_count: u32) -> f64 {
        let first_start = self.fragments.first().map_or(0.0, |f| f.start);
        (self.edge() - live_sync_duration_count as f64 * self.target_duration).max(first_start)
    }

    /// Duration as exposed to the sink: content end measured from zero.
    pub fn level_duration(&self) -> f64 {
        self.total_duration() + self.fragments.first().map_or(0.0, |f| f.start)
    }
}

/// A variant or an alternate rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: usize,
    pub kind: PlaylistType,
    pub url: Url,
    pub name: Option<String>,
    pub bitrate: u64,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub width: u64,
    pub height: u64,
    /// Audio group a variant renders with.
    pub audio_group: Option<String>,
    /// Rendition marked `DEFAULT=YES`.
    pub default: bool,
    pub details: Option<TrackDetails>,
}

impl Track {
    pub fn new(id: usize, kind: PlaylistType, url: Url) -> Self {
        Self {
            id,
            kind,
            url,
            name: None,
            bitrate: 0,
            audio_codec: None,
            video_codec: None,
            width: 0,
            height: 0,
            audio_group: None,
            default: false,
            details: None,
        }
    }
}

/// Split a `CODECS` attribute into an (audio, video) pair.
pub fn split_codecs(codecs: &str) -> (Option<String>, Option<String>) {
    let mut audio = None;
    let mut video = None;
    for codec in codecs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let family = codec.split('.').next().unwrap_or(codec);
        match family {
            "mp4a" | "ac-3" | "ec-3" | "mp3" | "opus" | "flac" => {
                audio.get_or_insert_with(|| codec.to_string());
            }
            _ => {
                video.get_or_insert_with(|| codec.to_string());
            }
        }
    }
    (audio, video)
}

/// Reconcile a refreshed live playlist against the previous snapshot.
///
/// Fragments present in both keep their parsed timing, and the new list is
/// shifted so overlapping fragments start where they did before. Returns the
/// applied shift in seconds.
pub fn merge_details(old: &TrackDetails, new: &mut TrackDetails) -> f64 {
    let old_start = old.start_sn();
    let new_start = new.start_sn();
    let overlap_start = old_start.max(new_start);
    let overlap_end = old.end_sn().min(new.end_sn());
    if old.fragments.is_empty() || new.fragments.is_empty() || overlap_start > overlap_end {
        // Disjoint windows: nothing to anchor on.
        new.pts_known = false;
        return 0.0;
    }

    let mut pts_anchor = None;
    for sn in overlap_start..=overlap_end {
        let (Some(oi), Some(ni)) = (old.index_of(sn), new.index_of(sn)) else {
            continue;
        };
        let old_frag = &old.fragments[oi];
        let new_frag = &mut new.fragments[ni];
        if old_frag.cc != new_frag.cc {
            continue;
        }
        if old_frag.start_pts.is_some() {
            new_frag.start_pts = old_frag.start_pts;
            new_frag.end_pts = old_frag.end_pts;
            new_frag.start_dts = old_frag.start_dts;
            new_frag.end_dts = old_frag.end_dts;
            new_frag.audio = old_frag.audio;
            new_frag.video = old_frag.video;
            new_frag.delta_pts = old_frag.delta_pts;
            if pts_anchor.is_none() {
                pts_anchor = Some((ni, old_frag.start));
            }
        }
        if let (Some(info), Some(new_info)) = (&old_frag.decrypt, new_frag.decrypt.as_mut())
            && info.uri == new_info.uri
            && new_info.key.is_none()
        {
            new_info.key = info.key;
        }
    }

    let (anchor_idx, anchor_start) = match pts_anchor {
        Some(anchor) => anchor,
        None => {
            let Some(ni) = new.index_of(overlap_start) else {
                return 0.0;
            };
            let Some(oi) = old.index_of(overlap_start) else {
                return 0.0;
            };
            (ni, old.fragments[oi].start)
        }
    };
    let sliding = anchor_start - new.fragments[anchor_idx].start;
    if sliding != 0.0 {
        for frag in &mut new.fragments {
            frag.start += sliding;
        }
    }
    new.pts_known = pts_anchor.is_some() || old.pts_known;
    debug!(
        sliding,
        start_sn = new_start,
        end_sn = new.end_sn(),
        "Merged live playlist"
    );
    sliding
}
