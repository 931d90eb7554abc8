// HLS Manifest Provider: fetches master and media playlists and turns them into tracks and fragment lists.

use std::fmt;

use async_trait::async_trait;
use m3u8_rs::{
    AlternativeMediaType, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res,
};
use reqwest::Client;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::config::NetworkConfig;
use crate::error::LoadError;
use crate::fragment::{ByteRange, EncryptionInfo, Fragment, PlaylistType};
use crate::key::parse_iv;
use crate::track::{InitSegment, Track, TrackDetails, split_codecs};

/// Tracks announced by the entry playlist.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Variants, in playlist order.
    pub tracks: Vec<Track>,
    /// Alternate audio renditions that have their own playlist.
    pub audio_tracks: Vec<Track>,
}

impl Manifest {
    /// Variant with the highest bandwidth.
    pub fn best_track(&self) -> Option<usize> {
        self.tracks
            .iter()
            .enumerate()
            .max_by_key(|(_, t)| t.bitrate)
            .map(|(idx, _)| idx)
    }

    /// Audio rendition to play with variant `level`: the group's default, else its first entry.
    pub fn audio_track_for(&self, level: usize) -> Option<usize> {
        let group = self.tracks.get(level)?.audio_group.as_deref()?;
        let mut in_group = self
            .audio_tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.audio_group.as_deref() == Some(group));
        let first = in_group.clone().next().map(|(idx, _)| idx);
        in_group
            .find(|(_, t)| t.default)
            .map(|(idx, _)| idx)
            .or(first)
    }
}

#[async_trait]
pub trait ManifestProvider: Send + Sync {
    /// Load the entry playlist. A media playlist yields a single track whose
    /// details are already filled in.
    async fn load_manifest(&self, url: &Url) -> Result<Manifest, LoadError>;

    /// Load (or refresh) the media playlist of one track.
    async fn load_details(
        &self,
        url: &Url,
        kind: PlaylistType,
        level: usize,
    ) -> Result<TrackDetails, LoadError>;
}

pub struct M3u8ManifestProvider {
    client: Client,
    config: NetworkConfig,
}

impl M3u8ManifestProvider {
    pub fn new(client: Client, config: NetworkConfig) -> Self {
        Self { client, config }
    }

    async fn fetch(&self, url: &Url) -> Result<Playlist, LoadError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| LoadError::from_reqwest(url.as_str(), &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| LoadError::from_reqwest(url.as_str(), &e))?;
        trace!(%url, bytes = body.len(), "Playlist fetched");
        parse_playlist_res(&body).map_err(|e| {
            LoadError::invalid_content(url.as_str(), format!("failed to parse playlist: {e}"))
        })
    }
}

impl fmt::Debug for M3u8ManifestProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("M3u8ManifestProvider")
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ManifestProvider for M3u8ManifestProvider {
    #[instrument(skip(self), fields(url = %url))]
    async fn load_manifest(&self, url: &Url) -> Result<Manifest, LoadError> {
        match self.fetch(url).await? {
            Playlist::MasterPlaylist(master) => manifest_from_master(&master, url),
            Playlist::MediaPlaylist(media) => {
                let mut track = Track::new(0, PlaylistType::Main, url.clone());
                track.details = Some(details_from_playlist(&media, url, PlaylistType::Main, 0)?);
                Ok(Manifest {
                    tracks: vec![track],
                    audio_tracks: Vec::new(),
                })
            }
        }
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn load_details(
        &self,
        url: &Url,
        kind: PlaylistType,
        level: usize,
    ) -> Result<TrackDetails, LoadError> {
        match self.fetch(url).await? {
            Playlist::MediaPlaylist(media) => details_from_playlist(&media, url, kind, level),
            Playlist::MasterPlaylist(_) => Err(LoadError::invalid_content(
                url.as_str(),
                "expected a media playlist, got a master playlist",
            )),
        }
    }
}

fn join(base: &Url, uri: &str) -> Result<Url, LoadError> {
    base.join(uri).map_err(|e| {
        LoadError::invalid_content(base.as_str(), format!("cannot resolve '{uri}': {e}"))
    })
}

pub fn manifest_from_master(master: &MasterPlaylist, url: &Url) -> Result<Manifest, LoadError> {
    let mut tracks = Vec::new();
    for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
        let mut track = Track::new(tracks.len(), PlaylistType::Main, join(url, &variant.uri)?);
        track.bitrate = variant.average_bandwidth.unwrap_or(variant.bandwidth);
        if let Some(codecs) = &variant.codecs {
            (track.audio_codec, track.video_codec) = split_codecs(codecs);
        }
        if let Some(resolution) = variant.resolution {
            track.width = resolution.width;
            track.height = resolution.height;
        }
        track.audio_group = variant.audio.clone();
        tracks.push(track);
    }
    if tracks.is_empty() {
        return Err(LoadError::invalid_content(url.as_str(), "master playlist has no variants"));
    }

    let mut audio_tracks = Vec::new();
    for media in master
        .alternatives
        .iter()
        .filter(|m| matches!(m.media_type, AlternativeMediaType::Audio))
    {
        // Renditions without a URI are muxed into the variant streams.
        let Some(uri) = media.uri.as_deref() else {
            continue;
        };
        let mut track = Track::new(audio_tracks.len(), PlaylistType::Audio, join(url, uri)?);
        track.name = Some(media.name.clone());
        track.audio_group = Some(media.group_id.clone());
        track.default = media.default;
        track.audio_codec = tracks
            .iter()
            .find(|t| t.audio_group.as_deref() == Some(media.group_id.as_str()))
            .and_then(|t| t.audio_codec.clone());
        audio_tracks.push(track);
    }

    debug!(
        variants = tracks.len(),
        audio_renditions = audio_tracks.len(),
        "Parsed master playlist"
    );
    Ok(Manifest {
        tracks,
        audio_tracks,
    })
}

/// Build the fragment list of a media playlist. Start times are cumulative
/// from zero; live refreshes are later shifted by reconciliation.
pub fn details_from_playlist(
    playlist: &MediaPlaylist,
    url: &Url,
    kind: PlaylistType,
    level: usize,
) -> Result<TrackDetails, LoadError> {
    let mut fragments = Vec::with_capacity(playlist.segments.len());
    let mut init_segment: Option<InitSegment> = None;
    let level_map = playlist_level_map(playlist);
    let mut cc = playlist.discontinuity_sequence as u32;
    let mut start = 0.0;
    let mut key: Option<EncryptionInfo> = None;
    let mut next_range_start: Option<(String, u64)> = None;
    let mut pdt: Option<i64> = None;

    for (idx, segment) in playlist.segments.iter().enumerate() {
        let sn = playlist.media_sequence + idx as u64;
        if segment.discontinuity && idx > 0 {
            cc += 1;
        }
        if let Some(tag) = &segment.key {
            key = match &tag.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let uri = tag.uri.as_deref().ok_or_else(|| {
                        LoadError::invalid_content(url.as_str(), "AES-128 key without URI")
                    })?;
                    let iv = match tag.iv.as_deref() {
                        Some(value) => Some(parse_iv(value).ok_or_else(|| {
                            LoadError::invalid_content(url.as_str(), format!("invalid IV '{value}'"))
                        })?),
                        None => None,
                    };
                    Some(EncryptionInfo::new(join(url, uri)?.to_string(), iv))
                }
                other => {
                    return Err(LoadError::invalid_content(
                        url.as_str(),
                        format!("unsupported encryption method {other:?}"),
                    ));
                }
            };
        }

        let frag_url = join(url, &segment.uri)?.to_string();
        let byte_range = segment.byte_range.as_ref().map(|range| {
            let offset = range.offset.unwrap_or_else(|| match &next_range_start {
                Some((uri, end)) if *uri == frag_url => *end,
                _ => 0,
            });
            ByteRange {
                start: offset,
                end: offset + range.length,
            }
        });
        next_range_start = byte_range.map(|r| (frag_url.clone(), r.end));

        let map = segment
            .map
            .as_ref()
            .or(level_map.as_ref().filter(|_| idx == 0));
        if let Some(map) = map {
            let map_url = join(url, &map.uri)?.to_string();
            match &init_segment {
                None => {
                    let mut frag = Fragment::new(kind, level, sn, start, 0.0);
                    frag.url = map_url;
                    frag.cc = cc;
                    frag.is_init_segment = true;
                    frag.decrypt = key.clone();
                    frag.byte_range = map.byte_range.as_ref().map(|r| {
                        let offset = r.offset.unwrap_or(0);
                        ByteRange {
                            start: offset,
                            end: offset + r.length,
                        }
                    });
                    init_segment = Some(InitSegment {
                        fragment: frag,
                        data: None,
                    });
                }
                Some(init) if init.fragment.url != map_url => {
                    warn!(%url, sn, map = %map_url, "Ignoring init segment change within a playlist");
                }
                Some(_) => {}
            }
        }

        let duration = segment.duration as f64;
        pdt = match segment.program_date_time {
            Some(time) => Some(time.timestamp_millis()),
            None => pdt,
        };
        let mut frag = Fragment::new(kind, level, sn, start, duration);
        frag.url = frag_url;
        frag.cc = cc;
        frag.byte_range = byte_range;
        frag.decrypt = key.clone();
        frag.program_date_time = pdt;
        pdt = frag.end_program_date_time();
        start += duration;
        fragments.push(frag);
    }

    Ok(TrackDetails {
        url: url.clone(),
        fragments,
        init_segment,
        target_duration: playlist.target_duration as f64,
        live: !playlist.end_list,
        pts_known: false,
    })
}

/// `EXT-X-MAP` placed before the first segment is not attached to any
/// segment by the parser; it is kept among the unknown tags instead.
fn playlist_level_map(playlist: &MediaPlaylist) -> Option<m3u8_rs::Map> {
    let rest = playlist
        .unknown_tags
        .iter()
        .find(|t| t.tag == "X-MAP")?
        .rest
        .as_deref()?;

    let mut uri = None;
    let mut byte_range = None;
    for (key, value) in attributes(rest) {
        if key.eq_ignore_ascii_case("URI") {
            uri = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("BYTERANGE") {
            let (length, offset) = value.split_once('@').unwrap_or((value, ""));
            if let Ok(length) = length.trim().parse::<u64>() {
                byte_range = Some(m3u8_rs::ByteRange {
                    length,
                    offset: offset.trim().parse::<u64>().ok(),
                });
            }
        }
    }
    Some(m3u8_rs::Map {
        uri: uri?,
        byte_range,
        other_attributes: Default::default(),
    })
}

/// Split an attribute list on commas outside quotes, unquoting values.
fn attributes(list: &str) -> Vec<(&str, &str)> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in list.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&list[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim(), value))
        })
        .collect()
}
