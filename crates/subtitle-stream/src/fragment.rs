// Subtitle playlist model: fragments, decrypt data and per-track playlist details.

use crate::error::SubtitleStreamError;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use m3u8_rs::{KeyMethod, MediaPlaylist};
use tracing::{trace, warn};
use url::Url;

pub type TrackId = u32;

/// Which media type a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FragmentKind {
    Main,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes128,
    SampleAes,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptData {
    pub method: EncryptionMethod,
    /// Absolute key URI
    pub uri: Option<String>,
    /// Explicit IV from the playlist; derived from the sequence number when absent
    pub iv: Option<[u8; 16]>,
    /// Key bytes, once delivered
    pub key: Option<Bytes>,
}

impl DecryptData {
    pub fn aes128(uri: impl Into<String>, iv: Option<[u8; 16]>) -> Self {
        Self {
            method: EncryptionMethod::Aes128,
            uri: Some(uri.into()),
            iv,
            key: None,
        }
    }

    pub fn iv_for(&self, sn: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| sequence_iv(sn))
    }
}

/// AES-128 IV derived from the media sequence number.
pub fn sequence_iv(sn: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sn.to_be_bytes());
    iv
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sn: u64,
    pub track: TrackId,
    pub kind: FragmentKind,
    pub uri: String,
    /// Start on the presentation timeline, in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
    pub program_date_time: Option<DateTime<Utc>>,
    pub decrypt_data: Option<DecryptData>,
}

impl Fragment {
    pub fn subtitle(track: TrackId, sn: u64, start: f64, duration: f64) -> Self {
        Self {
            sn,
            track,
            kind: FragmentKind::Subtitle,
            uri: format!("fragment_{sn}.vtt"),
            start,
            duration,
            program_date_time: None,
            decrypt_data: None,
        }
    }

    pub fn with_program_date_time(mut self, pdt: DateTime<Utc>) -> Self {
        self.program_date_time = Some(pdt);
        self
    }

    pub fn with_decrypt_data(mut self, decrypt_data: DecryptData) -> Self {
        self.decrypt_data = Some(decrypt_data);
        self
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// True when the payload must be decrypted with a key fetched from `decrypt_data.uri`.
    pub fn encrypted(&self) -> bool {
        self.decrypt_data.as_ref().is_some_and(|d| d.uri.is_some())
    }

    pub fn key_uri(&self) -> Option<&str> {
        self.decrypt_data.as_ref().and_then(|d| d.uri.as_deref())
    }

    pub fn end_program_date_time(&self) -> Option<DateTime<Utc>> {
        let pdt = self.program_date_time?;
        let delta = TimeDelta::try_milliseconds((self.duration * 1000.0).round() as i64)?;
        pdt.checked_add_signed(delta)
    }

    pub(crate) fn program_date_time_millis(&self) -> Option<f64> {
        self.program_date_time.map(|pdt| pdt.timestamp_millis() as f64)
    }

    pub(crate) fn end_program_date_time_millis(&self) -> Option<f64> {
        self.program_date_time_millis()
            .map(|start| start + self.duration * 1000.0)
    }

    /// Identity of a fragment across playlist reloads.
    pub fn same_as(&self, other: &Fragment) -> bool {
        self.kind == other.kind && self.track == other.track && self.sn == other.sn
    }
}

/// Parsed playlist of one subtitle track.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaylistDetails {
    pub fragments: Vec<Fragment>,
    pub live: bool,
    pub has_program_date_time: bool,
    pub target_duration: f64,
}

impl PlaylistDetails {
    pub fn new(fragments: Vec<Fragment>, live: bool) -> Self {
        let has_program_date_time = fragments.iter().any(|f| f.program_date_time.is_some());
        let target_duration = fragments
            .iter()
            .map(|f| f.duration)
            .fold(0.0_f64, f64::max)
            .ceil();
        Self {
            fragments,
            live,
            has_program_date_time,
            target_duration,
        }
    }

    pub fn start_sn(&self) -> Option<u64> {
        self.fragments.first().map(|f| f.sn)
    }

    pub fn end_sn(&self) -> Option<u64> {
        self.fragments.last().map(|f| f.sn)
    }

    /// End of the last fragment on the presentation timeline.
    pub fn end(&self) -> Option<f64> {
        self.fragments.last().map(Fragment::end)
    }

    /// Build details from a parsed media playlist.
    ///
    /// Starts are laid out end-to-end from zero, URIs are resolved against
    /// `base_url`, the active `EXT-X-KEY` is carried forward and program-date-time
    /// is back-filled from the previous tagged fragment.
    pub fn from_media_playlist(
        track: TrackId,
        playlist: &MediaPlaylist,
        base_url: &str,
    ) -> Result<Self, SubtitleStreamError> {
        let base = Url::parse(base_url).map_err(|e| {
            SubtitleStreamError::PlaylistError(format!("Invalid base URL {base_url}: {e}"))
        })?;

        let mut fragments: Vec<Fragment> = Vec::with_capacity(playlist.segments.len());
        let mut active_key: Option<DecryptData> = None;
        let mut start = 0.0;

        for (idx, segment) in playlist.segments.iter().enumerate() {
            let sn = playlist.media_sequence + idx as u64;

            if let Some(key) = &segment.key {
                active_key = match &key.method {
                    KeyMethod::None => None,
                    method => {
                        let method = match method {
                            KeyMethod::AES128 => EncryptionMethod::Aes128,
                            KeyMethod::SampleAES => EncryptionMethod::SampleAes,
                            other => {
                                warn!(sn, method = ?other, "Unsupported subtitle key method");
                                EncryptionMethod::Other(format!("{other:?}"))
                            }
                        };
                        let uri = key
                            .uri
                            .as_deref()
                            .map(|uri| resolve_uri(&base, uri))
                            .transpose()?;
                        let iv = key.iv.as_deref().map(parse_iv).transpose()?;
                        Some(DecryptData {
                            method,
                            uri,
                            iv,
                            key: None,
                        })
                    }
                };
            }

            let program_date_time = segment
                .program_date_time
                .map(|pdt| pdt.with_timezone(&Utc))
                .or_else(|| fragments.last().and_then(Fragment::end_program_date_time));

            let duration = segment.duration as f64;
            fragments.push(Fragment {
                sn,
                track,
                kind: FragmentKind::Subtitle,
                uri: resolve_uri(&base, &segment.uri)?,
                start,
                duration,
                program_date_time,
                decrypt_data: active_key.clone(),
            });
            start += duration;
        }

        trace!(
            track,
            fragments = fragments.len(),
            live = !playlist.end_list,
            "Converted subtitle media playlist"
        );

        let mut details = Self::new(fragments, !playlist.end_list);
        details.target_duration = playlist.target_duration as f64;
        Ok(details)
    }
}

fn resolve_uri(base: &Url, uri: &str) -> Result<String, SubtitleStreamError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    base.join(uri).map(|u| u.to_string()).map_err(|e| {
        SubtitleStreamError::PlaylistError(format!("Could not join {base} with {uri}: {e}"))
    })
}

fn parse_iv(iv_hex: &str) -> Result<[u8; 16], SubtitleStreamError> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv).map_err(|e| {
        SubtitleStreamError::PlaylistError(format!("Failed to parse IV '{iv_hex}': {e}"))
    })?;
    Ok(iv)
}
