use crate::buffer::BufferedRanges;
use crate::fragment::{PlaylistDetails, TrackId};
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubtitleTrack {
    pub id: TrackId,
    pub name: Option<String>,
    pub lang: Option<String>,
    pub url: Option<String>,
    /// Absent until the track's playlist has loaded once
    pub details: Option<PlaylistDetails>,
}

impl SubtitleTrack {
    pub fn new(id: TrackId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: PlaylistDetails) -> Self {
        self.details = Some(details);
        self
    }
}

/// A track together with what has been buffered for it.
#[derive(Debug, Clone, Default)]
pub struct TrackEntry {
    pub track: SubtitleTrack,
    pub buffered: BufferedRanges,
}

/// Subtitle tracks keyed by id, in track-list order.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    entries: IndexMap<TrackId, TrackEntry>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole track list; buffering knowledge starts from scratch.
    pub fn replace(&mut self, tracks: Vec<SubtitleTrack>) {
        self.entries = tracks
            .into_iter()
            .map(|track| {
                (
                    track.id,
                    TrackEntry {
                        track,
                        buffered: BufferedRanges::new(),
                    },
                )
            })
            .collect();
    }

    pub fn reset_buffered(&mut self) {
        for entry in self.entries.values_mut() {
            entry.buffered.clear();
        }
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut TrackEntry> {
        self.entries.get_mut(&id)
    }

    pub fn details(&self, id: TrackId) -> Option<&PlaylistDetails> {
        self.get(id).and_then(|entry| entry.track.details.as_ref())
    }

    pub fn has_details(&self, id: TrackId) -> bool {
        self.details(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
