use crate::decryption::DecryptStats;
use crate::error::SubtitleStreamError;
use crate::fragment::{Fragment, PlaylistDetails, TrackId};
use crate::media::MediaClock;
use crate::tracks::SubtitleTrack;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error categories reported by the loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorDetails {
    FragLoadError,
    FragLoadTimeout,
    KeyLoadError,
    KeyLoadTimeout,
    Other,
}

/// Inbound events consumed by the subtitle stream controller.
#[derive(Debug)]
pub enum SubtitleEvent {
    MediaAttached {
        media: Arc<dyn MediaClock>,
    },
    MediaDetaching,
    StartLoad,
    StopLoad,
    TracksUpdated {
        tracks: Vec<SubtitleTrack>,
    },
    /// `None` disables subtitles
    TrackSwitch {
        id: Option<TrackId>,
    },
    TrackLoaded {
        id: TrackId,
        details: PlaylistDetails,
    },
    KeyLoaded {
        fragment: Fragment,
        key: Bytes,
    },
    FragLoaded {
        fragment: Fragment,
        payload: Bytes,
    },
    /// Completion of a decrypt job started for a loaded fragment
    FragDecrypted {
        fragment: Fragment,
        result: Result<Bytes, SubtitleStreamError>,
        stats: DecryptStats,
    },
    FragProcessed {
        fragment: Fragment,
        success: bool,
    },
    /// Primary (audio/video) playlist refreshed
    LevelUpdated {
        fragments: Vec<Fragment>,
    },
    Error {
        fragment: Option<Fragment>,
        details: ErrorDetails,
        fatal: bool,
    },
    Seeking,
}

/// Abort capability for an outstanding key or fragment request.
#[derive(Debug, Clone, Default)]
pub struct LoaderHandle(CancellationToken);

impl LoaderHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Outbound requests emitted by the controller.
#[derive(Debug)]
pub enum SubtitleRequest {
    LoadKey {
        fragment: Fragment,
        loader: LoaderHandle,
    },
    LoadFragment {
        fragment: Fragment,
        loader: LoaderHandle,
    },
    FragmentDecrypted {
        fragment: Fragment,
        payload: Bytes,
        stats: DecryptStats,
    },
}

impl SubtitleRequest {
    pub fn fragment(&self) -> &Fragment {
        match self {
            Self::LoadKey { fragment, .. }
            | Self::LoadFragment { fragment, .. }
            | Self::FragmentDecrypted { fragment, .. } => fragment,
        }
    }
}
