// Subtitle fragment acquisition for HLS playback

pub mod buffer;
pub mod config;
mod controller;
mod coordinator;
pub mod decryption;
mod driver;
pub mod error;
pub mod events;
pub mod fragment;
pub mod lookup;
pub mod media;
pub mod merge;
mod scheduler;
mod state;
pub mod tracker;
mod tracks;

// Re-exports for easier access
pub use buffer::{BufferInfo, BufferedRange, BufferedRanges, buffered_info};
pub use config::{SubtitleStreamConfig, SubtitleStreamConfigBuilder};
pub use controller::{ControllerAction, SubtitleStreamController};
pub use coordinator::{SubtitleStreamCoordinator, SubtitleStreamHandles};
pub use decryption::{Aes128Decrypter, DecryptJob, DecryptStats, KeyCache, PayloadDecrypter};
pub use driver::SubtitleStreamDriver;
pub use error::SubtitleStreamError;
pub use events::{ErrorDetails, LoaderHandle, SubtitleEvent, SubtitleRequest};
pub use fragment::{
    DecryptData, EncryptionMethod, Fragment, FragmentKind, PlaylistDetails, TrackId,
};
pub use media::{MediaClock, SharedMediaClock};
pub use merge::{PlaylistMerger, SubtitlePlaylistMerger};
pub use scheduler::{Decision, FragmentScheduler, ScheduleInput, WaitReason};
pub use state::StreamState;
pub use tracker::{FragmentState, FragmentStateTable, FragmentTracker};
pub use tracks::{SubtitleTrack, TrackEntry, TrackRegistry};
