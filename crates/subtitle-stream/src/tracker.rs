// Fragment state table shared between stream controllers.

use crate::fragment::{Fragment, FragmentKind, TrackId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FragmentState {
    NotLoaded,
    Loading,
    Loaded,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    kind: FragmentKind,
    track: TrackId,
    sn: u64,
}

impl From<&Fragment> for FragmentKey {
    fn from(fragment: &Fragment) -> Self {
        Self {
            kind: fragment.kind,
            track: fragment.track,
            sn: fragment.sn,
        }
    }
}

/// Tracks the load state of every fragment known to the player.
pub trait FragmentTracker: Send + Sync {
    fn state(&self, fragment: &Fragment) -> FragmentState;

    fn mark(&self, fragment: &Fragment, state: FragmentState);

    fn remove(&self, fragment: &Fragment);

    /// Drop every entry of the given media kind.
    fn remove_all(&self, kind: FragmentKind);
}

#[derive(Debug, Default)]
pub struct FragmentStateTable {
    entries: Mutex<HashMap<FragmentKey, FragmentState>>,
}

impl FragmentStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl FragmentTracker for FragmentStateTable {
    fn state(&self, fragment: &Fragment) -> FragmentState {
        self.entries
            .lock()
            .get(&FragmentKey::from(fragment))
            .copied()
            .unwrap_or(FragmentState::NotLoaded)
    }

    fn mark(&self, fragment: &Fragment, state: FragmentState) {
        trace!(sn = fragment.sn, track = fragment.track, %state, "Fragment state updated");
        let key = FragmentKey::from(fragment);
        let mut entries = self.entries.lock();
        if state == FragmentState::NotLoaded {
            entries.remove(&key);
        } else {
            entries.insert(key, state);
        }
    }

    fn remove(&self, fragment: &Fragment) {
        self.entries.lock().remove(&FragmentKey::from(fragment));
    }

    fn remove_all(&self, kind: FragmentKind) {
        self.entries.lock().retain(|key, _| key.kind != kind);
    }
}
