// Live subtitle playlist merge: keeps fragment start times stable across reloads.

use crate::fragment::PlaylistDetails;
use tracing::trace;

pub trait PlaylistMerger: Send + Sync {
    /// Align `new` with the previously loaded `old` playlist before it replaces it.
    ///
    /// `reference_start` is the timeline origin of the primary track and is used
    /// when the two playlists share no fragments.
    fn merge(&self, old: Option<&PlaylistDetails>, new: &mut PlaylistDetails, reference_start: f64);
}

/// Default merger for live subtitle playlists.
///
/// Fragments present in both playlists inherit their old start; fragments after
/// the overlap are laid out end-to-end from there. Without any overlap the whole
/// new playlist is shifted by `reference_start`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubtitlePlaylistMerger;

impl PlaylistMerger for SubtitlePlaylistMerger {
    fn merge(
        &self,
        old: Option<&PlaylistDetails>,
        new: &mut PlaylistDetails,
        reference_start: f64,
    ) {
        let last_shared = old.and_then(|old| inherit_shared_starts(old, new));

        match last_shared {
            Some(last) => {
                for i in last + 1..new.fragments.len() {
                    let prev_end = new.fragments[i - 1].end();
                    new.fragments[i].start = prev_end;
                }
                trace!(shared_until = last, "Merged live subtitle playlist");
            }
            None => {
                for frag in &mut new.fragments {
                    frag.start += reference_start;
                }
                trace!(reference_start, "Aligned live subtitle playlist to primary timeline");
            }
        }
    }
}

/// Copy starts for fragments present in both playlists; returns the index of the
/// last shared fragment in `new`.
fn inherit_shared_starts(old: &PlaylistDetails, new: &mut PlaylistDetails) -> Option<usize> {
    let (old_start, old_end) = (old.start_sn()?, old.end_sn()?);
    let (new_start, new_end) = (new.start_sn()?, new.end_sn()?);

    let first = old_start.max(new_start);
    let last = old_end.min(new_end);
    if first > last {
        return None;
    }

    let mut last_shared = None;
    for sn in first..=last {
        let new_idx = (sn - new_start) as usize;
        let old_idx = (sn - old_start) as usize;
        let (Some(old_frag), Some(new_frag)) =
            (old.fragments.get(old_idx), new.fragments.get_mut(new_idx))
        else {
            break;
        };
        new_frag.start = old_frag.start;
        last_shared = Some(new_idx);
    }
    last_shared
}
