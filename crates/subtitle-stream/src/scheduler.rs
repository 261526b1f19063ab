// Subtitle fragment selection: decides what, if anything, to load on a tick.

use crate::buffer::{BufferedRange, buffered_info};
use crate::config::SubtitleStreamConfig;
use crate::decryption::KeyCache;
use crate::fragment::{Fragment, PlaylistDetails};
use crate::lookup::{find_fragment_by_pdt, find_fragment_by_pts};
use crate::tracker::{FragmentState, FragmentTracker};
use tracing::trace;

/// Snapshot of everything the selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleInput<'a> {
    /// Current playback position in seconds
    pub position: f64,
    pub buffered: &'a [BufferedRange],
    pub details: &'a PlaylistDetails,
    pub previous: Option<&'a Fragment>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitReason {
    EmptyPlaylist,
    BufferFull { buffered: f64, cap: f64 },
    NoFragment,
    AlreadyTracked(FragmentState),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision<'a> {
    Wait(WaitReason),
    LoadKey(&'a Fragment),
    LoadFragment(&'a Fragment),
}

pub struct FragmentScheduler<'s> {
    config: &'s SubtitleStreamConfig,
    tracker: &'s dyn FragmentTracker,
    keys: &'s KeyCache,
}

impl<'s> FragmentScheduler<'s> {
    pub fn new(
        config: &'s SubtitleStreamConfig,
        tracker: &'s dyn FragmentTracker,
        keys: &'s KeyCache,
    ) -> Self {
        Self {
            config,
            tracker,
            keys,
        }
    }

    pub fn schedule<'a>(&self, input: ScheduleInput<'a>) -> Decision<'a> {
        let candidate = match self.find_candidate(input) {
            Ok(frag) => frag,
            Err(reason) => return Decision::Wait(reason),
        };

        if candidate.encrypted() && !self.keys.is_ready(candidate) {
            return Decision::LoadKey(candidate);
        }

        match self.tracker.state(candidate) {
            FragmentState::NotLoaded => Decision::LoadFragment(candidate),
            state => Decision::Wait(WaitReason::AlreadyTracked(state)),
        }
    }

    /// Pick the fragment that extends the buffer ahead of the playback position.
    pub fn find_candidate<'a>(&self, input: ScheduleInput<'a>) -> Result<&'a Fragment, WaitReason> {
        let fragments = &input.details.fragments;
        let last = fragments.last().ok_or(WaitReason::EmptyPlaylist)?;

        let info = buffered_info(input.buffered, input.position, self.config.max_buffer_hole);
        let cap = self.config.max_buffer_cap();
        if info.len > cap {
            return Err(WaitReason::BufferFull {
                buffered: info.len,
                cap,
            });
        }

        let tolerance = self.config.max_frag_lookup_tolerance;
        let playlist_end = last.end();

        if info.end >= playlist_end {
            return Ok(last);
        }

        let by_pdt = input
            .previous
            .filter(|_| input.details.has_program_date_time)
            .and_then(|prev| {
                find_fragment_by_pdt(fragments, prev.end_program_date_time_millis(), tolerance)
            });
        if let Some(frag) = by_pdt {
            trace!(sn = frag.sn, "Selected subtitle fragment by program-date-time");
            return Ok(frag);
        }

        find_fragment_by_pts(input.previous, fragments, info.end, tolerance)
            .inspect(|frag| {
                trace!(
                    sn = frag.sn,
                    buffer_end = info.end,
                    "Selected subtitle fragment by timestamp"
                )
            })
            .ok_or(WaitReason::NoFragment)
    }
}
