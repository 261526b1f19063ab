// Subtitle Stream Controller: lifecycle state machine, tick scheduling and seek handling.

use crate::buffer::BufferedRange;
use crate::config::SubtitleStreamConfig;
use crate::decryption::{DecryptJob, DecryptStats, KeyCache};
use crate::error::SubtitleStreamError;
use crate::events::{ErrorDetails, LoaderHandle, SubtitleEvent, SubtitleRequest};
use crate::fragment::{EncryptionMethod, Fragment, FragmentKind, PlaylistDetails, TrackId};
use crate::media::MediaClock;
use crate::merge::{PlaylistMerger, SubtitlePlaylistMerger};
use crate::scheduler::{Decision, FragmentScheduler, ScheduleInput};
use crate::state::StreamState;
use crate::tracker::{FragmentState, FragmentTracker};
use crate::tracks::{SubtitleTrack, TrackRegistry};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Work produced by the controller for its driver.
#[derive(Debug)]
pub enum ControllerAction {
    /// Forward to the host
    Request(SubtitleRequest),
    /// Run off the event loop; completion comes back as `FragDecrypted`
    Decrypt(DecryptJob),
}

enum Selected {
    Key(Fragment),
    Fragment(Fragment),
}

pub struct SubtitleStreamController {
    config: Arc<SubtitleStreamConfig>,
    tracker: Arc<dyn FragmentTracker>,
    merger: Box<dyn PlaylistMerger>,
    state: StreamState,
    media: Option<Arc<dyn MediaClock>>,
    tracks: TrackRegistry,
    current_track: Option<TrackId>,
    frag_current: Option<Fragment>,
    frag_previous: Option<Fragment>,
    /// Abort handle of the outstanding key or fragment request
    loader: Option<LoaderHandle>,
    keys: KeyCache,
    /// Timeline origin of the primary track's latest playlist
    last_av_start: f64,
    ticking: bool,
    load_requested: bool,
    decrypt_token: CancellationToken,
}

impl SubtitleStreamController {
    pub fn new(config: Arc<SubtitleStreamConfig>, tracker: Arc<dyn FragmentTracker>) -> Self {
        Self::with_merger(config, tracker, Box::new(SubtitlePlaylistMerger))
    }

    pub fn with_merger(
        config: Arc<SubtitleStreamConfig>,
        tracker: Arc<dyn FragmentTracker>,
        merger: Box<dyn PlaylistMerger>,
    ) -> Self {
        Self {
            config,
            tracker,
            merger,
            state: StreamState::Stopped,
            media: None,
            tracks: TrackRegistry::new(),
            current_track: None,
            frag_current: None,
            frag_previous: None,
            loader: None,
            keys: KeyCache::new(),
            last_av_start: 0.0,
            ticking: false,
            load_requested: false,
            decrypt_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the periodic tick should be running.
    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    pub fn current_track(&self) -> Option<TrackId> {
        self.current_track
    }

    pub fn current_fragment(&self) -> Option<&Fragment> {
        self.frag_current.as_ref()
    }

    pub fn previous_fragment(&self) -> Option<&Fragment> {
        self.frag_previous.as_ref()
    }

    pub fn last_av_start(&self) -> f64 {
        self.last_av_start
    }

    pub fn buffered(&self, track: TrackId) -> Option<&[BufferedRange]> {
        self.tracks.get(track).map(|entry| entry.buffered.as_slice())
    }

    pub fn track_details(&self, track: TrackId) -> Option<&PlaylistDetails> {
        self.tracks.details(track)
    }

    fn set_state(&mut self, next: StreamState) {
        if self.state != next {
            trace!(from = %self.state, to = %next, "Subtitle stream state changed");
            self.state = next;
        }
    }

    pub fn handle_event(&mut self, event: SubtitleEvent) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        match event {
            SubtitleEvent::MediaAttached { media } => self.on_media_attached(media),
            SubtitleEvent::MediaDetaching => self.on_media_detaching(),
            SubtitleEvent::StartLoad => actions.extend(self.start_load()),
            SubtitleEvent::StopLoad => self.stop_load(),
            SubtitleEvent::TracksUpdated { tracks } => self.on_tracks_updated(tracks),
            SubtitleEvent::TrackSwitch { id } => self.on_track_switch(id),
            SubtitleEvent::TrackLoaded { id, details } => self.on_track_loaded(id, details),
            SubtitleEvent::KeyLoaded { fragment, key } => self.on_key_loaded(&fragment, &key),
            SubtitleEvent::FragLoaded { fragment, payload } => {
                actions.extend(self.on_frag_loaded(fragment, payload));
            }
            SubtitleEvent::FragDecrypted {
                fragment,
                result,
                stats,
            } => actions.extend(self.on_frag_decrypted(fragment, result, stats)),
            SubtitleEvent::FragProcessed { fragment, success } => {
                self.on_frag_processed(fragment, success);
            }
            SubtitleEvent::LevelUpdated { fragments } => self.on_level_updated(&fragments),
            SubtitleEvent::Error {
                fragment,
                details,
                fatal,
            } => self.on_error(fragment, details, fatal),
            SubtitleEvent::Seeking => actions.extend(self.on_media_seeking()),
        }
        actions
    }

    /// Begin loading; scheduling starts right away if the active track has a playlist.
    ///
    /// An outstanding key or fragment request is left to complete.
    pub fn start_load(&mut self) -> Option<ControllerAction> {
        self.load_requested = true;
        let Some(track) = self.current_track.filter(|id| self.tracks.has_details(*id)) else {
            debug!(
                track = ?self.current_track,
                "Subtitle load requested before playlist is available"
            );
            return None;
        };
        if self.state.is_loading() {
            debug!(track, state = %self.state, "Subtitle load already in progress");
            self.ticking = true;
            return None;
        }
        info!(track, "Starting subtitle load");
        self.set_state(StreamState::Idle);
        self.ticking = true;
        self.tick().map(ControllerAction::Request)
    }

    pub fn stop_load(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        self.decrypt_token.cancel();
        self.decrypt_token = CancellationToken::new();
        if let Some(current) = self.frag_current.take() {
            self.tracker.remove(&current);
        }
        self.frag_previous = None;
        self.last_av_start = 0.0;
        self.ticking = false;
        self.load_requested = false;
        self.set_state(StreamState::Stopped);
    }

    fn on_media_attached(&mut self, media: Arc<dyn MediaClock>) {
        debug!(position = media.current_time(), "Media attached to subtitle stream");
        self.media = Some(media);
        self.load_requested = true;
        if !self.state.is_loading() {
            self.set_state(StreamState::Idle);
        }
    }

    fn on_media_detaching(&mut self) {
        if self.media.take().is_none() {
            return;
        }
        debug!("Media detaching from subtitle stream");
        self.tracker.remove_all(FragmentKind::Subtitle);
        self.tracks.reset_buffered();
        self.keys.clear();
        self.stop_load();
    }

    fn on_tracks_updated(&mut self, tracks: Vec<SubtitleTrack>) {
        debug!(count = tracks.len(), "Subtitle track list updated");
        self.tracks.replace(tracks);
    }

    fn on_track_switch(&mut self, id: Option<TrackId>) {
        self.current_track = id;
        match id {
            Some(id) if self.tracks.has_details(id) => {
                debug!(track = id, "Switched subtitle track");
                self.ticking = true;
            }
            Some(id) => {
                debug!(track = id, "Switched to subtitle track without playlist, pausing");
                self.ticking = false;
            }
            None => {
                debug!("Subtitles disabled");
                self.ticking = false;
            }
        }
    }

    fn on_track_loaded(&mut self, id: TrackId, mut details: PlaylistDetails) {
        if self.current_track != Some(id) {
            debug!(
                track = id,
                active = ?self.current_track,
                "Ignoring playlist of inactive subtitle track"
            );
            return;
        }
        let Some(entry) = self.tracks.get_mut(id) else {
            debug!(track = id, "Ignoring playlist of unknown subtitle track");
            return;
        };

        if details.live {
            self.merger
                .merge(entry.track.details.as_ref(), &mut details, self.last_av_start);
        }
        debug!(
            track = id,
            fragments = details.fragments.len(),
            live = details.live,
            "Subtitle playlist loaded"
        );
        entry.track.details = Some(details);
        self.ticking = true;

        if self.state == StreamState::Stopped && self.load_requested && self.media.is_some() {
            self.set_state(StreamState::Idle);
        }
    }

    fn on_key_loaded(&mut self, fragment: &Fragment, key: &Bytes) {
        if let Some(uri) = fragment.key_uri()
            && let Err(e) = self.keys.insert(uri, key)
        {
            warn!(sn = fragment.sn, error = %e, "Discarding subtitle decryption key");
        }
        if self.state == StreamState::KeyLoading {
            self.loader = None;
            self.set_state(StreamState::Idle);
        }
    }

    fn on_frag_loaded(&mut self, fragment: Fragment, payload: Bytes) -> Option<ControllerAction> {
        let is_current = self
            .frag_current
            .as_ref()
            .is_some_and(|current| current.same_as(&fragment));
        if self.state != StreamState::FragLoading
            || fragment.kind != FragmentKind::Subtitle
            || !is_current
        {
            debug!(sn = fragment.sn, state = %self.state, "Ignoring stale subtitle fragment load");
            return None;
        }
        self.tracker.mark(&fragment, FragmentState::Loaded);

        let decrypt_data = fragment
            .decrypt_data
            .as_ref()
            .filter(|d| d.method == EncryptionMethod::Aes128)?;
        if payload.is_empty() {
            return None;
        }
        let iv = decrypt_data.iv_for(fragment.sn);
        let Some(key) = self.keys.key_for(&fragment) else {
            warn!(sn = fragment.sn, "No key available for encrypted subtitle fragment");
            return None;
        };

        trace!(sn = fragment.sn, bytes = payload.len(), "Dispatching subtitle decryption");
        Some(ControllerAction::Decrypt(DecryptJob {
            fragment,
            payload,
            key,
            iv,
            token: self.decrypt_token.child_token(),
        }))
    }

    fn on_frag_decrypted(
        &mut self,
        fragment: Fragment,
        result: Result<Bytes, SubtitleStreamError>,
        stats: DecryptStats,
    ) -> Option<ControllerAction> {
        if self.media.is_none() {
            return None;
        }
        match result {
            Ok(payload) => Some(ControllerAction::Request(SubtitleRequest::FragmentDecrypted {
                fragment,
                payload,
                stats,
            })),
            Err(e) => {
                warn!(sn = fragment.sn, error = %e, "Subtitle fragment decryption failed");
                None
            }
        }
    }

    fn on_frag_processed(&mut self, fragment: Fragment, success: bool) {
        let is_current = self
            .frag_current
            .as_ref()
            .is_some_and(|current| current.same_as(&fragment));
        if self.state != StreamState::FragLoading || !is_current {
            debug!(
                sn = fragment.sn,
                state = %self.state,
                "Ignoring stale subtitle fragment result"
            );
            return;
        }

        self.frag_current = None;
        self.loader = None;
        self.set_state(StreamState::Idle);

        if success {
            self.tracker.mark(&fragment, FragmentState::Buffered);
            if self.current_track == Some(fragment.track)
                && let Some(entry) = self.tracks.get_mut(fragment.track)
            {
                entry
                    .buffered
                    .record_fragment(fragment.start, fragment.duration);
            }
        } else {
            debug!(sn = fragment.sn, "Subtitle fragment was rejected downstream");
            self.tracker.remove(&fragment);
        }
        self.frag_previous = Some(fragment);
    }

    fn on_level_updated(&mut self, fragments: &[Fragment]) {
        self.last_av_start = fragments.first().map_or(0.0, |f| f.start);
    }

    fn on_error(&mut self, fragment: Option<Fragment>, details: ErrorDetails, fatal: bool) {
        let Some(fragment) = fragment.filter(|f| f.kind == FragmentKind::Subtitle) else {
            return;
        };
        warn!(%details, fatal, sn = fragment.sn, "Subtitle load failed");

        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        if let Some(current) = self.frag_current.take() {
            self.tracker.remove(&current);
        }
        self.tracker.remove(&fragment);
        self.frag_previous = None;
        self.set_state(StreamState::Idle);
    }

    fn on_media_seeking(&mut self) -> Option<ControllerAction> {
        let position = self.media.as_ref()?.current_time();
        let current = self.frag_current.as_ref()?;

        let tolerance = self.config.max_frag_lookup_tolerance;
        let window_start = current.start - tolerance;
        let window_end = current.end() + tolerance;
        if (window_start..=window_end).contains(&position) {
            trace!(sn = current.sn, position, "Seek within in-flight subtitle fragment");
            return None;
        }

        debug!(
            sn = current.sn,
            position, window_start, window_end, "Seek left in-flight subtitle fragment, aborting"
        );
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        if let Some(current) = self.frag_current.take() {
            self.tracker.remove(&current);
        }
        self.frag_previous = None;
        self.set_state(StreamState::Idle);
        self.tick().map(ControllerAction::Request)
    }

    /// Evaluate the scheduler once. No-op unless `Idle` with an attached media and
    /// an active track that has a playlist.
    pub fn tick(&mut self) -> Option<SubtitleRequest> {
        if self.state != StreamState::Idle || !self.ticking {
            return None;
        }
        let position = self.media.as_ref()?.current_time();
        let entry = self.tracks.get(self.current_track?)?;
        let details = entry.track.details.as_ref()?;

        let scheduler = FragmentScheduler::new(&self.config, self.tracker.as_ref(), &self.keys);
        let decision = scheduler.schedule(ScheduleInput {
            position,
            buffered: entry.buffered.as_slice(),
            details,
            previous: self.frag_previous.as_ref(),
        });
        let selected = match decision {
            Decision::Wait(reason) => {
                trace!(?reason, position, "No subtitle fragment to load");
                return None;
            }
            Decision::LoadKey(frag) => Selected::Key(frag.clone()),
            Decision::LoadFragment(frag) => Selected::Fragment(frag.clone()),
        };

        let loader = LoaderHandle::new();
        self.loader = Some(loader.clone());
        match selected {
            Selected::Key(fragment) => {
                debug!(sn = fragment.sn, "Loading key for subtitle fragment");
                self.set_state(StreamState::KeyLoading);
                Some(SubtitleRequest::LoadKey { fragment, loader })
            }
            Selected::Fragment(fragment) => {
                debug!(
                    sn = fragment.sn,
                    track = fragment.track,
                    start = fragment.start,
                    "Loading subtitle fragment"
                );
                self.tracker.mark(&fragment, FragmentState::Loading);
                self.frag_current = Some(fragment.clone());
                self.set_state(StreamState::FragLoading);
                Some(SubtitleRequest::LoadFragment { fragment, loader })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryption::tests::encrypt_data;
    use crate::fragment::DecryptData;
    use crate::media::SharedMediaClock;
    use crate::tracker::FragmentStateTable;
    use std::time::Instant;

    struct Harness {
        controller: SubtitleStreamController,
        clock: Arc<SharedMediaClock>,
        tracker: Arc<FragmentStateTable>,
    }

    fn vod(count: u64, duration: f64) -> PlaylistDetails {
        let frags = (0..count)
            .map(|i| Fragment::subtitle(0, i, i as f64 * duration, duration))
            .collect();
        PlaylistDetails::new(frags, false)
    }

    fn harness_with(config: SubtitleStreamConfig, details: PlaylistDetails) -> Harness {
        let clock = Arc::new(SharedMediaClock::new(0.0));
        let tracker = Arc::new(FragmentStateTable::new());
        let mut controller = SubtitleStreamController::new(Arc::new(config), tracker.clone());

        controller.handle_event(SubtitleEvent::MediaAttached {
            media: clock.clone(),
        });
        controller.handle_event(SubtitleEvent::TracksUpdated {
            tracks: vec![SubtitleTrack::new(0), SubtitleTrack::new(1)],
        });
        controller.handle_event(SubtitleEvent::TrackSwitch { id: Some(0) });
        controller.handle_event(SubtitleEvent::TrackLoaded { id: 0, details });

        Harness {
            controller,
            clock,
            tracker,
        }
    }

    fn harness(count: u64, duration: f64) -> Harness {
        harness_with(SubtitleStreamConfig::default(), vod(count, duration))
    }

    fn expect_fragment_load(request: Option<SubtitleRequest>) -> (Fragment, LoaderHandle) {
        match request {
            Some(SubtitleRequest::LoadFragment { fragment, loader }) => (fragment, loader),
            other => panic!("expected fragment load, got {other:?}"),
        }
    }

    fn expect_action_load(actions: Vec<ControllerAction>) -> Fragment {
        match actions.into_iter().next() {
            Some(ControllerAction::Request(SubtitleRequest::LoadFragment { fragment, .. })) => {
                fragment
            }
            other => panic!("expected fragment load action, got {other:?}"),
        }
    }

    fn process(h: &mut Harness, fragment: Fragment, success: bool) {
        h.controller
            .handle_event(SubtitleEvent::FragProcessed { fragment, success });
    }

    #[test]
    fn test_tick_is_idempotent_while_loading() {
        let mut h = harness(10, 5.0);
        let (frag, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(frag.sn, 0);
        assert_eq!(h.controller.state(), StreamState::FragLoading);

        assert!(h.controller.tick().is_none());
        assert!(h.controller.tick().is_none());
        assert_eq!(h.controller.current_fragment().map(|f| f.sn), Some(0));
    }

    #[test]
    fn test_tracked_fragment_not_fetched_twice() {
        let mut h = harness(10, 5.0);
        let first = h.controller.track_details(0).unwrap().fragments[0].clone();
        h.tracker.mark(&first, FragmentState::Loaded);

        assert!(h.controller.tick().is_none());
        assert_eq!(h.controller.state(), StreamState::Idle);
    }

    #[test]
    fn test_adjacent_fragments_merge_into_one_range() {
        let mut h = harness(10, 5.0);
        let (frag0, _) = expect_fragment_load(h.controller.tick());
        process(&mut h, frag0, true);
        assert_eq!(h.controller.state(), StreamState::Idle);

        let (frag1, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(frag1.sn, 1);
        process(&mut h, frag1, true);

        assert_eq!(
            h.controller.buffered(0).unwrap(),
            &[BufferedRange::new(0.0, 10.0)]
        );
        assert_eq!(h.controller.previous_fragment().map(|f| f.sn), Some(1));
    }

    #[test]
    fn test_buffer_cap_stops_requests() {
        let config = SubtitleStreamConfig::builder()
            .with_max_buffer_length(8.0)
            .build();
        let mut h = harness_with(config, vod(10, 5.0));

        for _ in 0..2 {
            let (frag, _) = expect_fragment_load(h.controller.tick());
            process(&mut h, frag, true);
        }
        // 10s buffered ahead of position 0 exceeds the 8s cap
        assert!(h.controller.tick().is_none());
        assert_eq!(h.controller.state(), StreamState::Idle);

        h.clock.set(4.0);
        let (frag, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(frag.sn, 2);
    }

    #[test]
    fn test_seek_outside_window_aborts_and_reschedules() {
        let config = SubtitleStreamConfig::builder()
            .with_max_frag_lookup_tolerance(0.0)
            .build();
        let mut h = harness_with(config, vod(10, 5.0));
        h.clock.set(10.0);

        let (in_flight, loader) = expect_fragment_load(h.controller.tick());
        assert_eq!((in_flight.start, in_flight.duration), (10.0, 5.0));

        h.clock.set(20.0);
        let next = expect_action_load(h.controller.handle_event(SubtitleEvent::Seeking));

        assert!(loader.is_aborted());
        assert_eq!(h.tracker.state(&in_flight), FragmentState::NotLoaded);
        assert_eq!(next.sn, 4);
        assert_eq!(h.controller.current_fragment().map(|f| f.sn), Some(4));
        assert!(h.controller.previous_fragment().is_none());
        assert_eq!(h.controller.state(), StreamState::FragLoading);
    }

    #[test]
    fn test_seek_inside_window_keeps_fetch() {
        let config = SubtitleStreamConfig::builder()
            .with_max_frag_lookup_tolerance(0.0)
            .build();
        let mut h = harness_with(config, vod(10, 5.0));
        h.clock.set(10.0);
        let (in_flight, loader) = expect_fragment_load(h.controller.tick());

        h.clock.set(12.0);
        assert!(h.controller.handle_event(SubtitleEvent::Seeking).is_empty());

        assert!(!loader.is_aborted());
        assert_eq!(h.tracker.state(&in_flight), FragmentState::Loading);
        assert_eq!(h.controller.state(), StreamState::FragLoading);
    }

    #[test]
    fn test_seek_without_in_flight_fragment_is_noop() {
        let mut h = harness(10, 5.0);
        h.clock.set(30.0);
        assert!(h.controller.handle_event(SubtitleEvent::Seeking).is_empty());
        assert_eq!(h.controller.state(), StreamState::Idle);
    }

    #[test]
    fn test_switch_to_no_track_disarms_scheduling() {
        let mut h = harness(10, 5.0);
        assert!(h.controller.is_ticking());

        h.controller
            .handle_event(SubtitleEvent::TrackSwitch { id: None });
        assert!(!h.controller.is_ticking());
        assert!(h.controller.tick().is_none());

        // track 1 has no playlist yet
        h.controller
            .handle_event(SubtitleEvent::TrackSwitch { id: Some(1) });
        assert!(!h.controller.is_ticking());
        assert!(h.controller.tick().is_none());

        h.controller
            .handle_event(SubtitleEvent::TrackSwitch { id: Some(0) });
        assert!(h.controller.is_ticking());
        assert!(h.controller.tick().is_some());
    }

    #[test]
    fn test_playlist_for_inactive_track_is_ignored() {
        let mut h = harness(10, 5.0);
        h.controller.handle_event(SubtitleEvent::TrackLoaded {
            id: 1,
            details: vod(2, 5.0),
        });
        assert!(h.controller.track_details(1).is_none());
    }

    #[test]
    fn test_processing_failure_keeps_continuity_only() {
        let mut h = harness(10, 5.0);
        let (frag, _) = expect_fragment_load(h.controller.tick());
        process(&mut h, frag.clone(), false);

        assert_eq!(h.controller.state(), StreamState::Idle);
        assert_eq!(h.controller.previous_fragment(), Some(&frag));
        assert!(h.controller.buffered(0).unwrap().is_empty());
        assert_eq!(h.tracker.state(&frag), FragmentState::NotLoaded);
    }

    #[test]
    fn test_stale_processed_event_is_ignored() {
        let mut h = harness(10, 5.0);
        let (_frag, _) = expect_fragment_load(h.controller.tick());
        let other = h.controller.track_details(0).unwrap().fragments[5].clone();

        process(&mut h, other, true);

        assert_eq!(h.controller.state(), StreamState::FragLoading);
        assert!(h.controller.previous_fragment().is_none());
        assert!(h.controller.buffered(0).unwrap().is_empty());
    }

    #[test]
    fn test_load_error_aborts_and_returns_to_idle() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());

        // errors for other media types are not ours
        let mut main = frag.clone();
        main.kind = FragmentKind::Main;
        h.controller.handle_event(SubtitleEvent::Error {
            fragment: Some(main),
            details: ErrorDetails::FragLoadError,
            fatal: false,
        });
        assert!(!loader.is_aborted());
        assert_eq!(h.controller.state(), StreamState::FragLoading);

        h.controller.handle_event(SubtitleEvent::Error {
            fragment: Some(frag.clone()),
            details: ErrorDetails::FragLoadTimeout,
            fatal: false,
        });
        assert!(loader.is_aborted());
        assert_eq!(h.controller.state(), StreamState::Idle);
        assert!(h.controller.current_fragment().is_none());

        // next tick re-evaluates from the buffer state
        let (retry, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(retry.sn, frag.sn);
    }

    #[test]
    fn test_encrypted_flow_loads_key_then_decrypts() {
        let key = [0x5a; 16];
        let mut details = vod(4, 5.0);
        for frag in &mut details.fragments {
            frag.decrypt_data = Some(DecryptData::aes128("https://keys/sub.key", None));
        }
        let mut h = harness_with(SubtitleStreamConfig::default(), details);

        let key_frag = match h.controller.tick() {
            Some(SubtitleRequest::LoadKey { fragment, .. }) => fragment,
            other => panic!("expected key load, got {other:?}"),
        };
        assert_eq!(h.controller.state(), StreamState::KeyLoading);
        assert!(h.controller.tick().is_none());

        h.controller.handle_event(SubtitleEvent::KeyLoaded {
            fragment: key_frag,
            key: Bytes::copy_from_slice(&key),
        });
        assert_eq!(h.controller.state(), StreamState::Idle);

        let (frag, _) = expect_fragment_load(h.controller.tick());
        let iv = frag.decrypt_data.as_ref().unwrap().iv_for(frag.sn);
        let payload = Bytes::from(encrypt_data(b"WEBVTT", &key, &iv));

        let actions = h.controller.handle_event(SubtitleEvent::FragLoaded {
            fragment: frag.clone(),
            payload,
        });
        let job = match actions.into_iter().next() {
            Some(ControllerAction::Decrypt(job)) => job,
            other => panic!("expected decrypt job, got {other:?}"),
        };
        assert_eq!(job.key, key);
        assert_eq!(job.iv, iv);
        assert_eq!(h.tracker.state(&frag), FragmentState::Loaded);
        // decrypt completion is decoupled from the state machine
        assert_eq!(h.controller.state(), StreamState::FragLoading);

        let now = Instant::now();
        let actions = h.controller.handle_event(SubtitleEvent::FragDecrypted {
            fragment: frag,
            result: Ok(Bytes::from_static(b"WEBVTT")),
            stats: DecryptStats {
                started: now,
                finished: now,
            },
        });
        assert!(matches!(
            actions.as_slice(),
            [ControllerAction::Request(SubtitleRequest::FragmentDecrypted { payload, .. })]
                if payload.as_ref() == b"WEBVTT"
        ));
    }

    #[test]
    fn test_unencrypted_frag_loaded_needs_no_decrypt() {
        let mut h = harness(4, 5.0);
        let (frag, _) = expect_fragment_load(h.controller.tick());
        let actions = h.controller.handle_event(SubtitleEvent::FragLoaded {
            fragment: frag,
            payload: Bytes::from_static(b"WEBVTT"),
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_media_detaching_stops_and_clears() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());
        process(&mut h, frag, true);
        let (_next, next_loader) = expect_fragment_load(h.controller.tick());
        drop(loader);

        h.controller.handle_event(SubtitleEvent::MediaDetaching);

        assert_eq!(h.controller.state(), StreamState::Stopped);
        assert!(next_loader.is_aborted());
        assert!(h.controller.current_fragment().is_none());
        assert!(h.controller.previous_fragment().is_none());
        assert!(h.controller.buffered(0).unwrap().is_empty());
        assert!(!h.controller.is_ticking());
        assert!(h.tracker.is_empty());
        assert!(h.controller.tick().is_none());
        assert!(h.controller.handle_event(SubtitleEvent::Seeking).is_empty());
    }

    #[test]
    fn test_stop_and_start_load() {
        let mut h = harness(10, 5.0);
        h.controller.handle_event(SubtitleEvent::LevelUpdated {
            fragments: vec![Fragment::subtitle(0, 0, 7.0, 2.0)],
        });
        assert_eq!(h.controller.last_av_start(), 7.0);

        h.controller.handle_event(SubtitleEvent::StopLoad);
        assert_eq!(h.controller.state(), StreamState::Stopped);
        assert_eq!(h.controller.last_av_start(), 0.0);
        assert!(h.controller.tick().is_none());

        let fragment = expect_action_load(h.controller.handle_event(SubtitleEvent::StartLoad));
        assert_eq!(fragment.sn, 0);
        assert_eq!(h.controller.state(), StreamState::FragLoading);
    }

    #[test]
    fn test_start_load_before_playlist_waits_for_track_loaded() {
        let clock = Arc::new(SharedMediaClock::new(0.0));
        let mut controller = SubtitleStreamController::new(
            Arc::new(SubtitleStreamConfig::default()),
            Arc::new(FragmentStateTable::new()),
        );
        controller.handle_event(SubtitleEvent::MediaAttached { media: clock });
        controller.handle_event(SubtitleEvent::StopLoad);
        controller.handle_event(SubtitleEvent::TracksUpdated {
            tracks: vec![SubtitleTrack::new(0)],
        });
        controller.handle_event(SubtitleEvent::TrackSwitch { id: Some(0) });

        assert!(controller.handle_event(SubtitleEvent::StartLoad).is_empty());
        assert_eq!(controller.state(), StreamState::Stopped);

        controller.handle_event(SubtitleEvent::TrackLoaded {
            id: 0,
            details: vod(3, 4.0),
        });
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(controller.is_ticking());
        assert!(controller.tick().is_some());
    }

    #[test]
    fn test_live_playlist_aligned_to_primary_timeline() {
        let mut h = harness(0, 5.0);
        h.controller.handle_event(SubtitleEvent::LevelUpdated {
            fragments: vec![Fragment::subtitle(0, 100, 30.0, 6.0)],
        });

        let mut live = vod(3, 5.0);
        live.live = true;
        h.controller
            .handle_event(SubtitleEvent::TrackLoaded { id: 0, details: live });

        let starts: Vec<f64> = h
            .controller
            .track_details(0)
            .unwrap()
            .fragments
            .iter()
            .map(|f| f.start)
            .collect();
        assert_eq!(starts, vec![30.0, 35.0, 40.0]);
    }

    #[test]
    fn test_tracks_updated_resets_buffered_ranges() {
        let mut h = harness(10, 5.0);
        let (frag, _) = expect_fragment_load(h.controller.tick());
        process(&mut h, frag, true);
        assert_eq!(h.controller.buffered(0).unwrap().len(), 1);

        h.controller.handle_event(SubtitleEvent::TracksUpdated {
            tracks: vec![SubtitleTrack::new(0)],
        });
        assert!(h.controller.buffered(0).unwrap().is_empty());
        assert!(h.controller.track_details(0).is_none());
    }

    #[test]
    fn test_stop_during_fetch_releases_fragment() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());
        assert_eq!(h.tracker.state(&frag), FragmentState::Loading);

        h.controller.handle_event(SubtitleEvent::StopLoad);
        assert!(loader.is_aborted());
        assert_eq!(h.tracker.state(&frag), FragmentState::NotLoaded);

        let restarted = expect_action_load(h.controller.handle_event(SubtitleEvent::StartLoad));
        assert_eq!(restarted.sn, 0);
        assert_eq!(h.controller.state(), StreamState::FragLoading);
    }

    #[test]
    fn test_start_load_during_fetch_keeps_request() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());

        assert!(h.controller.handle_event(SubtitleEvent::StartLoad).is_empty());
        assert!(!loader.is_aborted());
        assert_eq!(h.controller.state(), StreamState::FragLoading);

        process(&mut h, frag.clone(), true);
        assert_eq!(h.tracker.state(&frag), FragmentState::Buffered);
        assert_eq!(
            h.controller.buffered(0).unwrap(),
            &[BufferedRange::new(0.0, 5.0)]
        );

        let (next, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(next.sn, 1);
    }

    #[test]
    fn test_media_reattach_during_fetch_keeps_request() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());

        h.controller.handle_event(SubtitleEvent::MediaAttached {
            media: Arc::new(SharedMediaClock::new(0.0)),
        });
        assert!(!loader.is_aborted());
        assert_eq!(h.controller.state(), StreamState::FragLoading);

        process(&mut h, frag, true);
        assert_eq!(h.controller.buffered(0).unwrap().len(), 1);
        assert_eq!(h.controller.state(), StreamState::Idle);
    }

    #[test]
    fn test_error_without_fragment_is_ignored() {
        let mut h = harness(10, 5.0);
        let (frag, loader) = expect_fragment_load(h.controller.tick());

        h.controller.handle_event(SubtitleEvent::Error {
            fragment: None,
            details: ErrorDetails::Other,
            fatal: false,
        });
        assert!(!loader.is_aborted());
        assert_eq!(h.controller.state(), StreamState::FragLoading);
        assert_eq!(h.tracker.state(&frag), FragmentState::Loading);

        process(&mut h, frag, true);
        assert_eq!(h.controller.previous_fragment().map(|f| f.sn), Some(0));
    }

    #[test]
    fn test_load_error_clears_fragment_references() {
        let mut h = harness(10, 5.0);
        let (first, _) = expect_fragment_load(h.controller.tick());
        process(&mut h, first.clone(), true);
        let (second, loader) = expect_fragment_load(h.controller.tick());

        h.controller.handle_event(SubtitleEvent::Error {
            fragment: Some(second.clone()),
            details: ErrorDetails::FragLoadError,
            fatal: false,
        });
        assert!(loader.is_aborted());
        assert!(h.controller.current_fragment().is_none());
        assert!(h.controller.previous_fragment().is_none());
        assert_eq!(h.tracker.state(&second), FragmentState::NotLoaded);
        assert_eq!(h.tracker.state(&first), FragmentState::Buffered);

        // buffer end still points at the failed fragment
        let (retry, _) = expect_fragment_load(h.controller.tick());
        assert_eq!(retry.sn, second.sn);
    }

    #[test]
    fn test_detach_forgets_delivered_keys() {
        let mut details = vod(4, 5.0);
        for frag in &mut details.fragments {
            frag.decrypt_data = Some(DecryptData::aes128("https://keys/sub.key", None));
        }
        let mut h = harness_with(SubtitleStreamConfig::default(), details);
        let key_frag = match h.controller.tick() {
            Some(SubtitleRequest::LoadKey { fragment, .. }) => fragment,
            other => panic!("expected key load, got {other:?}"),
        };
        h.controller.handle_event(SubtitleEvent::KeyLoaded {
            fragment: key_frag,
            key: Bytes::from_static(&[1; 16]),
        });

        h.controller.handle_event(SubtitleEvent::MediaDetaching);
        h.controller.handle_event(SubtitleEvent::MediaAttached {
            media: h.clock.clone(),
        });

        match h.controller.handle_event(SubtitleEvent::StartLoad).as_slice() {
            [ControllerAction::Request(SubtitleRequest::LoadKey { fragment, .. })] => {
                assert_eq!(fragment.sn, 0);
            }
            other => panic!("expected key load, got {other:?}"),
        }
    }
}
