//! Audio resolution engine
//!
//! Turns the regions applying to a player's position into per-track audio state and
//! emits an `audio` message for every track whose state differs from the last pass.
//!
//! Reduction runs over the world's global region followed by the applicable regions.
//! Audio and delay rules are reduced independently: a region with a higher priority
//! than the best seen so far replaces everything collected for that facet, an equal
//! priority adds to it and a lower one is ignored. Audio ids merge within a tier,
//! delay ranges do not (the first range per track wins).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::list::AudioList;
use super::rules::DelayRange;
use crate::config::{ClientConfig, ConfigError};
use crate::host::{Location, PlayerState};
use crate::metrics::Metrics;
use crate::net::protocol::{AudioMessage, Message};
use crate::regions::RegionService;
use crate::EntityId;

/// Resolved audio state of a player, keyed by track id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackState {
    pub audio: BTreeMap<String, BTreeSet<String>>,
    pub delay: BTreeMap<String, DelayRange>,
}

/// Cached result of the last pass for one player
///
/// Track keys stay in the maps once written, with an empty value when nothing applies
/// anymore, so the next pass still sees the track.
#[derive(Debug, Default)]
struct TrackingSnapshot {
    last_checked: Option<Instant>,
    location: Option<Location>,
    audio: BTreeMap<String, BTreeSet<String>>,
    delay: BTreeMap<String, Option<DelayRange>>,
}

pub struct AudioTracker {
    tracks: BTreeSet<String>,
    default_track: String,
    check_delay: Duration,
    regions: Arc<dyn RegionService>,
    audio_list: Arc<AudioList>,
    metrics: Arc<Metrics>,
    snapshots: Mutex<HashMap<EntityId, TrackingSnapshot>>,
    /// Messages produced during the current scheduler cycle
    buffer: Mutex<Vec<Message>>,
}

impl AudioTracker {
    pub fn new(
        config: &ClientConfig,
        regions: Arc<dyn RegionService>,
        audio_list: Arc<AudioList>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        let default_track = config
            .default_track_id()
            .ok_or_else(|| ConfigError::Invalid("at least one audio track must be configured".to_string()))?
            .to_string();
        Ok(Self {
            tracks: config.audio_tracks.keys().cloned().collect(),
            default_track,
            check_delay: config.check_delay(),
            regions,
            audio_list,
            metrics,
            snapshots: Mutex::new(HashMap::new()),
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn default_track(&self) -> &str {
        &self.default_track
    }

    /// Periodic pass for one player, buffering the changed tracks
    ///
    /// Skipped while the check delay since the last emitting pass has not elapsed, or
    /// while the player stays inside the same block.
    pub fn write_data(&self, player: &PlayerState) {
        let mut buffer = self.buffer.lock();
        self.write_data_at(player, Instant::now(), &mut buffer);
    }

    fn write_data_at(&self, player: &PlayerState, now: Instant, out: &mut Vec<Message>) -> usize {
        let mut snapshots = self.snapshots.lock();
        let snapshot = snapshots.entry(player.id).or_default();

        if let Some(last) = snapshot.last_checked {
            if last + self.check_delay > now {
                return 0;
            }
        }
        if let Some(previous) = &snapshot.location {
            if !previous.is_different_block(&player.location) {
                return 0;
            }
        }

        let written = self.write_changes(player, snapshot, false, out);
        if written > 0 {
            snapshot.last_checked = Some(now);
        }
        snapshot.location = Some(player.location.clone());
        written
    }

    /// Forced pass sending the full state of every known track
    pub fn write_audio_messages(&self, player: &PlayerState, out: &mut Vec<Message>) -> usize {
        let mut snapshots = self.snapshots.lock();
        let snapshot = snapshots.entry(player.id).or_default();
        if snapshot.location.is_none() {
            snapshot.location = Some(player.location.clone());
        }
        self.write_changes(player, snapshot, true, out)
    }

    /// Take the messages buffered by [`write_data`](Self::write_data)
    pub fn drain_buffer(&self) -> Vec<Message> {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Drop the snapshot of a player that is no longer tracked
    pub fn forget(&self, id: EntityId) -> bool {
        self.snapshots.lock().remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.snapshots.lock().clear();
        self.buffer.lock().clear();
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Reduce the regions at the player's position to per-track state
    pub fn resolve(&self, player: &PlayerState) -> TrackState {
        let world = player.location.world.as_str();
        let global = self.regions.global_region(world);
        let applicable = self.regions.applicable_regions(world, player.location.block());

        let mut state = TrackState::default();
        let mut audio_priority = 0;
        let mut delay_priority = 0;

        for region in global.iter().chain(applicable.iter()) {
            if let Some(rules) = &region.audio {
                if region.priority >= audio_priority {
                    if region.priority > audio_priority {
                        audio_priority = region.priority;
                        state.audio.clear();
                    }
                    for rule in rules {
                        if rule.active_at(player.world_time) && self.audio_list.contains(&rule.audio_id) {
                            let track = rule.track_id.as_deref().unwrap_or(&self.default_track);
                            state
                                .audio
                                .entry(track.to_string())
                                .or_default()
                                .insert(rule.audio_id.clone());
                        }
                    }
                }
            }

            if let Some(rules) = &region.delay {
                if region.priority >= delay_priority {
                    if region.priority > delay_priority {
                        delay_priority = region.priority;
                        state.delay.clear();
                    }
                    for rule in rules {
                        let track = rule.track_id.as_deref().unwrap_or(&self.default_track);
                        state.delay.entry(track.to_string()).or_insert(rule.range);
                    }
                }
            }
        }
        state
    }

    fn write_changes(
        &self,
        player: &PlayerState,
        snapshot: &mut TrackingSnapshot,
        ignore_equals: bool,
        out: &mut Vec<Message>,
    ) -> usize {
        let started = Instant::now();
        let state = self.resolve(player);

        let track_ids: BTreeSet<String> = state
            .audio
            .keys()
            .chain(state.delay.keys())
            .chain(snapshot.audio.keys())
            .chain(snapshot.delay.keys())
            .cloned()
            .collect();

        let empty = BTreeSet::new();
        let mut written = 0;
        for track in &track_ids {
            if !self.tracks.contains(track) {
                continue;
            }
            let audio_ids = state.audio.get(track).unwrap_or(&empty);
            let previous_ids = snapshot.audio.get(track).unwrap_or(&empty);
            let delay = state.delay.get(track).copied();
            let previous_delay = snapshot.delay.get(track).copied().flatten();
            if !ignore_equals && audio_ids == previous_ids && delay == previous_delay {
                continue;
            }

            out.push(Message::Audio(AudioMessage {
                id: player.id,
                track: Some(track.clone()),
                audio_ids: Some(audio_ids.iter().cloned().collect()),
                delay_range: delay,
            }));
            written += 1;
        }

        for track in track_ids {
            let audio_ids = state.audio.get(&track).cloned().unwrap_or_default();
            let delay = state.delay.get(&track).copied();
            snapshot.audio.insert(track.clone(), audio_ids);
            snapshot.delay.insert(track, delay);
        }

        if written > 0 {
            debug!("Resolved {} changed tracks for player {}", written, player.id);
        }
        self.metrics.record_pass(started.elapsed(), written);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::rules::{AudioRule, DayTime, DelayRule};
    use crate::config::TrackSettings;
    use crate::regions::{LinearRegionIndex, Region, GLOBAL_REGION_ID};
    use crate::host::BlockPos;
    use uuid::Uuid;

    fn config(tracks: &[&str]) -> ClientConfig {
        let mut config = ClientConfig::default();
        for track in tracks {
            config.audio_tracks.insert(track.to_string(), TrackSettings::default());
        }
        config
    }

    fn region(id: &str, priority: i32, min: i32, max: i32) -> Region {
        Region {
            id: id.to_string(),
            world: "world".to_string(),
            min: BlockPos::new(min, 0, min),
            max: BlockPos::new(max, 255, max),
            priority,
            audio: None,
            delay: None,
        }
    }

    fn tracker(tracks: &[&str], regions: Vec<Region>, known: &[&str]) -> AudioTracker {
        let list = Arc::new(AudioList::new());
        list.add_all(known.iter().map(|s| s.to_string()));
        AudioTracker::new(
            &config(tracks),
            Arc::new(LinearRegionIndex::new(regions)),
            list,
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    fn player(id: EntityId, x: f64, z: f64) -> PlayerState {
        PlayerState {
            id,
            location: Location::new("world", x, 64.0, z),
            world_time: 1_000,
        }
    }

    fn audio(message: &Message) -> &AudioMessage {
        match message {
            Message::Audio(audio) => audio,
            other => panic!("Expected audio message, got {other:?}"),
        }
    }

    fn ids(message: &Message) -> Vec<&str> {
        audio(message)
            .audio_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_global_then_higher_priority_region() {
        let mut global = region(GLOBAL_REGION_ID, 1, 0, 0);
        global.audio = Some(vec![AudioRule::new("forest")]);
        let mut cave = region("cave", 5, 100, 200);
        cave.audio = Some(vec![AudioRule::new("cave")]);
        let tracker = tracker(&["default"], vec![global, cave], &["forest", "cave"]);

        let id = Uuid::new_v4();
        let mut out = Vec::new();
        assert_eq!(tracker.write_audio_messages(&player(id, 0.0, 0.0), &mut out), 1);
        assert_eq!(audio(&out[0]).track.as_deref(), Some("default"));
        assert_eq!(ids(&out[0]), vec!["forest"]);

        out.clear();
        let now = Instant::now();
        assert_eq!(tracker.write_data_at(&player(id, 150.0, 150.0), now, &mut out), 1);
        assert_eq!(ids(&out[0]), vec!["cave"]);
    }

    #[test]
    fn test_equal_priority_merges_audio() {
        let mut a = region("a", 3, 0, 50);
        a.audio = Some(vec![AudioRule::new("birds")]);
        let mut b = region("b", 3, 25, 75);
        b.audio = Some(vec![AudioRule::new("river")]);
        let tracker = tracker(&["default"], vec![a, b], &["birds", "river"]);

        let state = tracker.resolve(&player(Uuid::new_v4(), 30.0, 30.0));
        let merged: Vec<&str> = state.audio["default"].iter().map(String::as_str).collect();
        assert_eq!(merged, vec!["birds", "river"]);
    }

    #[test]
    fn test_unequal_priority_keeps_highest() {
        let mut low = region("low", 2, 0, 50);
        low.audio = Some(vec![AudioRule::new("birds")]);
        let mut high = region("high", 4, 25, 75);
        high.audio = Some(vec![AudioRule::new("river")]);
        let tracker = tracker(&["default"], vec![low, high], &["birds", "river"]);

        let state = tracker.resolve(&player(Uuid::new_v4(), 30.0, 30.0));
        assert_eq!(state.audio["default"].len(), 1);
        assert!(state.audio["default"].contains("river"));
    }

    #[test]
    fn test_negative_priority_never_applies() {
        let mut below = region("below", -1, 0, 50);
        below.audio = Some(vec![AudioRule::new("birds")]);
        let tracker = tracker(&["default"], vec![below], &["birds"]);
        assert!(tracker.resolve(&player(Uuid::new_v4(), 1.0, 1.0)).audio.is_empty());
    }

    #[test]
    fn test_region_without_flag_does_not_clear() {
        let mut base = region("base", 1, 0, 50);
        base.audio = Some(vec![AudioRule::new("birds")]);
        let silent = region("silent", 9, 0, 50);
        let tracker = tracker(&["default"], vec![base, silent], &["birds"]);
        assert_eq!(tracker.resolve(&player(Uuid::new_v4(), 1.0, 1.0)).audio["default"].len(), 1);
    }

    #[test]
    fn test_delay_first_wins_within_tier() {
        let mut a = region("a", 2, 0, 50);
        a.delay = Some(vec![DelayRule::new(DelayRange { min: 1, max: 2 })]);
        let mut b = region("b", 2, 0, 50);
        b.delay = Some(vec![DelayRule::new(DelayRange { min: 8, max: 9 })]);
        let mut c = region("c", 1, 0, 50);
        c.delay = Some(vec![DelayRule::new(DelayRange { min: 5, max: 5 }).on_track("music")]);
        let tracker = tracker(&["default", "music"], vec![a, b, c], &[]);

        let state = tracker.resolve(&player(Uuid::new_v4(), 1.0, 1.0));
        // Regions are visited by priority then id, so "a" comes first
        assert_eq!(state.delay.get("default"), Some(&DelayRange { min: 1, max: 2 }));
        assert!(!state.delay.contains_key("music"));
    }

    #[test]
    fn test_day_time_and_unknown_ids_filtered() {
        let mut forest = region("forest", 1, 0, 50);
        forest.audio = Some(vec![
            AudioRule::new("owls").during(DayTime::Night),
            AudioRule::new("birds").during(DayTime::Day),
            AudioRule::new("ghost"),
        ]);
        let tracker = tracker(&["default"], vec![forest], &["owls", "birds"]);

        let mut state = player(Uuid::new_v4(), 1.0, 1.0);
        let day = tracker.resolve(&state);
        assert_eq!(day.audio["default"].iter().collect::<Vec<_>>(), vec!["birds"]);

        state.world_time = 14_000;
        let night = tracker.resolve(&state);
        assert_eq!(night.audio["default"].iter().collect::<Vec<_>>(), vec!["owls"]);
    }

    #[test]
    fn test_unregistered_tracks_skipped() {
        let mut forest = region("forest", 1, 0, 50);
        forest.audio = Some(vec![AudioRule::new("birds"), AudioRule::new("rain").on_track("weather")]);
        let tracker = tracker(&["default"], vec![forest], &["birds", "rain"]);

        let mut out = Vec::new();
        tracker.write_audio_messages(&player(Uuid::new_v4(), 1.0, 1.0), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(audio(&out[0]).track.as_deref(), Some("default"));
    }

    #[test]
    fn test_diff_suppression() {
        let mut forest = region("forest", 1, 0, 50);
        forest.audio = Some(vec![AudioRule::new("birds")]);
        forest.delay = Some(vec![DelayRule::new(DelayRange { min: 2, max: 4 })]);
        let tracker = tracker(&["default"], vec![forest], &["birds"]);
        let id = Uuid::new_v4();
        let state = player(id, 1.0, 1.0);

        let mut out = Vec::new();
        let mut snapshots = tracker.snapshots.lock();
        let snapshot = snapshots.entry(id).or_default();
        assert_eq!(tracker.write_changes(&state, snapshot, false, &mut out), 1);
        assert_eq!(audio(&out[0]).delay_range, Some(DelayRange { min: 2, max: 4 }));
        assert_eq!(tracker.write_changes(&state, snapshot, false, &mut out), 0);
        assert_eq!(tracker.write_changes(&state, snapshot, true, &mut out), 1);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_leaving_region_sends_empty_state() {
        let mut forest = region("forest", 1, 0, 10);
        forest.audio = Some(vec![AudioRule::new("birds")]);
        let tracker = tracker(&["default"], vec![forest], &["birds"]);
        let id = Uuid::new_v4();
        let start = Instant::now();

        let mut out = Vec::new();
        assert_eq!(tracker.write_data_at(&player(id, 5.0, 5.0), start, &mut out), 1);
        let later = start + Duration::from_secs(4);
        assert_eq!(tracker.write_data_at(&player(id, 20.0, 20.0), later, &mut out), 1);
        assert!(ids(&out[1]).is_empty());
        assert!(audio(&out[1]).audio_ids.is_some());

        // The emptied track is still known and is part of a forced pass
        let mut forced = Vec::new();
        assert_eq!(tracker.write_audio_messages(&player(id, 20.0, 20.0), &mut forced), 1);
        let later = later + Duration::from_secs(4);
        assert_eq!(tracker.write_data_at(&player(id, 30.0, 30.0), later, &mut out), 0);
    }

    #[test]
    fn test_gating() {
        let mut forest = region("forest", 1, 0, 10);
        forest.audio = Some(vec![AudioRule::new("birds")]);
        let tracker = tracker(&["default"], vec![forest], &["birds"]);
        let id = Uuid::new_v4();
        let start = Instant::now();
        let mut out = Vec::new();

        assert_eq!(tracker.write_data_at(&player(id, 5.0, 5.0), start, &mut out), 1);
        // Inside the check delay nothing is evaluated, even when leaving the region
        let soon = start + Duration::from_millis(500);
        assert_eq!(tracker.write_data_at(&player(id, 50.0, 50.0), soon, &mut out), 0);
        // Same block after the delay
        let later = start + Duration::from_secs(5);
        assert_eq!(tracker.write_data_at(&player(id, 5.5, 5.5), later, &mut out), 0);
        // Different block after the delay
        assert_eq!(tracker.write_data_at(&player(id, 50.0, 50.0), later, &mut out), 1);
    }

    #[test]
    fn test_no_emission_keeps_timestamp_unset() {
        let tracker = tracker(&["default"], vec![], &[]);
        let id = Uuid::new_v4();
        let start = Instant::now();
        let mut out = Vec::new();
        assert_eq!(tracker.write_data_at(&player(id, 1.0, 1.0), start, &mut out), 0);
        assert!(tracker.snapshots.lock()[&id].last_checked.is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn test_buffer_and_forget() {
        let mut global = region(GLOBAL_REGION_ID, 0, 0, 0);
        global.audio = Some(vec![AudioRule::new("wind")]);
        let tracker = tracker(&["default"], vec![global], &["wind"]);
        let id = Uuid::new_v4();

        tracker.write_data(&player(id, 1.0, 1.0));
        assert_eq!(tracker.drain_buffer().len(), 1);
        assert!(tracker.drain_buffer().is_empty());
        assert_eq!(tracker.snapshot_count(), 1);
        assert!(tracker.forget(id));
        assert_eq!(tracker.snapshot_count(), 0);
    }
}
