//! Per-player work scheduler
//!
//! Players are spread over `N = min(max_buckets, period)` buckets, each driven by its
//! own repeating host task with the same period. Bucket start times are displaced by
//! `period / N` ticks relative to each other so the per-player work of one period is
//! spread over the whole period instead of running in a single tick.
//!
//! A bucket is idle (no task, no players), starting (players but waiting to be phase
//! aligned by a running bucket) or running. Its task is cancelled as soon as its last
//! player leaves.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::host::{PlayerState, TaskId, TickHost, World};
use crate::EntityId;

/// Receives the players of a bucket once per period
pub trait PlayerDataWriter: Send + Sync {
    /// Called for every online player of the running bucket
    fn write_data(&self, player: &PlayerState);

    /// Called once after the bucket's players have been written
    fn flush_data(&self);

    /// Called when an enrolled player is no longer in the world and was dropped
    fn player_gone(&self, _id: EntityId) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("period must be at least 1 tick")]
    InvalidPeriod,
    #[error("max buckets must be at least 1")]
    InvalidBucketCount,
}

#[derive(Default)]
struct Bucket {
    players: Vec<EntityId>,
    task: Option<TaskId>,
}

struct SchedulerState {
    buckets: Vec<Bucket>,
    /// Bucket index of every enrolled player
    locations: HashMap<EntityId, usize>,
    /// Buckets with players that wait for a running bucket to align them
    starting: BTreeSet<usize>,
}

pub struct PlayerScheduler {
    host: Arc<dyn TickHost>,
    world: Arc<dyn World>,
    writer: Arc<dyn PlayerDataWriter>,
    period: u64,
    displacement: u64,
    state: Mutex<SchedulerState>,
    this: Weak<PlayerScheduler>,
}

impl PlayerScheduler {
    pub fn new(
        host: Arc<dyn TickHost>,
        world: Arc<dyn World>,
        writer: Arc<dyn PlayerDataWriter>,
        period: u64,
        max_buckets: usize,
    ) -> Result<Arc<Self>, SchedulerError> {
        if period == 0 {
            return Err(SchedulerError::InvalidPeriod);
        }
        if max_buckets == 0 {
            return Err(SchedulerError::InvalidBucketCount);
        }
        let bucket_count = max_buckets.min(usize::try_from(period).unwrap_or(usize::MAX));
        let displacement = period / bucket_count as u64;

        Ok(Arc::new_cyclic(|this| Self {
            host,
            world,
            writer,
            period,
            displacement,
            state: Mutex::new(SchedulerState {
                buckets: (0..bucket_count).map(|_| Bucket::default()).collect(),
                locations: HashMap::new(),
                starting: BTreeSet::new(),
            }),
            this: this.clone(),
        }))
    }

    pub fn bucket_count(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Ticks between the phases of two neighbouring buckets
    pub fn displacement(&self) -> u64 {
        self.displacement
    }

    /// Enrol a player, returns false if it already is
    pub fn add_player(&self, id: EntityId) -> bool {
        let mut state = self.state.lock();
        if state.locations.contains_key(&id) {
            return false;
        }

        let Some(index) = state
            .buckets
            .iter()
            .enumerate()
            .min_by_key(|(_, bucket)| bucket.players.len())
            .map(|(index, _)| index)
        else {
            return false;
        };

        state.buckets[index].players.push(id);
        state.locations.insert(id, index);

        if state.buckets[index].task.is_some() || state.starting.contains(&index) {
            return true;
        }

        if state.buckets.iter().any(|bucket| bucket.task.is_some()) {
            trace!("Bucket {} waits for phase alignment", index);
            state.starting.insert(index);
        } else {
            state.starting.insert(index);
            self.start_pending_from(&mut state, index);
        }
        true
    }

    /// Remove a player from its bucket, returns false if it was not enrolled
    pub fn remove_player(&self, id: EntityId) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.locations.remove(&id) else {
            return false;
        };
        state.buckets[index].players.retain(|player| *player != id);
        self.check_cancel(&mut state, index);
        true
    }

    /// Remove every player and cancel every bucket task
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for bucket in &mut state.buckets {
            bucket.players.clear();
            if let Some(task) = bucket.task.take() {
                self.host.cancel(task);
            }
        }
        state.locations.clear();
        state.starting.clear();
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.state.lock().locations.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.state.lock().buckets.iter().map(|b| b.players.len()).collect()
    }

    /// Number of buckets with an active host task
    pub fn running_buckets(&self) -> usize {
        self.state.lock().buckets.iter().filter(|b| b.task.is_some()).count()
    }

    fn check_cancel(&self, state: &mut SchedulerState, index: usize) {
        if !state.buckets[index].players.is_empty() {
            return;
        }
        state.starting.remove(&index);
        let Some(task) = state.buckets[index].task.take() else {
            return;
        };
        self.host.cancel(task);
        debug!("Bucket {} is empty, stopped", index);

        // Nothing left to align the waiting buckets, start them relative to the first
        if !state.starting.is_empty() && state.buckets.iter().all(|b| b.task.is_none()) {
            if let Some(&first) = state.starting.iter().next() {
                self.start_pending_from(state, first);
            }
        }
    }

    /// Start every waiting bucket, phased relative to `reference`
    ///
    /// A waiting `reference` itself starts on the next tick.
    fn start_pending_from(&self, state: &mut SchedulerState, reference: usize) {
        let count = state.buckets.len();
        let pending: Vec<usize> = std::mem::take(&mut state.starting).into_iter().collect();
        for index in pending {
            let delta = (index + count - reference) % count;
            let delay = delta as u64 * self.displacement;
            let this = self.this.clone();
            let task = self.host.run_every(
                delay,
                self.period,
                Box::new(move || {
                    if let Some(scheduler) = this.upgrade() {
                        scheduler.run_bucket(index);
                    }
                }),
            );
            debug!("Bucket {} started with a delay of {} ticks", index, delay);
            state.buckets[index].task = Some(task);
        }
    }

    fn run_bucket(&self, index: usize) {
        let players = {
            let mut state = self.state.lock();
            if state.buckets[index].task.is_none() {
                return;
            }
            if !state.starting.is_empty() {
                self.start_pending_from(&mut state, index);
            }
            state.buckets[index].players.clone()
        };

        let mut written = 0;
        for id in players {
            match self.world.player(id) {
                Some(player) => {
                    self.writer.write_data(&player);
                    written += 1;
                }
                None => {
                    trace!("Player {} is gone, removing from bucket {}", id, index);
                    if self.remove_player(id) {
                        self.writer.player_gone(id);
                    }
                }
            }
        }

        if written > 0 {
            self.writer.flush_data();
        }
    }
}
