//! Registry of audio sources known to the remote service
//!
//! Filled from `audio-list` messages. Lookups of unknown ids log a warning at most
//! once per id per [`WARNING_INTERVAL`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// Minimum time between two warnings for the same unknown id
pub const WARNING_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
pub struct AudioList {
    audio_ids: RwLock<HashSet<String>>,
    /// Last time a warning was logged per unknown id
    invalid_ids: Mutex<HashMap<String, Instant>>,
}

impl AudioList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an audio source with the given id exists
    ///
    /// Logs a rate-limited warning when it does not.
    pub fn contains(&self, audio_id: &str) -> bool {
        if self.audio_ids.read().contains(audio_id) {
            return true;
        }
        if self.should_warn(audio_id, Instant::now()) {
            warn!(
                "Invalid identifier: audio '{}' is referenced by a region but does not exist",
                audio_id
            );
        }
        false
    }

    fn should_warn(&self, audio_id: &str, now: Instant) -> bool {
        let mut invalid = self.invalid_ids.lock();
        match invalid.get(audio_id) {
            Some(last) if now.duration_since(*last) < WARNING_INTERVAL => false,
            _ => {
                invalid.insert(audio_id.to_string(), now);
                true
            }
        }
    }

    /// Add audio ids, returns true if any were new
    pub fn add_all<I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let mut audio_ids = self.audio_ids.write();
        let mut invalid = self.invalid_ids.lock();
        let mut changed = false;
        for id in ids {
            invalid.remove(&id);
            changed |= audio_ids.insert(id);
        }
        changed
    }

    /// Remove audio ids, returns true if any were present
    pub fn remove_all<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut audio_ids = self.audio_ids.write();
        let mut changed = false;
        for id in ids {
            changed |= audio_ids.remove(id);
        }
        changed
    }

    pub fn clear(&self) {
        self.audio_ids.write().clear();
    }

    pub fn len(&self) -> usize {
        self.audio_ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.audio_ids.read().is_empty()
    }

    /// Sorted snapshot of all known ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.audio_ids.read().iter().cloned().collect();
        ids.sort();
        ids
    }
}
