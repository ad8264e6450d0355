//! In-memory world with wandering bots
//!
//! Stands in for a real game server when running the client standalone, and gives
//! tests a [`World`] whose players can be moved by hand.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;
use uuid::Uuid;

use super::{Location, PlayerState, World};
use crate::audio::rules::TICKS_PER_DAY;
use crate::EntityId;

#[derive(Default)]
struct SimState {
    players: HashMap<EntityId, Location>,
    bots: Vec<EntityId>,
    world_time: u64,
}

/// Simple [`World`] implementation
#[derive(Default)]
pub struct SimWorld {
    state: RwLock<SimState>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a player, replacing any previous location
    pub fn set_player(&self, id: EntityId, location: Location) {
        self.state.write().players.insert(id, location);
    }

    /// Take a player offline
    pub fn remove_player(&self, id: EntityId) -> bool {
        let mut state = self.state.write();
        state.bots.retain(|bot| *bot != id);
        state.players.remove(&id).is_some()
    }

    pub fn set_world_time(&self, ticks: u64) {
        self.state.write().world_time = ticks % TICKS_PER_DAY;
    }

    pub fn world_time(&self) -> u64 {
        self.state.read().world_time
    }

    pub fn player_count(&self) -> usize {
        self.state.read().players.len()
    }

    pub fn player_ids(&self) -> Vec<EntityId> {
        self.state.read().players.keys().copied().collect()
    }

    /// Spawn `count` bots at random positions within `spread` blocks of the origin
    pub fn spawn_bots(&self, count: usize, world: &str, spread: f64) -> Vec<EntityId> {
        let mut rng = rand::thread_rng();
        let mut state = self.state.write();
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let id = Uuid::new_v4();
            let location = Location::new(
                world,
                rng.gen_range(-spread..=spread),
                64.0,
                rng.gen_range(-spread..=spread),
            );
            state.players.insert(id, location);
            state.bots.push(id);
            spawned.push(id);
        }
        spawned
    }

    /// Advance world time by one tick and nudge every bot by up to `max_step` blocks
    pub fn step(&self, max_step: f64) {
        let mut rng = rand::thread_rng();
        let mut state = self.state.write();
        state.world_time = (state.world_time + 1) % TICKS_PER_DAY;
        let SimState { players, bots, .. } = &mut *state;
        for id in bots.iter() {
            if let Some(location) = players.get_mut(id) {
                location.x += rng.gen_range(-max_step..=max_step);
                location.z += rng.gen_range(-max_step..=max_step);
            }
        }
    }
}

impl World for SimWorld {
    fn player(&self, id: EntityId) -> Option<PlayerState> {
        let state = self.state.read();
        state.players.get(&id).map(|location| PlayerState {
            id,
            location: location.clone(),
            world_time: state.world_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_lookup() {
        let world = SimWorld::new();
        let id = Uuid::new_v4();
        assert!(world.player(id).is_none());

        world.set_player(id, Location::new("world", 1.0, 2.0, 3.0));
        world.set_world_time(15_000);
        let state = world.player(id).unwrap();
        assert_eq!(state.location, Location::new("world", 1.0, 2.0, 3.0));
        assert_eq!(state.world_time, 15_000);
        assert!(world.is_online(id));

        assert!(world.remove_player(id));
        assert!(!world.is_online(id));
    }

    #[test]
    fn test_bots_wander() {
        let world = SimWorld::new();
        let bots = world.spawn_bots(10, "world", 50.0);
        assert_eq!(bots.len(), 10);
        assert_eq!(world.player_count(), 10);

        for _ in 0..100 {
            world.step(1.0);
        }
        assert_eq!(world.world_time(), 100);
        for id in bots {
            let state = world.player(id).unwrap();
            assert!(state.location.x.abs() <= 150.0);
            assert_eq!(state.location.y, 64.0);
        }
    }
}
