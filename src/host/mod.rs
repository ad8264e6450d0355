//! Host collaborators
//!
//! The embedding game server provides periodic invocation ([`TickHost`]) and player
//! lookup ([`World`]). [`tick::TickLoop`] and [`sim::SimWorld`] are in-process
//! implementations used by the runner binary and by tests.

pub mod sim;
pub mod tick;

use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Handle of a task scheduled on a [`TickHost`]
pub type TaskId = u64;

/// Periodic task body
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// One-shot task body
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// The host's single-threaded tick loop
///
/// Tasks passed to `run_every` and `run_once` execute on the tick thread. Scheduling
/// and cancelling may be called from any thread, including from inside a running task.
pub trait TickHost: Send + Sync {
    /// Run `task` after `delay_ticks`, then every `period_ticks`
    fn run_every(&self, delay_ticks: u64, period_ticks: u64, task: RepeatingTask) -> TaskId;

    /// Run `task` once after `delay_ticks` (0 = next tick)
    fn run_once(&self, delay_ticks: u64, task: OnceTask) -> TaskId;

    /// Run `task` off the tick thread
    fn run_async(&self, task: OnceTask);

    /// Cancel a scheduled task; unknown ids are ignored
    fn cancel(&self, id: TaskId);
}

/// Live player data provided by the host
pub trait World: Send + Sync {
    /// Current state of an online player, `None` if the player is not online
    fn player(&self, id: EntityId) -> Option<PlayerState>;

    fn is_online(&self, id: EntityId) -> bool {
        self.player(id).is_some()
    }
}

/// Snapshot of an online player at the time of the lookup
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub id: EntityId,
    pub location: Location,
    /// Time of day of the player's world in ticks
    pub world_time: u64,
}

/// Raw position in a named world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// Discrete block cell containing this position
    pub fn block(&self) -> BlockPos {
        BlockPos {
            x: self.x.floor() as i32,
            y: self.y.floor() as i32,
            z: self.z.floor() as i32,
        }
    }

    /// Whether two locations fall into different block cells (or worlds)
    pub fn is_different_block(&self, other: &Location) -> bool {
        self.world != other.world || self.block() != other.block()
    }
}

/// Integer block coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}
