//! Deterministic tick loop
//!
//! Tasks are executed by whoever calls [`TickLoop::tick`]: a test advancing time by
//! hand, or the driver thread started by [`TickLoop::spawn_driver`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{OnceTask, RepeatingTask, TaskId, TickHost};

enum Body {
    Repeating(RepeatingTask),
    Once(OnceTask),
}

struct Scheduled {
    next_run: u64,
    period: u64,
    body: Body,
}

#[derive(Default)]
struct LoopState {
    tick: u64,
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Scheduled>,
    /// Tasks taken out of `tasks` for the tick being executed
    in_flight: HashSet<TaskId>,
    /// In-flight tasks cancelled while the tick was running
    cancelled: HashSet<TaskId>,
}

impl LoopState {
    fn insert(&mut self, delay_ticks: u64, period: u64, body: Body) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            Scheduled {
                next_run: self.tick + delay_ticks,
                period,
                body,
            },
        );
        id
    }
}

/// Single-threaded tick loop implementing [`TickHost`]
#[derive(Default)]
pub struct TickLoop {
    state: Mutex<LoopState>,
}

impl TickLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last executed tick
    pub fn current_tick(&self) -> u64 {
        self.state.lock().tick
    }

    /// Number of scheduled tasks (including ones executing right now)
    pub fn task_count(&self) -> usize {
        let state = self.state.lock();
        state.tasks.len() + state.in_flight.len()
    }

    /// Execute one tick, returns the number of tasks run
    pub fn tick(&self) -> usize {
        let (tick, mut due) = {
            let mut state = self.state.lock();
            state.tick += 1;
            let tick = state.tick;
            let due_ids: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, task)| task.next_run <= tick)
                .map(|(id, _)| *id)
                .collect();
            let mut due = Vec::with_capacity(due_ids.len());
            for id in due_ids {
                if let Some(task) = state.tasks.remove(&id) {
                    state.in_flight.insert(id);
                    due.push((id, task));
                }
            }
            (tick, due)
        };

        due.sort_by_key(|(id, task)| (task.next_run, *id));

        let mut executed = 0;
        for (id, mut task) in due {
            if self.take_cancelled(id) {
                continue;
            }
            executed += 1;
            match task.body {
                Body::Once(body) => {
                    body();
                    let mut state = self.state.lock();
                    state.in_flight.remove(&id);
                    state.cancelled.remove(&id);
                }
                Body::Repeating(ref mut body) => {
                    body();
                    let mut state = self.state.lock();
                    state.in_flight.remove(&id);
                    if !state.cancelled.remove(&id) {
                        task.next_run = tick + task.period;
                        state.tasks.insert(id, task);
                    }
                }
            }
        }
        executed
    }

    /// Execute `ticks` ticks
    pub fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    fn take_cancelled(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        if state.cancelled.remove(&id) {
            state.in_flight.remove(&id);
            true
        } else {
            false
        }
    }

    /// Drive the loop from a dedicated thread at a fixed rate
    pub fn spawn_driver(self: &Arc<Self>, ticks_per_second: u32) -> TickDriver {
        let stop = Arc::new(AtomicBool::new(false));
        let tick_loop = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let period = Duration::from_secs(1) / ticks_per_second.max(1);

        let handle = std::thread::Builder::new()
            .name("tick-loop".to_string())
            .spawn(move || {
                let mut next = Instant::now();
                while !stop_flag.load(Ordering::Acquire) {
                    tick_loop.tick();
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else if now - next > period * 20 {
                        warn!("Tick loop is running {:?} behind, skipping ahead", now - next);
                        next = now;
                    }
                }
                debug!("Tick loop driver stopped");
            });

        TickDriver {
            stop,
            handle: handle.ok(),
        }
    }
}

impl TickHost for TickLoop {
    fn run_every(&self, delay_ticks: u64, period_ticks: u64, task: RepeatingTask) -> TaskId {
        self.state
            .lock()
            .insert(delay_ticks, period_ticks.max(1), Body::Repeating(task))
    }

    fn run_once(&self, delay_ticks: u64, task: OnceTask) -> TaskId {
        self.state.lock().insert(delay_ticks, 1, Body::Once(task))
    }

    fn run_async(&self, task: OnceTask) {
        std::thread::spawn(task);
    }

    fn cancel(&self, id: TaskId) {
        let mut state = self.state.lock();
        if state.tasks.remove(&id).is_none() && state.in_flight.contains(&id) {
            state.cancelled.insert(id);
        }
    }
}

/// Handle to a running tick driver thread
pub struct TickDriver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    /// Stop the driver and wait for the current tick to finish
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
