//! Background activation of cold spaces.
//!
//! Space ids needing sync queue up in arrival order; every tick activates at
//! most `max_concurrent − active` of them by warming the space cache. A warm
//! space participates in head exchange simply by being loaded (loading kicks
//! off the head-sync request). Spaces evicted from the cache leave the active
//! set on the next tick.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::space::NodeSpaceService;

/// Default bound on concurrently syncing spaces.
pub const DEFAULT_SIMULTANEOUS_SYNC: usize = 300;
/// Period of the activation tick.
pub const TICK_PERIOD: Duration = Duration::from_secs(10);

#[derive(Default)]
struct QueueState {
    /// Cold spaces awaiting activation, FIFO.
    space_queue: VecDeque<String>,
    /// Dedup set over `space_queue`.
    queued: HashSet<String>,
    /// Spaces currently active.
    sync_queue: HashSet<String>,
}

/// The hot-sync scheduler.
pub struct HotSync {
    service: Arc<NodeSpaceService>,
    max_concurrent: usize,
    state: Mutex<QueueState>,
    /// Activation found the space already warm (or failing).
    hit: Arc<AtomicU32>,
    /// Activation had to load the space.
    miss: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HotSync {
    pub fn new(
        service: Arc<NodeSpaceService>,
        max_concurrent: usize,
        hit: Arc<AtomicU32>,
        miss: Arc<AtomicU32>,
    ) -> Arc<Self> {
        let max_concurrent = if max_concurrent == 0 {
            DEFAULT_SIMULTANEOUS_SYNC
        } else {
            max_concurrent
        };
        Arc::new(HotSync {
            service,
            max_concurrent,
            state: Mutex::new(QueueState::default()),
            hit,
            miss,
            task: Mutex::new(None),
        })
    }

    /// Merges changed space ids into the tail of the queue, skipping ids
    /// already waiting.
    pub fn update_queue(&self, changed_ids: &[String]) {
        let mut state = self.state.lock();
        for id in changed_ids {
            if state.queued.insert(id.clone()) {
                state.space_queue.push_back(id.clone());
            }
        }
    }

    /// Queue lengths `(cold, active)`, for stats.
    pub fn queue_lens(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.space_queue.len(), state.sync_queue.len())
    }

    /// One activation round.
    pub async fn tick(&self) {
        let mut active: HashSet<String> = HashSet::new();
        self.service.cache().for_each(|id, _| {
            active.insert(id.to_string());
        });

        let batch: Vec<String> = {
            let mut state = self.state.lock();
            let before = state.sync_queue.len();
            state.sync_queue.retain(|id| active.contains(id));
            let removed = before - state.sync_queue.len();
            if removed > 0 {
                debug!(removed, "dropped evicted spaces from the active set");
            }

            let budget = self.max_concurrent.saturating_sub(state.sync_queue.len());
            let n = budget.min(state.space_queue.len());
            let mut batch = Vec::with_capacity(n);
            for _ in 0..n {
                if let Some(id) = state.space_queue.pop_front() {
                    state.queued.remove(&id);
                    batch.push(id);
                }
            }
            batch
        };

        for id in batch {
            match self.service.get_space(&id).await {
                Ok(_space) => {
                    self.miss.fetch_add(1, Ordering::Relaxed);
                    self.state.lock().sync_queue.insert(id);
                }
                Err(err) => {
                    debug!(%id, %err, "hot sync could not warm space");
                    self.hit.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Starts the periodic tick loop. Idempotent.
    pub fn run(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        }));
    }

    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HotSync {
    fn drop(&mut self) {
        self.close();
    }
}
