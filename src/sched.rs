// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::select;
use tokio::sync::{watch, Notify};

use crate::error::WeftResult;
use crate::exec::{CancelFlag, TaskRunner};
use crate::proto::TaskSpec;
use crate::value::Value;

/// What the worker hands to the completion callback.
pub struct TaskOutcome {
    pub task_id: String,
    pub result: WeftResult<Value>,
    pub execution_time: Duration,
}

pub type TaskCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

struct Wrapper {
    task: TaskSpec,
    priority: i32,
    seq: u64,
    cancel: Arc<CancelFlag>,
    callback: Option<TaskCallback>,
}

impl PartialEq for Wrapper {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Wrapper {}

impl PartialOrd for Wrapper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wrapper {
    // Max-heap: higher priority first, then FIFO within a band.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    queue: BinaryHeap<Wrapper>,
    active: HashMap<String, Arc<CancelFlag>>,
    seq: u64,
    task_count: u64,
    completed_tasks: u64,
    cancelled_tasks: u64,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    runner: Arc<dyn TaskRunner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queue_size: usize,
    pub current_load: f64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub cancelled_tasks: u64,
    pub active_tasks: usize,
}

/// Single-worker scheduler draining a priority queue. Priorities are signed,
/// higher first, FIFO within a band; round-robin is the degenerate case of
/// everything at one priority.
///
/// Cancellation is cooperative and idempotent: the flag is re-checked
/// immediately before and after execution, a flagged task never invokes its
/// callback, and the evaluator polls the same flag so in-flight work stops
/// too.
pub struct RoundRobinScheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RoundRobinScheduler {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: BinaryHeap::new(),
                    active: HashMap::new(),
                    seq: 0,
                    task_count: 0,
                    completed_tasks: 0,
                    cancelled_tasks: 0,
                    running: false,
                }),
                notify: Notify::new(),
                runner,
            }),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
        }

        let shared = self.shared.clone();
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            worker_loop(shared, &mut shutdown).await;
        });

        info!("Round robin scheduler started");
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
        }

        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Unable to signal scheduler shutdown: {}", e);
        }
        info!("Round robin scheduler stopped");
    }

    /// Queue a task. The returned flag cancels it; `callback` fires exactly
    /// once unless the task is cancelled first.
    pub fn submit(&self, task: TaskSpec, callback: TaskCallback) -> Arc<CancelFlag> {
        let cancel = Arc::new(CancelFlag::new());
        let task_id = task.task_id.clone();
        let priority = task.priority;

        let mut state = self.shared.state.lock().unwrap();
        state.seq += 1;
        state.task_count += 1;
        let seq = state.seq;

        state.active.insert(task_id.clone(), cancel.clone());
        state.queue.push(Wrapper {
            task,
            priority,
            seq,
            cancel: cancel.clone(),
            callback: Some(callback),
        });
        drop(state);

        debug!("Task submitted (task = {}) (priority = {})", task_id, priority);
        self.shared.notify.notify_one();
        cancel
    }

    /// True iff the flag was newly set and the task had not yet completed.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let newly = match state.active.get(task_id) {
            Some(flag) => flag.cancel(),
            None => false,
        };
        if newly {
            state.cancelled_tasks += 1;
            info!("Task cancelled (task = {})", task_id);
        }
        newly
    }

    /// Load estimate: `min(0.95, queue_len * 0.1)`, zero when idle.
    pub fn load(&self) -> f64 {
        let state = self.shared.state.lock().unwrap();
        (state.queue.len() as f64 * 0.1).min(0.95)
    }

    /// Remove every pending task, in execution order, for resubmission into
    /// a different scheduler. Tasks already flagged cancelled are dropped.
    pub fn drain_pending(&self) -> Vec<(TaskSpec, TaskCallback)> {
        let mut state = self.shared.state.lock().unwrap();
        let mut drained = Vec::new();

        while let Some(mut wrapper) = state.queue.pop() {
            state.active.remove(&wrapper.task.task_id);
            if wrapper.cancel.is_cancelled() {
                continue;
            }
            if let Some(callback) = wrapper.callback.take() {
                drained.push((wrapper.task, callback));
            }
        }

        drained
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock().unwrap();
        SchedulerStats {
            queue_size: state.queue.len(),
            current_load: (state.queue.len() as f64 * 0.1).min(0.95),
            total_tasks: state.task_count,
            completed_tasks: state.completed_tasks,
            cancelled_tasks: state.cancelled_tasks,
            active_tasks: state.active.len(),
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, shutdown: &mut watch::Receiver<bool>) {
    loop {
        let wrapper = loop {
            if *shutdown.borrow() {
                return;
            }

            let popped = {
                let mut state = shared.state.lock().unwrap();
                state.queue.pop()
            };

            match popped {
                Some(w) => break w,
                None => {
                    select! {
                        _ = shared.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        };

        let mut wrapper = wrapper;
        let task_id = wrapper.task.task_id.clone();

        // Check immediately before execution.
        if wrapper.cancel.is_cancelled() {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            info!("Task was cancelled before execution (task = {})", task_id);
            continue;
        }

        debug!("Processing task (task = {}) (priority = {})", task_id, wrapper.priority);

        let started = Instant::now();
        let result = shared.runner.run(&wrapper.task, &wrapper.cancel).await;
        let execution_time = started.elapsed();

        // Check again after execution: a flagged task never invokes the
        // callback, even if it raced to completion.
        if wrapper.cancel.is_cancelled() {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            info!("Task was cancelled during execution (task = {})", task_id);
            continue;
        }

        {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            state.completed_tasks += 1;
        }

        match &result {
            Ok(_) => info!(
                "Task completed (task = {}) (elapsed = {:?})",
                task_id, execution_time
            ),
            Err(e) => warn!("Task failed (task = {}): {}", task_id, e),
        }

        if let Some(callback) = wrapper.callback.take() {
            callback(TaskOutcome {
                task_id,
                result,
                execution_time,
            });
        }
    }
}
