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

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::select;
use tokio::sync::{watch, Notify};

use crate::error::WeftError;
use crate::exec::{CancelFlag, TaskRunner};
use crate::proto::TaskSpec;
use crate::sched::{TaskCallback, TaskOutcome};

const DEFAULT_BURST_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingAlgorithm {
    /// First come, first served.
    Fcfs,
    /// Shortest job first, by estimated burst.
    Sjf,
    /// Highest priority first.
    Priority,
    /// Round robin; identical to FCFS for non-preemptive execution.
    Rr,
}

impl FromStr for SchedulingAlgorithm {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FCFS" => Ok(SchedulingAlgorithm::Fcfs),
            "SJF" => Ok(SchedulingAlgorithm::Sjf),
            "PRIORITY" => Ok(SchedulingAlgorithm::Priority),
            "RR" => Ok(SchedulingAlgorithm::Rr),
            other => Err(WeftError::Validation(format!(
                "unknown scheduling algorithm: {}",
                other
            ))),
        }
    }
}

struct Entry {
    task: TaskSpec,
    callback: Option<TaskCallback>,
    cancel: Arc<CancelFlag>,
    seq: u64,
    arrival: Instant,
    burst: f64,
    priority: i32,
}

struct State {
    pending: Vec<Entry>,
    active: HashMap<String, Arc<CancelFlag>>,
    algorithm: SchedulingAlgorithm,
    seq: u64,
    running: bool,

    total_processes: u64,
    completed: u64,
    total_waiting: f64,
    total_turnaround: f64,
    first_arrival: Option<Instant>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    runner: Arc<dyn TaskRunner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedSchedulerStats {
    pub algorithm: SchedulingAlgorithm,
    pub total_processes: u64,
    pub completed_processes: u64,
    pub queue_size: usize,
    pub average_waiting_time: f64,
    pub average_turnaround_time: f64,
    pub throughput: f64,
}

/// Scheduler with a swappable dispatch order. The pending list is re-sorted
/// on every insert and on algorithm changes; the sorts are stable, so equal
/// keys preserve arrival order.
///
/// For every completion: turnaround = completion − arrival, waiting =
/// turnaround − burst, both folded into fleet averages, with throughput
/// measured from the first arrival.
pub struct AdvancedScheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

fn resort(pending: &mut Vec<Entry>, algorithm: SchedulingAlgorithm) {
    match algorithm {
        SchedulingAlgorithm::Fcfs | SchedulingAlgorithm::Rr => {
            pending.sort_by_key(|e| e.seq)
        }
        SchedulingAlgorithm::Sjf => {
            pending.sort_by(|a, b| {
                a.burst
                    .partial_cmp(&b.burst)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        SchedulingAlgorithm::Priority => {
            pending.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }
}

impl AdvancedScheduler {
    pub fn new(algorithm: SchedulingAlgorithm, runner: Arc<dyn TaskRunner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: Vec::new(),
                    active: HashMap::new(),
                    algorithm,
                    seq: 0,
                    running: false,
                    total_processes: 0,
                    completed: 0,
                    total_waiting: 0.0,
                    total_turnaround: 0.0,
                    first_arrival: None,
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

        let algorithm = self.shared.state.lock().unwrap().algorithm;
        info!("Advanced scheduler started (algorithm = {:?})", algorithm);
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
        info!("Advanced scheduler stopped");
    }

    pub fn submit(&self, task: TaskSpec, callback: TaskCallback) -> Arc<CancelFlag> {
        let cancel = Arc::new(CancelFlag::new());
        let now = Instant::now();

        let mut state = self.shared.state.lock().unwrap();
        state.seq += 1;
        state.total_processes += 1;
        if state.first_arrival.is_none() {
            state.first_arrival = Some(now);
        }

        let entry = Entry {
            priority: task.priority,
            burst: task.estimated_burst.unwrap_or(DEFAULT_BURST_SECS),
            seq: state.seq,
            arrival: now,
            cancel: cancel.clone(),
            callback: Some(callback),
            task,
        };

        state.active.insert(entry.task.task_id.clone(), cancel.clone());
        state.pending.push(entry);
        let algorithm = state.algorithm;
        resort(&mut state.pending, algorithm);
        drop(state);

        self.shared.notify.notify_one();
        cancel
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        let state = self.shared.state.lock().unwrap();
        match state.active.get(task_id) {
            Some(flag) => flag.cancel(),
            None => false,
        }
    }

    pub fn set_algorithm(&self, algorithm: SchedulingAlgorithm) {
        let mut state = self.shared.state.lock().unwrap();
        state.algorithm = algorithm;
        resort(&mut state.pending, algorithm);
        info!("Scheduling algorithm changed (algorithm = {:?})", algorithm);
    }

    pub fn load(&self) -> f64 {
        let state = self.shared.state.lock().unwrap();
        (state.pending.len() as f64 * 0.1).min(0.95)
    }

    pub fn stats(&self) -> AdvancedSchedulerStats {
        let state = self.shared.state.lock().unwrap();
        let completed = state.completed;

        AdvancedSchedulerStats {
            algorithm: state.algorithm,
            total_processes: state.total_processes,
            completed_processes: completed,
            queue_size: state.pending.len(),
            average_waiting_time: if completed > 0 {
                state.total_waiting / completed as f64
            } else {
                0.0
            },
            average_turnaround_time: if completed > 0 {
                state.total_turnaround / completed as f64
            } else {
                0.0
            },
            throughput: match state.first_arrival {
                Some(first) if completed > 0 => {
                    let span = first.elapsed().as_secs_f64();
                    if span > 0.0 {
                        completed as f64 / span
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            },
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, shutdown: &mut watch::Receiver<bool>) {
    loop {
        let entry = loop {
            if *shutdown.borrow() {
                return;
            }

            let popped = {
                let mut state = shared.state.lock().unwrap();
                if state.pending.is_empty() {
                    None
                } else {
                    Some(state.pending.remove(0))
                }
            };

            match popped {
                Some(e) => break e,
                None => {
                    select! {
                        _ = shared.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        };

        let mut entry = entry;
        let task_id = entry.task.task_id.clone();

        if entry.cancel.is_cancelled() {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            continue;
        }

        let started = Instant::now();
        let result = shared.runner.run(&entry.task, &entry.cancel).await;
        let completion = Instant::now();

        if entry.cancel.is_cancelled() {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            continue;
        }

        let turnaround = completion.duration_since(entry.arrival).as_secs_f64();
        let waiting = turnaround - entry.burst;

        {
            let mut state = shared.state.lock().unwrap();
            state.active.remove(&task_id);
            state.completed += 1;
            state.total_turnaround += turnaround;
            state.total_waiting += waiting;
        }

        debug!(
            "Process completed (task = {}) (turnaround = {:.3}s) (waiting = {:.3}s)",
            task_id, turnaround, waiting
        );

        if let Some(callback) = entry.callback.take() {
            callback(TaskOutcome {
                task_id,
                result,
                execution_time: completion.duration_since(started),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::sched::testing::{spec, RecordingRunner};

    fn burst_spec(task_id: &str, priority: i32, burst: f64) -> TaskSpec {
        let mut s = spec(task_id, priority);
        s.estimated_burst = Some(burst);
        s
    }

    #[tokio::test]
    async fn sjf_orders_by_burst() {
        let runner = RecordingRunner::new(Duration::from_millis(2));
        let scheduler = AdvancedScheduler::new(SchedulingAlgorithm::Sjf, runner.clone());

        scheduler.submit(burst_spec("slow", 0, 9.0), Box::new(|_| {}));
        scheduler.submit(burst_spec("fast", 0, 1.0), Box::new(|_| {}));
        scheduler.submit(burst_spec("mid", 0, 4.0), Box::new(|_| {}));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop();

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["fast", "mid", "slow"]);
    }

    #[tokio::test]
    async fn priority_orders_descending_with_stable_ties() {
        let runner = RecordingRunner::new(Duration::from_millis(2));
        let scheduler =
            AdvancedScheduler::new(SchedulingAlgorithm::Priority, runner.clone());

        scheduler.submit(spec("a", 1), Box::new(|_| {}));
        scheduler.submit(spec("b", 7), Box::new(|_| {}));
        scheduler.submit(spec("c", 7), Box::new(|_| {}));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop();

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn fcfs_preserves_arrival_order() {
        let runner = RecordingRunner::new(Duration::from_millis(2));
        let scheduler = AdvancedScheduler::new(SchedulingAlgorithm::Fcfs, runner.clone());

        scheduler.submit(spec("one", 9), Box::new(|_| {}));
        scheduler.submit(spec("two", 0), Box::new(|_| {}));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop();

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn algorithm_change_resorts_pending() {
        let runner = RecordingRunner::new(Duration::from_millis(2));
        let scheduler = AdvancedScheduler::new(SchedulingAlgorithm::Fcfs, runner.clone());

        scheduler.submit(spec("low", 0), Box::new(|_| {}));
        scheduler.submit(spec("high", 5), Box::new(|_| {}));
        scheduler.set_algorithm(SchedulingAlgorithm::Priority);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop();

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn metrics_accumulate_per_completion() {
        let runner = RecordingRunner::new(Duration::from_millis(5));
        let scheduler = AdvancedScheduler::new(SchedulingAlgorithm::Fcfs, runner);
        scheduler.start();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        scheduler.submit(burst_spec("t", 0, 0.0), Box::new(move |_| {
            let _ = tx.send(());
        }));
        rx.await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.completed_processes, 1);
        assert!(stats.average_turnaround_time > 0.0);
        assert!(stats.throughput > 0.0);
        scheduler.stop();
    }

    #[test]
    fn algorithm_parses_from_wire_names() {
        assert_eq!(
            "SJF".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::Sjf
        );
        assert!("LOTTERY".parse::<SchedulingAlgorithm>().is_err());
    }
}
