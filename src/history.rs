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

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Which side of a dispatch this record describes: the peer that ran the
/// task, or the peer that submitted it to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRole {
    Executor,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    /// Unix seconds at recording time.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<TaskRole>,
    /// Result rendered to text and truncated; the cache holds the real value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_execution_time: f64,
}

const RESULT_TEXT_LIMIT: usize = 100;

/// Append-only audit ring. The oldest record falls off once `max_history`
/// is reached; the per-task index always reflects the latest record for an
/// id, so a reused task id overwrites its predecessor there.
pub struct TaskHistory {
    max_history: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    ring: VecDeque<TaskRecord>,
    by_id: HashMap<String, TaskRecord>,
}

impl TaskRecord {
    pub fn new(task_id: &str, task_type: &str, status: TaskStatus) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            status,
            timestamp,
            execution_time: None,
            executed_by: None,
            requested_by: None,
            role: None,
            result: None,
            error: None,
        }
    }

    pub fn execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = Some(seconds);
        self
    }

    pub fn executed_by(mut self, peer: impl Into<String>) -> Self {
        self.executed_by = Some(peer.into());
        self
    }

    pub fn requested_by(mut self, peer: impl Into<String>) -> Self {
        self.requested_by = Some(peer.into());
        self
    }

    pub fn role(mut self, role: TaskRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn result_text(mut self, text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > RESULT_TEXT_LIMIT {
            let cut = (0..=RESULT_TEXT_LIMIT)
                .rev()
                .find(|i| text.is_char_boundary(*i))
                .unwrap_or(0);
            text.truncate(cut);
        }
        self.result = Some(text);
        self
    }

    pub fn error_text(mut self, text: impl Into<String>) -> Self {
        self.error = Some(text.into());
        self
    }
}

impl TaskHistory {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    pub fn record(&self, record: TaskRecord) {
        let mut inner = self.inner.lock().unwrap();

        if inner.ring.len() >= self.max_history {
            inner.ring.pop_front();
        }

        inner.by_id.insert(record.task_id.clone(), record.clone());
        inner.ring.push_back(record);
    }

    /// Most recent records, oldest first, optionally filtered by task type.
    pub fn history(&self, limit: usize, task_type: Option<&str>) -> Vec<TaskRecord> {
        let inner = self.inner.lock().unwrap();
        let filtered: Vec<TaskRecord> = inner
            .ring
            .iter()
            .filter(|r| task_type.map_or(true, |t| r.task_type == t))
            .cloned()
            .collect();

        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn task_info(&self, task_id: &str) -> Option<TaskRecord> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(task_id).cloned()
    }

    pub fn stats(&self) -> HistoryStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.ring.len();
        if total == 0 {
            return HistoryStats {
                total_tasks: 0,
                successful: 0,
                failed: 0,
                cancelled: 0,
                success_rate: 0.0,
                average_execution_time: 0.0,
            };
        }

        let mut successful = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        let mut time_sum = 0.0;
        let mut timed = 0usize;

        for record in &inner.ring {
            match record.status {
                TaskStatus::Success => successful += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
            }
            if let Some(t) = record.execution_time {
                time_sum += t;
                timed += 1;
            }
        }

        HistoryStats {
            total_tasks: total,
            successful,
            failed,
            cancelled,
            success_rate: successful as f64 / total as f64,
            average_execution_time: if timed > 0 {
                time_sum / timed as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let history = TaskHistory::new(3);
        for i in 0..5 {
            history.record(TaskRecord::new(
                &format!("T{}", i),
                "CPU_TASK",
                TaskStatus::Success,
            ));
        }

        let records = history.history(10, None);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].task_id, "T2");
        assert_eq!(records[2].task_id, "T4");
    }

    #[test]
    fn index_holds_latest_record_per_id() {
        let history = TaskHistory::new(10);
        history.record(TaskRecord::new("T1", "CPU_TASK", TaskStatus::Failed));
        history.record(
            TaskRecord::new("T1", "CPU_TASK", TaskStatus::Success).execution_time(0.5),
        );

        let info = history.task_info("T1").unwrap();
        assert_eq!(info.status, TaskStatus::Success);
        assert_eq!(info.execution_time, Some(0.5));
    }

    #[test]
    fn type_filter_and_limit() {
        let history = TaskHistory::new(10);
        history.record(TaskRecord::new("T1", "CPU_TASK", TaskStatus::Success));
        history.record(TaskRecord::new("T2", "BATCH_TASK", TaskStatus::Success));
        history.record(TaskRecord::new("T3", "CPU_TASK", TaskStatus::Failed));

        let records = history.history(10, Some("CPU_TASK"));
        assert_eq!(records.len(), 2);

        let records = history.history(1, Some("CPU_TASK"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, "T3");
    }

    #[test]
    fn stats_aggregate() {
        let history = TaskHistory::new(10);
        history
            .record(TaskRecord::new("a", "CPU_TASK", TaskStatus::Success).execution_time(1.0));
        history
            .record(TaskRecord::new("b", "CPU_TASK", TaskStatus::Failed).execution_time(3.0));
        history.record(TaskRecord::new("c", "CPU_TASK", TaskStatus::Cancelled));

        let stats = history.stats();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert!((stats.average_execution_time - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn long_results_are_truncated() {
        let record = TaskRecord::new("T", "CPU_TASK", TaskStatus::Success)
            .result_text("x".repeat(500));
        assert_eq!(record.result.unwrap().len(), 100);
    }
}
