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

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{WeftError, WeftResult};

/// Per-peer resource ceilings: a sliding window over CPU-task admissions,
/// a cap on memory keys, and a running storage-byte budget.
pub struct ResourceQuota {
    max_cpu_tasks: usize,
    window: Duration,
    max_memory_keys: usize,
    max_storage_bytes: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    cpu_task_times: VecDeque<Instant>,
    storage_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub cpu_tasks_used: usize,
    pub cpu_tasks_limit: usize,
    pub window_seconds: u64,
    pub memory_keys_limit: usize,
    pub storage_used_bytes: u64,
    pub storage_limit_bytes: u64,
}

impl ResourceQuota {
    pub fn new(
        max_cpu_tasks: usize,
        window: Duration,
        max_memory_keys: usize,
        max_storage_mb: usize,
    ) -> Self {
        Self {
            max_cpu_tasks,
            window,
            max_memory_keys,
            max_storage_bytes: max_storage_mb as u64 * 1024 * 1024,
            inner: Mutex::new(Inner {
                cpu_task_times: VecDeque::new(),
                storage_bytes: 0,
            }),
        }
    }

    /// Admit one CPU task, or refuse when the window is full. Admission is
    /// recorded immediately; a rejected task does not consume quota.
    pub fn check_cpu_quota(&self) -> WeftResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        while let Some(front) = inner.cpu_task_times.front() {
            if now.duration_since(*front) >= self.window {
                inner.cpu_task_times.pop_front();
            } else {
                break;
            }
        }

        if inner.cpu_task_times.len() >= self.max_cpu_tasks {
            return Err(WeftError::QuotaExceeded(format!(
                "CPU task quota exceeded ({} per {}s)",
                self.max_cpu_tasks,
                self.window.as_secs()
            )));
        }

        inner.cpu_task_times.push_back(now);
        Ok(())
    }

    /// `current_keys` counts the store *after* the pending insert.
    pub fn check_memory_quota(&self, current_keys: usize) -> WeftResult<()> {
        if current_keys > self.max_memory_keys {
            return Err(WeftError::QuotaExceeded(format!(
                "memory quota exceeded (max {} keys)",
                self.max_memory_keys
            )));
        }
        Ok(())
    }

    /// Reserve storage for an incoming file. The reservation sticks; release
    /// it with `release_storage` when the file is deleted.
    pub fn check_storage_quota(&self, additional_bytes: u64) -> WeftResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let new_total = inner.storage_bytes.saturating_add(additional_bytes);

        if new_total > self.max_storage_bytes {
            return Err(WeftError::QuotaExceeded(format!(
                "storage quota exceeded (max {} bytes)",
                self.max_storage_bytes
            )));
        }

        inner.storage_bytes = new_total;
        Ok(())
    }

    pub fn release_storage(&self, bytes_released: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.storage_bytes = inner.storage_bytes.saturating_sub(bytes_released);
    }

    pub fn usage(&self) -> QuotaUsage {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let recent = inner
            .cpu_task_times
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count();

        QuotaUsage {
            cpu_tasks_used: recent,
            cpu_tasks_limit: self.max_cpu_tasks,
            window_seconds: self.window.as_secs(),
            memory_keys_limit: self.max_memory_keys,
            storage_used_bytes: inner.storage_bytes,
            storage_limit_bytes: self.max_storage_bytes,
        }
    }
}
