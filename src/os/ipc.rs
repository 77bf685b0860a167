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
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::timeout as with_deadline;

use crate::error::{WeftError, WeftResult};
use crate::value::Value;

pub const BROADCAST: &str = "*";
const DEFAULT_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct IpcMessage {
    pub message_id: String,
    pub sender: String,
    pub receiver: String,
    pub message_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_id: String,
    pub size: usize,
    pub max_size: usize,
    pub message_count: u64,
}

/// Bounded queue with receiver-scoped delivery. Messages addressed to a
/// receiver land in that receiver's subqueue; `*` messages land in a shared
/// broadcast lane. A receive takes whichever eligible message was enqueued
/// first, so mismatched traffic never has to be requeued and cannot starve
/// anyone.
pub struct MessageQueue {
    queue_id: String,
    max_size: usize,
    inner: Mutex<QueueInner>,
    space: Notify,
    arrival: Notify,
}

struct QueueInner {
    direct: HashMap<String, VecDeque<(u64, IpcMessage)>>,
    broadcast: VecDeque<(u64, IpcMessage)>,
    len: usize,
    seq: u64,
    message_count: u64,
}

impl MessageQueue {
    pub fn new(queue_id: &str, max_size: usize) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            max_size,
            inner: Mutex::new(QueueInner {
                direct: HashMap::new(),
                broadcast: VecDeque::new(),
                len: 0,
                seq: 0,
                message_count: 0,
            }),
            space: Notify::new(),
            arrival: Notify::new(),
        }
    }

    fn try_send(&self, mut message: IpcMessage) -> Result<String, IpcMessage> {
        let mut inner = self.inner.lock().unwrap();
        if inner.len >= self.max_size {
            return Err(message);
        }

        inner.seq += 1;
        inner.message_count += 1;
        message.message_id = format!("MSG{}", inner.message_count);
        let id = message.message_id.clone();
        let seq = inner.seq;

        if message.receiver == BROADCAST {
            inner.broadcast.push_back((seq, message));
        } else {
            inner
                .direct
                .entry(message.receiver.clone())
                .or_insert_with(VecDeque::new)
                .push_back((seq, message));
        }
        inner.len += 1;
        Ok(id)
    }

    /// Send, waiting up to `wait` for space when the queue is full.
    pub async fn send(
        &self,
        message: IpcMessage,
        wait: Option<Duration>,
    ) -> WeftResult<String> {
        let mut pending = message;
        let deadline = wait.unwrap_or(Duration::from_secs(5));
        let give_up = tokio::time::Instant::now() + deadline;

        loop {
            // Register for the space signal before probing, so a slot freed
            // between the probe and the await cannot be missed.
            let mut space = Box::pin(self.space.notified());
            space.as_mut().enable();

            match self.try_send(pending) {
                Ok(id) => {
                    debug!("Message sent (queue = {}) (id = {})", self.queue_id, id);
                    self.arrival.notify_waiters();
                    return Ok(id);
                }
                Err(back) => {
                    pending = back;
                    let remaining = give_up
                        .checked_duration_since(tokio::time::Instant::now())
                        .unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        warn!("Queue is full (queue = {})", self.queue_id);
                        return Err(WeftError::QuotaExceeded(format!(
                            "queue {} is full",
                            self.queue_id
                        )));
                    }
                    let _ = with_deadline(remaining, space).await;
                }
            }
        }
    }

    fn try_receive(&self, receiver: &str) -> Option<IpcMessage> {
        let mut inner = self.inner.lock().unwrap();

        let direct_seq = inner
            .direct
            .get(receiver)
            .and_then(|q| q.front())
            .map(|(seq, _)| *seq);
        let broadcast_seq = inner.broadcast.front().map(|(seq, _)| *seq);

        let take_direct = match (direct_seq, broadcast_seq) {
            (Some(d), Some(b)) => d < b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };

        let message = if take_direct {
            inner
                .direct
                .get_mut(receiver)
                .and_then(|q| q.pop_front())
                .map(|(_, m)| m)
        } else {
            inner.broadcast.pop_front().map(|(_, m)| m)
        };

        if message.is_some() {
            inner.len -= 1;
        }
        message
    }

    /// Receive the oldest message addressed to `receiver` or broadcast,
    /// waiting up to `wait` for one to arrive.
    pub async fn receive(
        &self,
        receiver: &str,
        wait: Option<Duration>,
    ) -> Option<IpcMessage> {
        let deadline = wait.unwrap_or(Duration::ZERO);
        let give_up = tokio::time::Instant::now() + deadline;

        loop {
            let mut arrival = Box::pin(self.arrival.notified());
            arrival.as_mut().enable();

            if let Some(message) = self.try_receive(receiver) {
                self.space.notify_waiters();
                debug!(
                    "Message received (queue = {}) (id = {})",
                    self.queue_id, message.message_id
                );
                return Some(message);
            }

            let remaining = give_up
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return None;
            }
            let _ = with_deadline(remaining, arrival).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            queue_id: self.queue_id.clone(),
            size: inner.len,
            max_size: self.max_size,
            message_count: inner.message_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemaphoreStats {
    pub sem_id: String,
    pub value: i64,
    pub waiting_processes: usize,
    pub operation_count: u64,
}

/// Counting semaphore with cooperative ticketing: a failed `wait` records
/// the caller and reports BLOCKED without suspending anything; `signal`
/// hands the unit to the head waiter instead of incrementing. Actual
/// suspension and resumption belong to the caller.
pub struct Semaphore {
    sem_id: String,
    inner: Mutex<SemInner>,
}

struct SemInner {
    value: i64,
    waiting: Vec<String>,
    operation_count: u64,
}

impl Semaphore {
    pub fn new(sem_id: &str, initial_value: i64) -> Self {
        Self {
            sem_id: sem_id.to_string(),
            inner: Mutex::new(SemInner {
                value: initial_value,
                waiting: Vec::new(),
                operation_count: 0,
            }),
        }
    }

    /// P operation. True when the unit was taken; false when the caller was
    /// queued instead.
    pub fn wait(&self, process_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.operation_count += 1;

        if inner.value > 0 {
            inner.value -= 1;
            debug!("Semaphore wait (sem = {}) (value = {})", self.sem_id, inner.value);
            true
        } else {
            if !inner.waiting.iter().any(|p| p == process_id) {
                inner.waiting.push(process_id.to_string());
            }
            debug!("Semaphore blocked (sem = {}) (pid = {})", self.sem_id, process_id);
            false
        }
    }

    /// V operation. Returns the pid woken, if a waiter was queued.
    pub fn signal(&self, _process_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.operation_count += 1;

        if inner.waiting.is_empty() {
            inner.value += 1;
            None
        } else {
            let woken = inner.waiting.remove(0);
            debug!("Semaphore woke waiter (sem = {}) (pid = {})", self.sem_id, woken);
            Some(woken)
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().unwrap().value
    }

    pub fn stats(&self) -> SemaphoreStats {
        let inner = self.inner.lock().unwrap();
        SemaphoreStats {
            sem_id: self.sem_id.clone(),
            value: inner.value,
            waiting_processes: inner.waiting.len(),
            operation_count: inner.operation_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IpcStats {
    pub total_queues: usize,
    pub total_semaphores: usize,
    pub queues: Vec<QueueStats>,
    pub semaphores: Vec<SemaphoreStats>,
}

/// Registry of queues and semaphores, addressed by id over the wire.
pub struct IpcManager {
    inner: Mutex<Registry>,
}

struct Registry {
    queues: HashMap<String, Arc<MessageQueue>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

impl IpcManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                queues: HashMap::new(),
                semaphores: HashMap::new(),
            }),
        }
    }

    pub fn create_queue(&self, queue_id: &str, max_size: Option<usize>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queues.contains_key(queue_id) {
            return false;
        }
        inner.queues.insert(
            queue_id.to_string(),
            Arc::new(MessageQueue::new(
                queue_id,
                max_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            )),
        );
        info!("Message queue created (queue = {})", queue_id);
        true
    }

    pub fn queue(&self, queue_id: &str) -> Option<Arc<MessageQueue>> {
        self.inner.lock().unwrap().queues.get(queue_id).cloned()
    }

    pub fn delete_queue(&self, queue_id: &str) -> bool {
        self.inner.lock().unwrap().queues.remove(queue_id).is_some()
    }

    pub fn create_semaphore(&self, sem_id: &str, initial_value: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.semaphores.contains_key(sem_id) {
            return false;
        }
        inner
            .semaphores
            .insert(sem_id.to_string(), Arc::new(Semaphore::new(sem_id, initial_value)));
        info!("Semaphore created (sem = {}) (initial = {})", sem_id, initial_value);
        true
    }

    pub fn semaphore(&self, sem_id: &str) -> Option<Arc<Semaphore>> {
        self.inner.lock().unwrap().semaphores.get(sem_id).cloned()
    }

    pub fn delete_semaphore(&self, sem_id: &str) -> bool {
        self.inner.lock().unwrap().semaphores.remove(sem_id).is_some()
    }

    pub fn stats(&self) -> IpcStats {
        let inner = self.inner.lock().unwrap();
        let mut queues: Vec<QueueStats> = inner.queues.values().map(|q| q.stats()).collect();
        queues.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        let mut semaphores: Vec<SemaphoreStats> =
            inner.semaphores.values().map(|s| s.stats()).collect();
        semaphores.sort_by(|a, b| a.sem_id.cmp(&b.sem_id));

        IpcStats {
            total_queues: inner.queues.len(),
            total_semaphores: inner.semaphores.len(),
            queues,
            semaphores,
        }
    }
}
