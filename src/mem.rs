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
use std::sync::Mutex;

use serde::Serialize;

use crate::value::Value;

/// Keyed value store a peer lends out to the fabric. One mutation lock; the
/// same store backs the local and `_REMOTE` memory operations.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    store: HashMap<String, Value>,
    operation_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub key_count: usize,
    pub operation_count: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                store: HashMap::new(),
                operation_count: 0,
            }),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.store.insert(key.to_string(), value);
        inner.operation_count += 1;
        debug!("Memory SET (key = {})", key);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.operation_count += 1;
        inner.store.get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.store.remove(key).is_some() {
            inner.operation_count += 1;
            debug!("Memory DELETE (key = {})", key);
            return true;
        }
        false
    }

    pub fn list_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.store.keys().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().unwrap().store.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.store.clear();
        info!("Memory store cleared");
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock().unwrap();
        MemoryStats {
            key_count: inner.store.len(),
            operation_count: inner.operation_count,
        }
    }
}
