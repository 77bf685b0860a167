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
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::value::Value;

/// Result cache keyed by a task fingerprint, so resubmitting an identical
/// task returns without touching the scheduler.
///
/// Arguments enter the fingerprint in canonical JSON form, so structurally
/// equal argument lists hash identically regardless of how the client
/// spelled them.
pub struct ResultCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
    tick: u64,
}

struct Entry {
    result: Value,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// SHA-256 over program, function name and canonical argument text.
pub fn fingerprint(program: &str, function: &str, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(program.as_bytes());
    hasher.update([0]);
    hasher.update(function.as_bytes());
    hasher.update([0]);
    hasher.update(Value::List(args.to_vec()).canonical().as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

impl ResultCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                tick: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        let ttl = self.ttl;

        let probe = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => {
                entry.last_used = tick;
                Some(Some(entry.result.clone()))
            }
            Some(_) => Some(None),
            None => None,
        };

        match probe {
            Some(Some(result)) => {
                inner.hits += 1;
                debug!("Cache hit (key = {})", &key[..key.len().min(8)]);
                Some(result)
            }
            Some(None) => {
                inner.entries.remove(key);
                inner.misses += 1;
                debug!("Cache entry expired (key = {})", &key[..key.len().min(8)]);
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, result: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(key) {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                result,
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        info!("Result cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;

        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
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
    fn fingerprint_is_canonical_over_args() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();

        assert_eq!(
            fingerprint("p", "f", &[a]),
            fingerprint("p", "f", &[b])
        );
        assert_ne!(
            fingerprint("p", "f", &[Value::Int(1)]),
            fingerprint("p", "f", &[Value::Int(2)])
        );
    }

    #[test]
    fn hit_and_miss_accounting() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let key = fingerprint("p", "main", &[Value::Int(7)]);

        assert_eq!(cache.get(&key), None);
        cache.put(&key, Value::Int(49));
        assert_eq!(cache.get(&key), Some(Value::Int(49)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ResultCache::new(8, Duration::from_millis(0));
        cache.put("k", Value::Int(1));

        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn least_recently_used_is_evicted_at_capacity() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        cache.put("a", Value::Int(1));
        cache.put("b", Value::Int(2));

        // Touch "a" so "b" is the stalest entry.
        cache.get("a");
        cache.put("c", Value::Int(3));

        assert_eq!(cache.get("a"), Some(Value::Int(1)));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(Value::Int(3)));
    }
}
