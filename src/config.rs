// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::env::var;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::WeftResult;

pub const DEFAULT_TRACKER_PORT: u16 = 8888;
pub const DEFAULT_PEER_PORT: u16 = 9000;

/// Hard cap on a single stored file; base64 inflation on the wire is
/// accounted for separately in `max_frame_length`.
pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const TASK_TIMEOUT: Duration = Duration::from_secs(60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(rename(deserialize = "General"), default)]
    pub general: General,

    #[serde(rename(deserialize = "Tracker"), default)]
    pub tracker: Tracker,

    #[serde(rename(deserialize = "Peer"), default)]
    pub peer: Peer,

    #[serde(rename(deserialize = "Limits"), default)]
    pub limits: Limits,
}

#[derive(Deserialize, Debug, Clone)]
pub struct General {
    /// Per-request socket deadline, seconds.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,

    /// Heartbeat cadence and tracker sweep interval, seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// A peer with no load update for this long is considered dead, seconds.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout: u64,

    /// Maximum request rate per source IP over the span of 5 seconds.
    /// Multiple connections from a single address are aggregated together.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Tracker {
    #[serde(default = "default_tracker_host")]
    pub host: String,

    #[serde(default = "default_tracker_port")]
    pub port: u16,

    /// Directory holding the persisted ownership registry.
    #[serde(default = "default_tracker_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Peer {
    #[serde(default = "default_peer_port")]
    pub port: u16,

    /// Public replica store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Ciphertext held for other peers, one subdirectory per owner.
    #[serde(default = "default_owned_storage_dir")]
    pub owned_storage_dir: PathBuf,

    /// Durable identity and owner-side custody metadata.
    #[serde(default = "default_peer_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Limits {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,

    /// Task deadline, seconds, when the task itself carries none.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// CPU tasks admitted per sliding window.
    #[serde(default = "default_max_cpu_tasks")]
    pub max_cpu_tasks: usize,

    /// Sliding-window span for the CPU quota, seconds.
    #[serde(default = "default_quota_window")]
    pub quota_window: u64,

    #[serde(default = "default_max_memory_keys")]
    pub max_memory_keys: usize,

    #[serde(default = "default_max_storage_mb")]
    pub max_storage_mb: usize,
}

fn default_socket_timeout() -> u64 {
    SOCKET_TIMEOUT.as_secs()
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL.as_secs()
}

fn default_peer_timeout() -> u64 {
    PEER_TIMEOUT.as_secs()
}

fn default_rate_limit() -> u32 {
    500
}

fn default_tracker_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tracker_port() -> u16 {
    DEFAULT_TRACKER_PORT
}

fn default_tracker_state_dir() -> PathBuf {
    PathBuf::from("tracker_state")
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("peer_storage")
}

fn default_owned_storage_dir() -> PathBuf {
    PathBuf::from("owned_storage")
}

fn default_peer_state_dir() -> PathBuf {
    PathBuf::from("peer_state")
}

fn default_max_file_size() -> usize {
    MAX_FILE_SIZE
}

fn default_task_timeout() -> u64 {
    TASK_TIMEOUT.as_secs()
}

fn default_max_cpu_tasks() -> usize {
    100
}

fn default_quota_window() -> u64 {
    3600
}

fn default_max_memory_keys() -> usize {
    1000
}

fn default_max_storage_mb() -> usize {
    100
}

impl Default for General {
    fn default() -> Self {
        Self {
            socket_timeout: default_socket_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            peer_timeout: default_peer_timeout(),
            rate_limit: default_rate_limit(),
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            host: default_tracker_host(),
            port: default_tracker_port(),
            state_dir: default_tracker_state_dir(),
        }
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            port: default_peer_port(),
            storage_dir: default_storage_dir(),
            owned_storage_dir: default_owned_storage_dir(),
            state_dir: default_peer_state_dir(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            task_timeout: default_task_timeout(),
            max_cpu_tasks: default_max_cpu_tasks(),
            quota_window: default_quota_window(),
            max_memory_keys: default_max_memory_keys(),
            max_storage_mb: default_max_storage_mb(),
        }
    }
}

impl Config {
    /// Load from `WEFT_CONFIG` (default `config.toml`), falling back to
    /// built-in defaults when no file exists, then apply the environment
    /// overrides `TRACKER_HOST`, `TRACKER_PORT` and `PEER_PORT`.
    pub fn load() -> WeftResult<Self> {
        let config_loc = var("WEFT_CONFIG").unwrap_or_else(|_| "config.toml".into());

        let mut config: Config = match std::fs::read_to_string(&config_loc) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(_) => Config::default(),
        };

        if let Ok(host) = var("TRACKER_HOST") {
            config.tracker.host = host;
        }
        if let Ok(port) = var("TRACKER_PORT") {
            config.tracker.port = port.parse()?;
        }
        if let Ok(port) = var("PEER_PORT") {
            config.peer.port = port.parse()?;
        }

        Ok(config)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.general.socket_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.general.heartbeat_interval)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.general.peer_timeout)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.task_timeout)
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.limits.quota_window)
    }
}
