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

//! Weft: a peer-to-peer resource-sharing fabric. Equal peers pool CPU,
//! keyed memory and durable file storage; a single tracker handles
//! liveness, least-load dispatch and the authoritative owned-file registry.

#[macro_use]
extern crate log;

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod custody;
pub mod error;
pub mod exec;
pub mod history;
pub mod identity;
pub mod mem;
pub mod os;
pub mod os_sched;
pub mod peer;
pub mod proto;
pub mod quota;
pub mod sched;
pub mod store;
pub mod tracker;
pub mod value;

pub use client::{PeerClient, TrackerClient};
pub use config::Config;
pub use error::{WeftError, WeftResult};
pub use peer::Peer;
pub use proto::{PeerAddr, Request, Response, TaskSpec};
pub use tracker::Tracker;
pub use value::Value;
