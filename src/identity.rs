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

use std::fs;
use std::path::Path;

use crate::error::WeftResult;

const IDENTITY_FILE: &str = "identity";

/// Load this peer's durable id, generating and persisting a random 128-bit
/// one on first start. The id survives address changes and keys ownership
/// records at the tracker.
pub fn load_or_create(state_dir: &Path) -> WeftResult<String> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join(IDENTITY_FILE);

    if let Ok(existing) = fs::read_to_string(&path) {
        let id = existing.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let id = format!("{:032x}", rand::random::<u128>());
    fs::write(&path, &id)?;
    info!("Generated durable peer id (id = {})", id);
    Ok(id)
}

/// Legacy owner ids recorded before a durable id was known: `port_<N>`.
pub fn legacy_port_id(port: u16) -> String {
    format!("port_{}", port)
}

pub fn parse_legacy_port_id(owner_id: &str) -> Option<u16> {
    owner_id.strip_prefix("port_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn id_is_stable_across_restarts() {
        let dir = tempdir().unwrap();

        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn distinct_state_dirs_get_distinct_ids() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();

        assert_ne!(
            load_or_create(a.path()).unwrap(),
            load_or_create(b.path()).unwrap()
        );
    }

    #[test]
    fn legacy_ids_round_trip() {
        assert_eq!(legacy_port_id(9001), "port_9001");
        assert_eq!(parse_legacy_port_id("port_9001"), Some(9001));
        assert_eq!(parse_legacy_port_id("deadbeef"), None);
    }
}
