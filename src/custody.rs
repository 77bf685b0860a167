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

//! Owned-file custody: an owner scrambles a file with a keystream only it
//! can derive, places the ciphertext on storage peers, and retains the
//! exclusive right to read it back.
//!
//! The keystream is SHA-256 over `<durable_id>:<salt>`, cycled across the
//! payload with XOR. Deriving from the durable id rather than the owner's
//! address means decryption survives IP changes without consulting anyone.
//! XOR with a repeating pad is obfuscation, not confidentiality: a known
//! plaintext recovers the pad. The transform is isolated here so an AEAD
//! can replace it without touching the wire shape.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{WeftError, WeftResult};
use crate::proto::PeerAddr;
use crate::store::sanitize_filename;

pub fn derive_keystream(durable_id: &str, salt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(durable_id.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    hasher.finalize().into()
}

/// XOR the payload against the cycled keystream; symmetric, so the same
/// call encrypts and decrypts.
pub fn xor_transform(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % key.len()])
        .collect()
}

pub fn random_salt() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedFileMeta {
    pub salt: String,
    pub storage: Vec<PeerAddr>,
}

/// Owner-side record of placed files: which storage peers hold each file
/// and the salt its keystream was derived with. Persisted next to the
/// peer's identity so downloads survive restarts.
pub struct OwnerLedger {
    path: PathBuf,
    inner: Mutex<HashMap<String, OwnedFileMeta>>,
}

impl OwnerLedger {
    pub fn load(state_dir: &Path) -> WeftResult<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("owned_files.json");

        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Discarding unreadable owned-file ledger: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            inner: Mutex::new(entries),
        })
    }

    fn persist(&self, snapshot: &HashMap<String, OwnedFileMeta>) {
        let tmp = self.path.with_extension("tmp");
        let write = || -> WeftResult<()> {
            let raw = serde_json::to_string_pretty(snapshot)?;
            fs::write(&tmp, raw)?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = write() {
            error!("Failed to persist owned-file ledger: {}", e);
        }
    }

    pub fn record(&self, filename: &str, salt: &str, storage: Vec<PeerAddr>) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(
                filename.to_string(),
                OwnedFileMeta {
                    salt: salt.to_string(),
                    storage,
                },
            );
            inner.clone()
        };
        self.persist(&snapshot);
    }

    pub fn meta(&self, filename: &str) -> Option<OwnedFileMeta> {
        self.inner.lock().unwrap().get(filename).cloned()
    }

    pub fn remove(&self, filename: &str) -> bool {
        let (removed, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.remove(filename).is_some();
            (removed, inner.clone())
        };
        if removed {
            self.persist(&snapshot);
        }
        removed
    }

    pub fn filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

fn owner_dir_name(owner: &PeerAddr) -> String {
    format!("{}_{}", owner.ip, owner.port)
}

fn parse_owner_dir(name: &str) -> Option<PeerAddr> {
    // `<ip>_<port>`; the port is everything after the last underscore.
    let split = name.rfind('_')?;
    let port: u16 = name[split + 1..].parse().ok()?;
    let ip = &name[..split];
    if ip.is_empty() {
        return None;
    }
    Some(PeerAddr::new(ip, port))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Storage-side vault of ciphertext held for other peers, laid out as
/// `<root>/<owner_ip>_<owner_port>/<filename>`. The disk layout is the
/// durable record: after a restart the ownership map is rebuilt by scanning
/// it.
pub struct StorageVault {
    root: PathBuf,
    stored_for_others: Mutex<HashMap<String, PeerAddr>>,
}

impl StorageVault {
    pub fn new(root: impl Into<PathBuf>) -> WeftResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        restrict_dir(&root)?;

        let vault = Self {
            root,
            stored_for_others: Mutex::new(HashMap::new()),
        };
        vault.reconstruct();
        Ok(vault)
    }

    /// Rebuild `stored_for_others` from the `<ip>_<port>` directory layout.
    pub fn reconstruct(&self) {
        let mut rebuilt = HashMap::new();

        if let Ok(owners) = fs::read_dir(&self.root) {
            for owner_entry in owners.flatten() {
                let dir_name = owner_entry.file_name();
                let owner = match dir_name.to_str().and_then(parse_owner_dir) {
                    Some(owner) => owner,
                    None => continue,
                };
                if !owner_entry.path().is_dir() {
                    continue;
                }
                if let Ok(files) = fs::read_dir(owner_entry.path()) {
                    for file_entry in files.flatten() {
                        if file_entry.path().is_file() {
                            if let Some(name) = file_entry.file_name().to_str() {
                                rebuilt.insert(name.to_string(), owner.clone());
                            }
                        }
                    }
                }
            }
        }

        let count = rebuilt.len();
        *self.stored_for_others.lock().unwrap() = rebuilt;
        if count > 0 {
            info!("Reconstructed owned-file metadata (files = {})", count);
        }
    }

    /// Store ciphertext for `owner`.
    pub fn store(&self, filename: &str, owner: &PeerAddr, ciphertext: &[u8]) -> WeftResult<()> {
        let safe = sanitize_filename(filename)?;

        let dir = self.root.join(owner_dir_name(owner));
        fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;

        let path = dir.join(&safe);
        fs::write(&path, ciphertext)?;
        restrict_file(&path)?;

        self.stored_for_others
            .lock()
            .unwrap()
            .insert(safe.clone(), owner.clone());

        info!(
            "Stored owned file (name = {}) (owner = {}) (bytes = {})",
            safe,
            owner,
            ciphertext.len()
        );
        Ok(())
    }

    /// Serve ciphertext back to its owner. Ownership is proven by port; a
    /// requester arriving from a new IP with the right port has the
    /// directory renamed and the record updated in place.
    pub fn retrieve(&self, filename: &str, requester: &PeerAddr) -> WeftResult<Vec<u8>> {
        let safe = sanitize_filename(filename)?;

        let owner = {
            let known = self.stored_for_others.lock().unwrap().get(&safe).cloned();
            match known {
                Some(owner) => owner,
                None => {
                    // Restart may have dropped the map; the disk knows.
                    self.reconstruct();
                    self.stored_for_others
                        .lock()
                        .unwrap()
                        .get(&safe)
                        .cloned()
                        .ok_or_else(|| {
                            WeftError::NotFound(format!("file {} not held here", safe))
                        })?
                }
            }
        };

        if owner.port != requester.port {
            return Err(WeftError::Unauthorized(format!(
                "port mismatch, you are not the owner of {}",
                safe
            )));
        }

        if owner.ip != requester.ip {
            info!(
                "Owner IP changed (file = {}) ({} -> {})",
                safe, owner.ip, requester.ip
            );
            let old_dir = self.root.join(owner_dir_name(&owner));
            let new_dir = self.root.join(owner_dir_name(requester));
            if old_dir.is_dir() && !new_dir.exists() {
                if let Err(e) = fs::rename(&old_dir, &new_dir) {
                    warn!("Could not rename owner directory: {}", e);
                }
            }

            let mut map = self.stored_for_others.lock().unwrap();
            for recorded in map.values_mut() {
                if *recorded == owner {
                    *recorded = requester.clone();
                }
            }
        }

        let path = self.root.join(owner_dir_name(requester)).join(&safe);
        let path = if path.is_file() {
            path
        } else {
            // Rename may have failed; fall back to the original directory.
            let fallback = self.root.join(owner_dir_name(&owner)).join(&safe);
            if !fallback.is_file() {
                return Err(WeftError::NotFound(format!(
                    "file {} missing from disk",
                    safe
                )));
            }
            fallback
        };

        Ok(fs::read(path)?)
    }

    /// Is this filename held in custody for some owner? Consults the map
    /// and falls back to the disk layout, so a restarted peer still refuses
    /// public reads of custodial files.
    pub fn holds(&self, filename: &str) -> bool {
        let safe = match sanitize_filename(filename) {
            Ok(safe) => safe,
            Err(_) => return false,
        };

        if self.stored_for_others.lock().unwrap().contains_key(&safe) {
            return true;
        }

        if let Ok(owners) = fs::read_dir(&self.root) {
            for owner_entry in owners.flatten() {
                if owner_entry.path().is_dir() && owner_entry.path().join(&safe).is_file() {
                    return true;
                }
            }
        }
        false
    }

    pub fn owner_of(&self, filename: &str) -> Option<PeerAddr> {
        let safe = sanitize_filename(filename).ok()?;
        self.stored_for_others.lock().unwrap().get(&safe).cloned()
    }

    /// Every (filename, owner) pair held here, for tracker repair reports.
    pub fn holdings(&self) -> Vec<(String, PeerAddr)> {
        let map = self.stored_for_others.lock().unwrap();
        let mut out: Vec<(String, PeerAddr)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn file_count(&self) -> usize {
        self.stored_for_others.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn transform_round_trips_and_scrambles() {
        let key = derive_keystream("abc123", "salt-1");
        let plain = b"hello custody".to_vec();

        let cipher = xor_transform(&plain, &key);
        assert_ne!(cipher, plain);
        assert_eq!(xor_transform(&cipher, &key), plain);

        // A different salt yields a different pad.
        let other = derive_keystream("abc123", "salt-2");
        assert_ne!(xor_transform(&plain, &other), cipher);
    }

    #[test]
    fn vault_round_trip_with_port_proof() {
        let dir = tempdir().unwrap();
        let vault = StorageVault::new(dir.path().join("owned")).unwrap();
        let owner = PeerAddr::new("10.0.0.1", 9001);

        vault.store("notes.txt", &owner, b"ciphertext").unwrap();

        // Expected disk layout.
        assert!(dir
            .path()
            .join("owned")
            .join("10.0.0.1_9001")
            .join("notes.txt")
            .is_file());

        assert_eq!(
            vault.retrieve("notes.txt", &owner).unwrap(),
            b"ciphertext".to_vec()
        );

        // Wrong port is refused.
        let impostor = PeerAddr::new("10.0.0.1", 9002);
        assert!(matches!(
            vault.retrieve("notes.txt", &impostor),
            Err(WeftError::Unauthorized(_))
        ));
    }

    #[test]
    fn ip_change_renames_owner_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("owned");
        let vault = StorageVault::new(&root).unwrap();
        let owner = PeerAddr::new("10.0.0.1", 9001);
        vault.store("f.bin", &owner, b"x").unwrap();

        let moved = PeerAddr::new("10.0.0.9", 9001);
        assert_eq!(vault.retrieve("f.bin", &moved).unwrap(), b"x".to_vec());

        assert!(root.join("10.0.0.9_9001").join("f.bin").is_file());
        assert!(!root.join("10.0.0.1_9001").exists());
        assert_eq!(vault.owner_of("f.bin"), Some(moved));
    }

    #[test]
    fn metadata_rebuilds_from_disk_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("owned");
        {
            let vault = StorageVault::new(&root).unwrap();
            vault
                .store("a.txt", &PeerAddr::new("192.168.1.5", 9004), b"1")
                .unwrap();
        }

        // A fresh vault over the same root rediscovers the holding.
        let vault = StorageVault::new(&root).unwrap();
        assert_eq!(vault.file_count(), 1);
        assert_eq!(
            vault.owner_of("a.txt"),
            Some(PeerAddr::new("192.168.1.5", 9004))
        );
        assert!(vault.holds("a.txt"));
        assert!(!vault.holds("b.txt"));
    }

    #[test]
    fn owner_dirs_with_underscored_ips_parse() {
        // IPv6-ish or host-style names containing underscores still split
        // on the last one.
        assert_eq!(
            parse_owner_dir("fe80::1_9001"),
            Some(PeerAddr::new("fe80::1", 9001))
        );
        assert_eq!(parse_owner_dir("bad"), None);
        assert_eq!(parse_owner_dir("_9001"), None);
    }

    #[test]
    fn ledger_survives_reload() {
        let dir = tempdir().unwrap();
        {
            let ledger = OwnerLedger::load(dir.path()).unwrap();
            ledger.record(
                "notes.txt",
                "salt-xyz",
                vec![PeerAddr::new("10.0.0.2", 9002)],
            );
        }

        let ledger = OwnerLedger::load(dir.path()).unwrap();
        let meta = ledger.meta("notes.txt").unwrap();
        assert_eq!(meta.salt, "salt-xyz");
        assert_eq!(meta.storage, vec![PeerAddr::new("10.0.0.2", 9002)]);

        assert!(ledger.remove("notes.txt"));
        assert!(!ledger.remove("notes.txt"));
        assert!(ledger.filenames().is_empty());
    }
}
