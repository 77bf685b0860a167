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

//! Typed wrappers over the message codec. Every call opens a fresh
//! connection, sends one request, reads one reply and closes; that is the
//! protocol's only conversation shape.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::net::TcpStream;
use tokio::time::timeout as with_deadline;

use crate::codec::MessageStream;
use crate::config;
use crate::error::{WeftError, WeftResult};
use crate::proto::{OwnedFileReport, PeerAddr, Request, Response, TaskResult, TaskSpec};
use crate::value::Value;

/// Where an owned file can be fetched from, per the tracker.
#[derive(Debug, Clone)]
pub struct OwnedLocation {
    pub owner: PeerAddr,
    pub storage: Vec<PeerAddr>,
}

async fn round_trip(
    host: &str,
    port: u16,
    request: &Request,
    deadline: Duration,
) -> WeftResult<Response> {
    let connect = TcpStream::connect((host, port));
    let stream = with_deadline(deadline, connect)
        .await
        .map_err(|_| WeftError::Timeout)??;

    let mut stream = MessageStream::new(stream);
    with_deadline(deadline, stream.send(request))
        .await
        .map_err(|_| WeftError::Timeout)??;

    let reply = with_deadline(deadline, stream.recv::<Response>())
        .await
        .map_err(|_| WeftError::Timeout)??;

    reply.ok_or_else(|| WeftError::Codec("connection closed before reply".to_string()))
}

fn lift(response: Response) -> WeftResult<Response> {
    match response {
        Response::Error { error } => Err(WeftError::from_wire(&error)),
        other => Ok(other),
    }
}

/// Client for the tracker's registry and dispatch operations.
pub struct TrackerClient {
    host: String,
    port: u16,
    deadline: Duration,
}

impl TrackerClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            deadline: config::SOCKET_TIMEOUT,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn request(&self, request: &Request) -> WeftResult<Response> {
        lift(round_trip(&self.host, self.port, request, self.deadline).await?)
    }

    /// Returns the tracker's current peer count.
    pub async fn register(
        &self,
        ip: &str,
        port: u16,
        cpu_load: f64,
        durable_id: Option<&str>,
        old_ip: Option<&str>,
    ) -> WeftResult<i64> {
        let reply = self
            .request(&Request::Register {
                ip: ip.to_string(),
                port,
                cpu_load,
                durable_id: durable_id.map(String::from),
                old_ip: old_ip.map(String::from),
            })
            .await?;

        match reply {
            Response::Status { data, .. } => Ok(data
                .get("peer_count")
                .and_then(|v| v.as_int())
                .unwrap_or(0)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unregister(&self, ip: &str, port: u16) -> WeftResult<()> {
        self.request(&Request::Unregister {
            ip: ip.to_string(),
            port,
        })
        .await
        .map(|_| ())
    }

    pub async fn update_load(&self, ip: &str, port: u16, cpu_load: f64) -> WeftResult<()> {
        self.request(&Request::UpdateLoad {
            ip: ip.to_string(),
            port,
            cpu_load,
        })
        .await
        .map(|_| ())
    }

    /// Least-loaded live peer.
    pub async fn request_cpu(&self) -> WeftResult<(PeerAddr, f64)> {
        match self.request(&Request::RequestCpu).await? {
            Response::CpuResponse { ip, port, cpu_load } => {
                Ok((PeerAddr::new(ip, port), cpu_load))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn register_file(&self, filename: &str, ip: &str, port: u16) -> WeftResult<()> {
        self.request(&Request::RegisterFile {
            filename: filename.to_string(),
            ip: ip.to_string(),
            port,
        })
        .await
        .map(|_| ())
    }

    /// Live holders of a public replica.
    pub async fn find_file(&self, filename: &str) -> WeftResult<Vec<PeerAddr>> {
        match self
            .request(&Request::FindFile {
                filename: filename.to_string(),
            })
            .await?
        {
            Response::FilePeers { peers, .. } => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    pub async fn register_owned_file(
        &self,
        filename: &str,
        owner: &PeerAddr,
        owner_id: Option<&str>,
        storage: &PeerAddr,
    ) -> WeftResult<()> {
        self.request(&Request::RegisterOwnedFile {
            filename: filename.to_string(),
            owner_ip: owner.ip.clone(),
            owner_port: owner.port,
            owner_id: owner_id.map(String::from),
            storage_ip: storage.ip.clone(),
            storage_port: storage.port,
        })
        .await
        .map(|_| ())
    }

    pub async fn find_owned_file(
        &self,
        filename: &str,
        requester: &PeerAddr,
        requester_id: Option<&str>,
    ) -> WeftResult<OwnedLocation> {
        let reply = self
            .request(&Request::FindOwnedFile {
                filename: filename.to_string(),
                requester_ip: requester.ip.clone(),
                requester_port: requester.port,
                requester_id: requester_id.map(String::from),
            })
            .await?;

        match reply {
            Response::OwnedFileResponse {
                found,
                owner_ip,
                owner_port,
                storage_peers,
                error,
                ..
            } => {
                if !found {
                    return Err(match error {
                        Some(message) => WeftError::from_wire(&message),
                        None => WeftError::NotFound(format!("owned file {}", filename)),
                    });
                }
                let owner = match (owner_ip, owner_port) {
                    (Some(ip), Some(port)) => PeerAddr::new(ip, port),
                    _ => requester.clone(),
                };
                Ok(OwnedLocation {
                    owner,
                    storage: storage_peers,
                })
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn report_owned_files(
        &self,
        storage: &PeerAddr,
        owned_files: Vec<OwnedFileReport>,
    ) -> WeftResult<()> {
        self.request(&Request::ReportOwnedFiles {
            storage_ip: storage.ip.clone(),
            storage_port: storage.port,
            owned_files,
        })
        .await
        .map(|_| ())
    }

    /// Filenames and storage addresses of every file the requester owns.
    pub async fn list_owned_files(
        &self,
        requester: &PeerAddr,
        requester_id: Option<&str>,
    ) -> WeftResult<Vec<(String, Vec<PeerAddr>)>> {
        let reply = self
            .request(&Request::ListOwnedFiles {
                requester_ip: requester.ip.clone(),
                requester_port: requester.port,
                requester_id: requester_id.map(String::from),
            })
            .await?;

        let data = match reply {
            Response::Status { data, .. } => data,
            other => return Err(unexpected(other)),
        };

        let mut out = Vec::new();
        if let Some(files) = data.get("files").and_then(|v| v.as_list()) {
            for entry in files {
                let entry = match entry.as_map() {
                    Some(entry) => entry,
                    None => continue,
                };
                let filename = entry
                    .get("filename")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut storage = Vec::new();
                if let Some(list) = entry.get("storage_peers").and_then(|v| v.as_list()) {
                    for peer in list {
                        if let Some(peer) = peer.as_map() {
                            if let (Some(ip), Some(port)) = (
                                peer.get("ip").and_then(|v| v.as_str()),
                                peer.get("port").and_then(|v| v.as_int()),
                            ) {
                                storage.push(PeerAddr::new(ip, port as u16));
                            }
                        }
                    }
                }
                out.push((filename, storage));
            }
        }
        Ok(out)
    }

    /// Remove an ownership entry; returns the storage peers that held it.
    pub async fn delete_owned_file(
        &self,
        filename: &str,
        requester: &PeerAddr,
        requester_id: Option<&str>,
    ) -> WeftResult<Vec<PeerAddr>> {
        let reply = self
            .request(&Request::DeleteOwnedFile {
                filename: filename.to_string(),
                requester_ip: requester.ip.clone(),
                requester_port: requester.port,
                requester_id: requester_id.map(String::from),
            })
            .await?;

        match reply {
            Response::OwnedFileResponse { storage_peers, .. } => Ok(storage_peers),
            Response::Status { .. } => Ok(Vec::new()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> WeftResult<Response> {
        self.request(&Request::Status).await
    }
}

/// Client for a peer's task, memory, storage and OS-plane operations.
pub struct PeerClient {
    host: String,
    port: u16,
    deadline: Duration,
}

impl PeerClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            deadline: config::SOCKET_TIMEOUT,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }

    pub async fn request(&self, request: &Request) -> WeftResult<Response> {
        lift(round_trip(&self.host, self.port, request, self.deadline).await?)
    }

    async fn request_with_deadline(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> WeftResult<Response> {
        lift(round_trip(&self.host, self.port, request, deadline).await?)
    }

    /// Submit one task and wait for its result. The read deadline stretches
    /// to the task's own timeout plus slack, since the peer holds the
    /// connection until the task resolves.
    pub async fn submit_task(&self, task: &TaskSpec) -> WeftResult<TaskResult> {
        let task_deadline = Duration::from_secs(
            task.timeout.unwrap_or(config::TASK_TIMEOUT.as_secs()) + 5,
        );

        let reply = self
            .request_with_deadline(&Request::CpuTask(task.clone()), task_deadline)
            .await?;

        match reply {
            Response::CpuResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel_task(&self, task_id: &str) -> WeftResult<()> {
        self.request(&Request::CancelTask {
            task_id: task_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn batch(&self, tasks: Vec<TaskSpec>) -> WeftResult<Vec<TaskResult>> {
        let total: u64 = tasks
            .iter()
            .map(|t| t.timeout.unwrap_or(config::TASK_TIMEOUT.as_secs()))
            .sum();
        let deadline = Duration::from_secs(total + 5);

        match self
            .request_with_deadline(&Request::BatchTask { tasks }, deadline)
            .await?
        {
            Response::BatchResult { results } => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    pub async fn task_history(
        &self,
        limit: Option<usize>,
        task_type: Option<&str>,
        task_id: Option<&str>,
    ) -> WeftResult<Response> {
        self.request(&Request::TaskHistory {
            limit,
            task_type: task_type.map(String::from),
            task_id: task_id.map(String::from),
        })
        .await
    }

    pub async fn set_mem(&self, key: &str, value: Value) -> WeftResult<()> {
        self.request(&Request::SetMem {
            key: key.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    pub async fn get_mem(&self, key: &str) -> WeftResult<Option<Value>> {
        match self
            .request(&Request::GetMem {
                key: key.to_string(),
            })
            .await?
        {
            Response::MemResponse { value, found, .. } => {
                Ok(if found { Some(value) } else { None })
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_mem_remote(&self, key: &str, value: Value) -> WeftResult<()> {
        self.request(&Request::SetMemRemote {
            key: key.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    pub async fn get_mem_remote(&self, key: &str) -> WeftResult<Option<Value>> {
        match self
            .request(&Request::GetMemRemote {
                key: key.to_string(),
            })
            .await?
        {
            Response::MemResponse { value, found, .. } => {
                Ok(if found { Some(value) } else { None })
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_file(&self, filename: &str, data: &[u8]) -> WeftResult<()> {
        self.request(&Request::PutFile {
            filename: filename.to_string(),
            data: BASE64.encode(data),
        })
        .await
        .map(|_| ())
    }

    pub async fn get_file(&self, filename: &str) -> WeftResult<Option<Vec<u8>>> {
        match self
            .request(&Request::GetFile {
                filename: filename.to_string(),
            })
            .await?
        {
            Response::FileResponse { found, data, .. } => match (found, data) {
                (true, Some(text)) => Ok(Some(
                    BASE64
                        .decode(&text)
                        .map_err(|e| WeftError::Codec(e.to_string()))?,
                )),
                _ => Ok(None),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Hand ciphertext to a storage peer for custody.
    pub async fn upload_to_peer(
        &self,
        filename: &str,
        ciphertext: &[u8],
        owner: &PeerAddr,
        owner_id: Option<&str>,
    ) -> WeftResult<()> {
        self.request(&Request::UploadToPeer {
            filename: filename.to_string(),
            data: BASE64.encode(ciphertext),
            owner_ip: owner.ip.clone(),
            owner_port: owner.port,
            owner_id: owner_id.map(String::from),
        })
        .await
        .map(|_| ())
    }

    /// Fetch ciphertext back from a storage peer.
    pub async fn get_owned_file(
        &self,
        filename: &str,
        requester: &PeerAddr,
    ) -> WeftResult<Vec<u8>> {
        let reply = self
            .request(&Request::GetOwnedFile {
                filename: filename.to_string(),
                requester_ip: requester.ip.clone(),
                requester_port: requester.port,
            })
            .await?;

        match reply {
            Response::OwnedFileResponse {
                found: true,
                data: Some(text),
                ..
            } => BASE64
                .decode(&text)
                .map_err(|e| WeftError::Codec(e.to_string())),
            Response::OwnedFileResponse { .. } => {
                Err(WeftError::NotFound(format!("owned file {}", filename)))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_scheduler(&self, algorithm: &str) -> WeftResult<()> {
        self.request(&Request::SetScheduler {
            algorithm: algorithm.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn status(&self) -> WeftResult<Response> {
        self.request(&Request::Status).await
    }
}

fn unexpected(response: Response) -> WeftError {
    WeftError::Codec(format!("unexpected reply: {:?}", response))
}
