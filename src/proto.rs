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

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WeftError;
use crate::value::Value;

/// A peer as addressed on the wire. IP may change between restarts while the
/// port stays stable, so the port is the durable half of this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A compute job as submitted by a client. `task_id` is client-assigned;
/// a colliding id is treated as a fresh task and overwrites cache/history
/// entries keyed by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub program: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: u32,
    /// Deadline in seconds; the peer default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Estimated burst in seconds, consulted by the SJF scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_burst: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
}

/// One (filename, owner) pair a storage peer declares it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedFileReport {
    pub filename: String,
    pub owner_ip: String,
    pub owner_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Outcome of a single task, also embedded in batch replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
}

fn default_units() -> u64 {
    1
}

fn default_receiver() -> String {
    "*".to_string()
}

fn default_message_type() -> String {
    "DATA".to_string()
}

/// Every request kind a tracker or peer accepts. One request/response per
/// connection; the `type` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    // Tracker plane.
    Register {
        ip: String,
        port: u16,
        #[serde(default)]
        cpu_load: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        durable_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_ip: Option<String>,
    },
    Unregister {
        ip: String,
        port: u16,
    },
    UpdateLoad {
        ip: String,
        port: u16,
        #[serde(default)]
        cpu_load: f64,
    },
    RequestCpu,
    RegisterFile {
        filename: String,
        ip: String,
        port: u16,
    },
    FindFile {
        filename: String,
    },
    RegisterOwnedFile {
        filename: String,
        owner_ip: String,
        owner_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
        storage_ip: String,
        storage_port: u16,
    },
    FindOwnedFile {
        filename: String,
        requester_ip: String,
        requester_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester_id: Option<String>,
    },
    ReportOwnedFiles {
        storage_ip: String,
        storage_port: u16,
        #[serde(default)]
        owned_files: Vec<OwnedFileReport>,
    },
    ListOwnedFiles {
        requester_ip: String,
        requester_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester_id: Option<String>,
    },
    DeleteOwnedFile {
        filename: String,
        requester_ip: String,
        requester_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester_id: Option<String>,
    },
    Status,

    // Peer plane.
    CpuTask(TaskSpec),
    CancelTask {
        task_id: String,
    },
    BatchTask {
        tasks: Vec<TaskSpec>,
    },
    TaskHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    SetMem {
        key: String,
        #[serde(default)]
        value: Value,
    },
    GetMem {
        key: String,
    },
    SetMemRemote {
        key: String,
        #[serde(default)]
        value: Value,
    },
    GetMemRemote {
        key: String,
    },
    PutFile {
        filename: String,
        /// base64-encoded contents.
        data: String,
    },
    GetFile {
        filename: String,
    },
    UploadToPeer {
        filename: String,
        /// base64-encoded ciphertext; storage peers never see the key.
        data: String,
        owner_ip: String,
        owner_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
    },
    GetOwnedFile {
        filename: String,
        requester_ip: String,
        requester_port: u16,
    },

    // OS plane.
    CreateProcess {
        #[serde(default)]
        task_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_pid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        /// When present, also registers the process with the deadlock
        /// detector under these maximum needs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_need: Option<BTreeMap<String, u64>>,
    },
    TerminateProcess {
        pid: String,
    },
    ProcessTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root_pid: Option<String>,
    },
    CreateGroup {
        group_id: String,
        #[serde(default)]
        pids: Vec<String>,
    },
    KillGroup {
        group_id: String,
    },
    RequestResource {
        pid: String,
        resource_id: String,
        #[serde(default = "default_units")]
        units: u64,
    },
    ReleaseResource {
        pid: String,
        resource_id: String,
        #[serde(default = "default_units")]
        units: u64,
    },
    DeadlockCheck,
    AllocateMemory {
        pid: String,
        size: u64,
    },
    DeallocateMemory {
        pid: String,
    },
    CreateQueue {
        queue_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_size: Option<usize>,
    },
    SendMessage {
        queue_id: String,
        sender: String,
        #[serde(default = "default_receiver")]
        receiver: String,
        #[serde(default = "default_message_type")]
        message_type: String,
        #[serde(default)]
        data: Value,
        /// Seconds to wait for space when the queue is full.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    ReceiveMessage {
        queue_id: String,
        receiver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    CreateSemaphore {
        sem_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_value: Option<i64>,
    },
    SemaphoreWait {
        sem_id: String,
        process_id: String,
    },
    SemaphoreSignal {
        sem_id: String,
        process_id: String,
    },
    SetScheduler {
        algorithm: String,
    },
}

impl Request {
    /// Wire name of this request, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register { .. } => "REGISTER",
            Request::Unregister { .. } => "UNREGISTER",
            Request::UpdateLoad { .. } => "UPDATE_LOAD",
            Request::RequestCpu => "REQUEST_CPU",
            Request::RegisterFile { .. } => "REGISTER_FILE",
            Request::FindFile { .. } => "FIND_FILE",
            Request::RegisterOwnedFile { .. } => "REGISTER_OWNED_FILE",
            Request::FindOwnedFile { .. } => "FIND_OWNED_FILE",
            Request::ReportOwnedFiles { .. } => "REPORT_OWNED_FILES",
            Request::ListOwnedFiles { .. } => "LIST_OWNED_FILES",
            Request::DeleteOwnedFile { .. } => "DELETE_OWNED_FILE",
            Request::Status => "STATUS",
            Request::CpuTask(_) => "CPU_TASK",
            Request::CancelTask { .. } => "CANCEL_TASK",
            Request::BatchTask { .. } => "BATCH_TASK",
            Request::TaskHistory { .. } => "TASK_HISTORY",
            Request::SetMem { .. } => "SET_MEM",
            Request::GetMem { .. } => "GET_MEM",
            Request::SetMemRemote { .. } => "SET_MEM_REMOTE",
            Request::GetMemRemote { .. } => "GET_MEM_REMOTE",
            Request::PutFile { .. } => "PUT_FILE",
            Request::GetFile { .. } => "GET_FILE",
            Request::UploadToPeer { .. } => "UPLOAD_TO_PEER",
            Request::GetOwnedFile { .. } => "GET_OWNED_FILE",
            Request::CreateProcess { .. } => "CREATE_PROCESS",
            Request::TerminateProcess { .. } => "TERMINATE_PROCESS",
            Request::ProcessTree { .. } => "PROCESS_TREE",
            Request::CreateGroup { .. } => "CREATE_GROUP",
            Request::KillGroup { .. } => "KILL_GROUP",
            Request::RequestResource { .. } => "REQUEST_RESOURCE",
            Request::ReleaseResource { .. } => "RELEASE_RESOURCE",
            Request::DeadlockCheck => "DEADLOCK_CHECK",
            Request::AllocateMemory { .. } => "ALLOCATE_MEMORY",
            Request::DeallocateMemory { .. } => "DEALLOCATE_MEMORY",
            Request::CreateQueue { .. } => "CREATE_QUEUE",
            Request::SendMessage { .. } => "SEND_MESSAGE",
            Request::ReceiveMessage { .. } => "RECEIVE_MESSAGE",
            Request::CreateSemaphore { .. } => "CREATE_SEMAPHORE",
            Request::SemaphoreWait { .. } => "SEMAPHORE_WAIT",
            Request::SemaphoreSignal { .. } => "SEMAPHORE_SIGNAL",
            Request::SetScheduler { .. } => "SET_SCHEDULER",
        }
    }
}

/// Every reply kind. `Status` carries a free-form payload map flattened into
/// the frame so handlers can attach whatever detail fits the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    CpuResponse {
        ip: String,
        port: u16,
        cpu_load: f64,
    },
    FilePeers {
        filename: String,
        #[serde(default)]
        peers: Vec<PeerAddr>,
        found: bool,
    },
    OwnedFileResponse {
        filename: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        storage_peers: Vec<PeerAddr>,
        /// base64-encoded ciphertext when served by a storage peer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CpuResult(TaskResult),
    BatchResult {
        results: Vec<TaskResult>,
    },
    MemResponse {
        key: String,
        #[serde(default)]
        value: Value,
        found: bool,
    },
    FileResponse {
        filename: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
    },
    Status {
        status: String,
        #[serde(flatten)]
        data: BTreeMap<String, Value>,
    },
    Error {
        error: String,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Status {
            status: "OK".to_string(),
            data: BTreeMap::new(),
        }
    }

    pub fn status(status: impl Into<String>, data: BTreeMap<String, Value>) -> Self {
        Response::Status {
            status: status.into(),
            data,
        }
    }

    pub fn ok_with(data: BTreeMap<String, Value>) -> Self {
        Response::status("OK", data)
    }

    pub fn error(err: &WeftError) -> Self {
        Response::Error {
            error: err.wire_message(),
        }
    }

    pub fn is_ok_status(&self) -> bool {
        matches!(self, Response::Status { status, .. } if status == "OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_is_screaming_snake() {
        let req = Request::RequestCpu;
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"type":"REQUEST_CPU"}"#);

        let req = Request::GetMem {
            key: "k".to_string(),
        };
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains(r#""type":"GET_MEM""#));
    }

    #[test]
    fn cpu_task_flattens_spec_fields() {
        let req = Request::CpuTask(TaskSpec {
            task_id: "T1".to_string(),
            program: "def main(n): return n".to_string(),
            function: "main".to_string(),
            args: vec![Value::Int(7)],
            confidential: false,
            priority: 2,
            max_retries: 0,
            timeout: None,
            estimated_burst: None,
            source_peer: None,
        });

        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains(r#""type":"CPU_TASK""#));
        assert!(text.contains(r#""task_id":"T1""#));
        assert!(text.contains(r#""priority":2"#));

        match serde_json::from_str(&text).unwrap() {
            Request::CpuTask(spec) => {
                assert_eq!(spec.task_id, "T1");
                assert_eq!(spec.args, vec![Value::Int(7)]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let req: Request = serde_json::from_str(
            r#"{"type":"REQUEST_RESOURCE","pid":"P1","resource_id":"R1"}"#,
        )
        .unwrap();

        match req {
            Request::RequestResource { units, .. } => assert_eq!(units, 1),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let parsed: Result<Request, _> =
            serde_json::from_str(r#"{"type":"NO_SUCH_OP","x":1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn status_payload_flattens() {
        let mut data = BTreeMap::new();
        data.insert("peer_count".to_string(), Value::Int(3));
        let resp = Response::ok_with(data);

        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains(r#""peer_count":3"#));
        assert!(text.contains(r#""status":"OK""#));

        match serde_json::from_str(&text).unwrap() {
            Response::Status { status, data } => {
                assert_eq!(status, "OK");
                assert_eq!(data.get("peer_count"), Some(&Value::Int(3)));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
