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

//! A peer node: both server and client of the fabric. Serves compute,
//! keyed memory, public file replicas and owned-file custody; submits its
//! own work to the least-loaded peer via the tracker.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ratelimit_meter::{KeyedRateLimiter, GCRA};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout as with_deadline};

use crate::cache::{fingerprint, ResultCache};
use crate::client::{PeerClient, TrackerClient};
use crate::codec::MessageStream;
use crate::config::Config;
use crate::custody::{
    derive_keystream, random_salt, xor_transform, OwnerLedger, StorageVault,
};
use crate::error::{WeftError, WeftResult};
use crate::exec::{CancelFlag, Executor, TaskRunner};
use crate::history::{TaskHistory, TaskRecord, TaskRole, TaskStatus};
use crate::identity;
use crate::mem::MemoryStore;
use crate::os::alloc::{FitAlgorithm, MemoryAllocator};
use crate::os::deadlock::{DeadlockDetector, ResourceKind};
use crate::os::ipc::{IpcManager, IpcMessage};
use crate::os::process::{ProcessManager, ProcessState};
use crate::os_sched::{AdvancedScheduler, SchedulingAlgorithm};
use crate::proto::{OwnedFileReport, PeerAddr, Request, Response, TaskResult, TaskSpec};
use crate::quota::ResourceQuota;
use crate::sched::{RoundRobinScheduler, TaskCallback, TaskOutcome};
use crate::store::FileStorage;
use crate::value::{to_value, Value};

const HISTORY_CAPACITY: usize = 1000;
const CACHE_CAPACITY: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(3600);
const ARENA_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedMode {
    RoundRobin,
    Advanced,
}

/// Runs tasks through the executor while keeping the process table honest:
/// RUNNING while evaluating, CPU time accumulated on the owning pid.
struct PeerRunner {
    executor: Arc<Executor>,
    processes: Arc<ProcessManager>,
    task_process: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl TaskRunner for PeerRunner {
    async fn run(&self, task: &TaskSpec, cancel: &CancelFlag) -> WeftResult<Value> {
        let pid = self
            .task_process
            .lock()
            .unwrap()
            .get(&task.task_id)
            .cloned();

        if let Some(pid) = &pid {
            self.processes.set_state(pid, ProcessState::Running);
        }

        let started = std::time::Instant::now();
        let result = self.executor.run(task, cancel).await;

        if let Some(pid) = &pid {
            self.processes.add_cpu_time(pid, started.elapsed().as_secs_f64());
        }

        result
    }
}

pub struct Peer {
    addr: PeerAddr,
    durable_id: String,
    tracker: TrackerClient,

    executor: Arc<Executor>,
    memory: Arc<MemoryStore>,
    storage: Arc<FileStorage>,
    vault: Arc<StorageVault>,
    ledger: Arc<OwnerLedger>,
    history: Arc<TaskHistory>,
    cache: Arc<ResultCache>,
    quota: Arc<ResourceQuota>,
    processes: Arc<ProcessManager>,
    detector: Arc<DeadlockDetector>,
    allocator: Arc<MemoryAllocator>,
    ipc: Arc<IpcManager>,

    scheduler: Arc<RoundRobinScheduler>,
    advanced: Arc<AdvancedScheduler>,
    sched_mode: Mutex<SchedMode>,
    task_process: Arc<Mutex<HashMap<String, String>>>,

    ratelimiter: Mutex<KeyedRateLimiter<IpAddr, GCRA>>,

    task_timeout: Duration,
    socket_timeout: Duration,
    heartbeat_interval: Duration,
    max_file_size: usize,
}

impl Peer {
    pub fn new(config: &Config, ip: &str, port: u16) -> WeftResult<Arc<Self>> {
        let durable_id = identity::load_or_create(&config.peer.state_dir)?;

        let executor = Executor::shared();
        let processes = Arc::new(ProcessManager::new());
        let task_process = Arc::new(Mutex::new(HashMap::new()));

        let runner: Arc<dyn TaskRunner> = Arc::new(PeerRunner {
            executor: executor.clone(),
            processes: processes.clone(),
            task_process: task_process.clone(),
        });

        let scheduler = Arc::new(RoundRobinScheduler::new(runner.clone()));
        scheduler.start();
        let advanced = Arc::new(AdvancedScheduler::new(SchedulingAlgorithm::Fcfs, runner));

        let detector = Arc::new(DeadlockDetector::new());
        detector.register_resource("CPU", ResourceKind::Cpu, 4);
        detector.register_resource("MEMORY", ResourceKind::Memory, 1000);
        detector.register_resource("DISK", ResourceKind::Disk, 10);

        let rate_limit = NonZeroU32::new(config.general.rate_limit.max(1))
            .ok_or_else(|| WeftError::Validation("rate_limit must be positive".to_string()))?;

        Ok(Arc::new(Self {
            addr: PeerAddr::new(ip, port),
            durable_id,
            tracker: TrackerClient::new(config.tracker.host.clone(), config.tracker.port),

            executor,
            memory: Arc::new(MemoryStore::new()),
            storage: Arc::new(FileStorage::new(&config.peer.storage_dir)?),
            vault: Arc::new(StorageVault::new(&config.peer.owned_storage_dir)?),
            ledger: Arc::new(OwnerLedger::load(&config.peer.state_dir)?),
            history: Arc::new(TaskHistory::new(HISTORY_CAPACITY)),
            cache: Arc::new(ResultCache::new(CACHE_CAPACITY, CACHE_TTL)),
            quota: Arc::new(ResourceQuota::new(
                config.limits.max_cpu_tasks,
                config.quota_window(),
                config.limits.max_memory_keys,
                config.limits.max_storage_mb,
            )),
            processes,
            detector,
            allocator: Arc::new(MemoryAllocator::new(ARENA_BYTES, FitAlgorithm::FirstFit)),
            ipc: Arc::new(IpcManager::new()),

            scheduler,
            advanced,
            sched_mode: Mutex::new(SchedMode::RoundRobin),
            task_process,

            ratelimiter: Mutex::new(KeyedRateLimiter::new(
                rate_limit,
                Duration::from_secs(5),
            )),

            task_timeout: config.task_timeout(),
            socket_timeout: config.socket_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_file_size: config.limits.max_file_size,
        }))
    }

    /// Bind the listener, sync with the tracker, and spawn the serve and
    /// heartbeat loops. Returns once the peer is serving.
    pub async fn start(config: Config, ip: &str) -> WeftResult<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", config.peer.port)).await?;
        let port = listener.local_addr()?.port();

        let peer = Self::new(&config, ip, port)?;

        peer.startup_sync().await;
        peer.clone().spawn_serve(listener);
        peer.clone().spawn_heartbeat();

        info!("Peer started (addr = {})", peer.addr);
        Ok(peer)
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn durable_id(&self) -> &str {
        &self.durable_id
    }

    /// Register, re-announce public files, and report custodial holdings so
    /// a restarted tracker can rebuild its registry.
    async fn startup_sync(&self) {
        match self
            .tracker
            .register(
                &self.addr.ip,
                self.addr.port,
                self.current_load(),
                Some(&self.durable_id),
                None,
            )
            .await
        {
            Ok(count) => info!("Registered with tracker (peer_count = {})", count),
            Err(e) => warn!("Failed to register with tracker: {}", e),
        }

        for filename in self.storage.list_files() {
            if let Err(e) = self
                .tracker
                .register_file(&filename, &self.addr.ip, self.addr.port)
                .await
            {
                debug!("Failed to register file with tracker: {}", e);
            }
        }

        self.vault.reconstruct();
        let holdings = self.vault.holdings();
        if !holdings.is_empty() {
            let reports: Vec<OwnedFileReport> = holdings
                .into_iter()
                .map(|(filename, owner)| OwnedFileReport {
                    filename,
                    owner_ip: owner.ip,
                    owner_port: owner.port,
                    owner_id: None,
                })
                .collect();

            if let Err(e) = self.tracker.report_owned_files(&self.addr, reports).await {
                debug!("Failed to report owned files: {}", e);
            }
        }
    }

    fn spawn_serve(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                };

                debug!("Connection accepted (addr = {})", addr);

                let peer = self.clone();
                tokio::spawn(async move {
                    peer.handle_connection(stream, addr.ip()).await;
                });
            }
        });
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                sleep(self.heartbeat_interval).await;

                let load = self.current_load();
                if let Err(e) = self
                    .tracker
                    .update_load(&self.addr.ip, self.addr.port, load)
                    .await
                {
                    debug!("Error sending heartbeat: {}", e);
                }
            }
        });
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, source: IpAddr) {
        let mut stream = MessageStream::new(stream);

        let request: Request = match with_deadline(self.socket_timeout, stream.recv()).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!("Bad frame (addr = {}): {}", source, e);
                let error = match e {
                    WeftError::Codec(message) if message.contains("unknown variant") => {
                        WeftError::UnknownMessageType(message)
                    }
                    other => other,
                };
                let _ = with_deadline(
                    self.socket_timeout,
                    stream.send(&Response::error(&error)),
                )
                .await;
                return;
            }
            Err(_) => return,
        };

        if self.ratelimiter.lock().unwrap().check(source).is_err() {
            warn!("Peer exceeded ratelimit (addr = {})", source);
            let _ = with_deadline(
                self.socket_timeout,
                stream.send(&Response::error(&WeftError::Ratelimited)),
            )
            .await;
            return;
        }

        debug!("Received {} (addr = {})", request.kind(), source);

        let response = self.process(request).await;

        // Task replies can outlast the per-socket deadline; the write
        // itself still gets one.
        if let Err(e) = with_deadline(self.socket_timeout, stream.send(&response)).await {
            debug!("Reply not delivered (addr = {}): {:?}", source, e);
        }
    }

    async fn process(self: &Arc<Self>, request: Request) -> Response {
        match request {
            Request::CpuTask(spec) => self.handle_cpu_task(spec).await,
            Request::CancelTask { task_id } => self.handle_cancel(&task_id),
            Request::BatchTask { tasks } => self.handle_batch(tasks).await,
            Request::TaskHistory {
                limit,
                task_type,
                task_id,
            } => self.handle_task_history(limit, task_type, task_id),
            Request::SetMem { key, value } | Request::SetMemRemote { key, value } => {
                self.handle_set_mem(&key, value)
            }
            Request::GetMem { key } | Request::GetMemRemote { key } => {
                self.handle_get_mem(&key)
            }
            Request::PutFile { filename, data } => self.handle_put_file(&filename, &data).await,
            Request::GetFile { filename } => self.handle_get_file(&filename),
            Request::UploadToPeer {
                filename,
                data,
                owner_ip,
                owner_port,
                owner_id,
            } => {
                self.handle_upload_to_peer(&filename, &data, PeerAddr::new(owner_ip, owner_port), owner_id)
                    .await
            }
            Request::GetOwnedFile {
                filename,
                requester_ip,
                requester_port,
            } => self.handle_get_owned_file(&filename, PeerAddr::new(requester_ip, requester_port)),
            Request::Status => self.handle_status(),

            Request::CreateProcess {
                task_data,
                parent_pid,
                group_id,
                max_need,
            } => self.handle_create_process(task_data, parent_pid, group_id, max_need),
            Request::TerminateProcess { pid } => {
                if self.processes.terminate_process(&pid) {
                    self.detector.unregister_process(&pid);
                    let mut data = BTreeMap::new();
                    data.insert("pid".to_string(), Value::from(pid));
                    Response::ok_with(data)
                } else {
                    Response::error(&WeftError::NotFound(format!("process {}", pid)))
                }
            }
            Request::ProcessTree { root_pid } => {
                match self.processes.process_tree(root_pid.as_deref()) {
                    Some(tree) => {
                        let mut data = BTreeMap::new();
                        data.insert("tree".to_string(), tree);
                        Response::ok_with(data)
                    }
                    None => Response::error(&WeftError::NotFound(
                        root_pid.unwrap_or_else(|| "process tree".to_string()),
                    )),
                }
            }
            Request::CreateGroup { group_id, pids } => {
                self.processes.create_group(&group_id, &pids);
                let mut data = BTreeMap::new();
                data.insert("group_id".to_string(), Value::from(group_id));
                Response::ok_with(data)
            }
            Request::KillGroup { group_id } => {
                let terminated = self.processes.kill_group(&group_id);
                let mut data = BTreeMap::new();
                data.insert("group_id".to_string(), Value::from(group_id));
                data.insert("terminated".to_string(), Value::from(terminated));
                Response::ok_with(data)
            }
            Request::RequestResource {
                pid,
                resource_id,
                units,
            } => match self.detector.request(&pid, &resource_id, units) {
                Ok(()) => {
                    let mut data = BTreeMap::new();
                    data.insert("pid".to_string(), Value::from(pid));
                    data.insert("resource_id".to_string(), Value::from(resource_id));
                    data.insert("units".to_string(), Value::from(units as i64));
                    Response::ok_with(data)
                }
                Err(e) => Response::error(&e),
            },
            Request::ReleaseResource {
                pid,
                resource_id,
                units,
            } => match self.detector.release(&pid, &resource_id, units) {
                Ok(()) => {
                    let mut data = BTreeMap::new();
                    data.insert("pid".to_string(), Value::from(pid));
                    data.insert("resource_id".to_string(), Value::from(resource_id));
                    Response::ok_with(data)
                }
                Err(e) => Response::error(&e),
            },
            Request::DeadlockCheck => {
                let (deadlock, processes) = self.detector.detect();
                let mut data = BTreeMap::new();
                data.insert("deadlock".to_string(), Value::from(deadlock));
                data.insert(
                    "deadlocked_processes".to_string(),
                    Value::List(processes.into_iter().map(Value::from).collect()),
                );
                Response::ok_with(data)
            }
            Request::AllocateMemory { pid, size } => {
                match self.allocator.allocate(&pid, size) {
                    Ok(address) => {
                        let mut data = BTreeMap::new();
                        data.insert("pid".to_string(), Value::from(pid));
                        data.insert("address".to_string(), Value::from(address as i64));
                        data.insert("size".to_string(), Value::from(size as i64));
                        Response::ok_with(data)
                    }
                    Err(e) => Response::error(&e),
                }
            }
            Request::DeallocateMemory { pid } => match self.allocator.deallocate(&pid) {
                Ok(()) => {
                    let mut data = BTreeMap::new();
                    data.insert("pid".to_string(), Value::from(pid));
                    Response::ok_with(data)
                }
                Err(e) => Response::error(&e),
            },
            Request::CreateQueue { queue_id, max_size } => {
                if self.ipc.create_queue(&queue_id, max_size) {
                    let mut data = BTreeMap::new();
                    data.insert("queue_id".to_string(), Value::from(queue_id));
                    Response::ok_with(data)
                } else {
                    Response::error(&WeftError::Validation(format!(
                        "queue {} already exists",
                        queue_id
                    )))
                }
            }
            Request::SendMessage {
                queue_id,
                sender,
                receiver,
                message_type,
                data,
                timeout,
            } => {
                self.handle_send_message(&queue_id, sender, receiver, message_type, data, timeout)
                    .await
            }
            Request::ReceiveMessage {
                queue_id,
                receiver,
                timeout,
            } => self.handle_receive_message(&queue_id, &receiver, timeout).await,
            Request::CreateSemaphore {
                sem_id,
                initial_value,
            } => {
                if self.ipc.create_semaphore(&sem_id, initial_value.unwrap_or(1)) {
                    let mut data = BTreeMap::new();
                    data.insert("sem_id".to_string(), Value::from(sem_id));
                    Response::ok_with(data)
                } else {
                    Response::error(&WeftError::Validation(format!(
                        "semaphore {} already exists",
                        sem_id
                    )))
                }
            }
            Request::SemaphoreWait { sem_id, process_id } => {
                match self.ipc.semaphore(&sem_id) {
                    Some(sem) => {
                        let acquired = sem.wait(&process_id);
                        let mut data = BTreeMap::new();
                        data.insert("sem_id".to_string(), Value::from(sem_id));
                        data.insert("value".to_string(), Value::from(sem.value()));
                        Response::status(if acquired { "OK" } else { "BLOCKED" }, data)
                    }
                    None => Response::error(&WeftError::NotFound(format!(
                        "semaphore {}",
                        sem_id
                    ))),
                }
            }
            Request::SemaphoreSignal { sem_id, process_id } => {
                match self.ipc.semaphore(&sem_id) {
                    Some(sem) => {
                        let woken = sem.signal(&process_id);
                        let mut data = BTreeMap::new();
                        data.insert("sem_id".to_string(), Value::from(sem_id));
                        data.insert("value".to_string(), Value::from(sem.value()));
                        if let Some(pid) = woken {
                            data.insert("woken".to_string(), Value::from(pid));
                        }
                        Response::ok_with(data)
                    }
                    None => Response::error(&WeftError::NotFound(format!(
                        "semaphore {}",
                        sem_id
                    ))),
                }
            }
            Request::SetScheduler { algorithm } => self.handle_set_scheduler(&algorithm),

            other => Response::error(&WeftError::UnknownMessageType(other.kind().to_string())),
        }
    }

    fn current_load(&self) -> f64 {
        match *self.sched_mode.lock().unwrap() {
            SchedMode::RoundRobin => self.scheduler.load(),
            SchedMode::Advanced => self.advanced.load(),
        }
    }

    fn submit_to_scheduler(&self, spec: TaskSpec, callback: TaskCallback) {
        match *self.sched_mode.lock().unwrap() {
            SchedMode::RoundRobin => {
                self.scheduler.submit(spec, callback);
            }
            SchedMode::Advanced => {
                self.advanced.submit(spec, callback);
            }
        }
    }

    /// The task ingestion pipeline: cache probe, quota gate, process entry,
    /// scheduler submission, bounded wait for the completion callback.
    async fn handle_cpu_task(self: &Arc<Self>, spec: TaskSpec) -> Response {
        let executed_by = self.addr.to_string();
        let requested_by = spec
            .source_peer
            .clone()
            .unwrap_or_else(|| executed_by.clone());
        let task_id = spec.task_id.clone();

        let key = fingerprint(&spec.program, &spec.function, &spec.args);
        if let Some(result) = self.cache.get(&key) {
            info!("Cache hit (task = {})", task_id);
            self.history.record(
                TaskRecord::new(&task_id, "CPU_TASK", TaskStatus::Success)
                    .execution_time(0.0)
                    .executed_by(&executed_by)
                    .requested_by(&requested_by)
                    .role(TaskRole::Executor)
                    .result_text(result.canonical()),
            );
            return Response::CpuResult(TaskResult {
                task_id,
                result,
                error: None,
                executed_by: Some(executed_by),
            });
        }

        if let Err(e) = self.quota.check_cpu_quota() {
            self.history.record(
                TaskRecord::new(&task_id, "CPU_TASK", TaskStatus::Failed)
                    .executed_by(&executed_by)
                    .requested_by(&requested_by)
                    .role(TaskRole::Executor)
                    .error_text(e.wire_message()),
            );
            return Response::CpuResult(TaskResult {
                task_id,
                result: Value::Null,
                error: Some(e.wire_message()),
                executed_by: Some(executed_by),
            });
        }

        let mut task_data = BTreeMap::new();
        task_data.insert("task_id".to_string(), Value::from(task_id.as_str()));
        task_data.insert("function".to_string(), Value::from(spec.function.as_str()));
        task_data.insert("priority".to_string(), Value::Int(spec.priority as i64));
        task_data.insert(
            "source_peer".to_string(),
            Value::from(requested_by.as_str()),
        );
        task_data.insert("confidential".to_string(), Value::from(spec.confidential));

        let pid = self
            .processes
            .create_process(Value::Map(task_data), None, None);
        self.processes.set_state(&pid, ProcessState::Ready);
        self.task_process
            .lock()
            .unwrap()
            .insert(task_id.clone(), pid);

        let (tx, rx) = oneshot::channel::<TaskResult>();
        let callback = self.completion_callback(&key, &executed_by, &requested_by, tx);

        let deadline = spec
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.task_timeout);

        self.submit_to_scheduler(spec, callback);

        match with_deadline(deadline, rx).await {
            Ok(Ok(result)) => Response::CpuResult(result),
            _ => {
                let e = WeftError::Timeout;
                self.history.record(
                    TaskRecord::new(&task_id, "CPU_TASK", TaskStatus::Failed)
                        .execution_time(deadline.as_secs_f64())
                        .executed_by(&executed_by)
                        .requested_by(&requested_by)
                        .role(TaskRole::Executor)
                        .error_text(e.wire_message()),
                );
                if let Some(pid) = self.task_process.lock().unwrap().remove(&task_id) {
                    self.processes.set_state(&pid, ProcessState::Terminated);
                }
                Response::CpuResult(TaskResult {
                    task_id,
                    result: Value::Null,
                    error: Some(e.wire_message()),
                    executed_by: Some(executed_by),
                })
            }
        }
    }

    /// Completion bookkeeping shared by every scheduled task: history,
    /// process teardown, cache insertion, and the one-shot reply signal.
    fn completion_callback(
        self: &Arc<Self>,
        cache_key: &str,
        executed_by: &str,
        requested_by: &str,
        tx: oneshot::Sender<TaskResult>,
    ) -> TaskCallback {
        let history = self.history.clone();
        let cache = self.cache.clone();
        let processes = self.processes.clone();
        let task_process = self.task_process.clone();
        let detector = self.detector.clone();
        let cache_key = cache_key.to_string();
        let executed_by = executed_by.to_string();
        let requested_by = requested_by.to_string();

        Box::new(move |outcome: TaskOutcome| {
            let TaskOutcome {
                task_id,
                result,
                execution_time,
            } = outcome;

            let task_result = match result {
                Ok(value) => {
                    history.record(
                        TaskRecord::new(&task_id, "CPU_TASK", TaskStatus::Success)
                            .execution_time(execution_time.as_secs_f64())
                            .executed_by(&executed_by)
                            .requested_by(&requested_by)
                            .role(TaskRole::Executor)
                            .result_text(value.canonical()),
                    );
                    cache.put(&cache_key, value.clone());
                    TaskResult {
                        task_id: task_id.clone(),
                        result: value,
                        error: None,
                        executed_by: Some(executed_by.clone()),
                    }
                }
                Err(e) => {
                    history.record(
                        TaskRecord::new(&task_id, "CPU_TASK", TaskStatus::Failed)
                            .execution_time(execution_time.as_secs_f64())
                            .executed_by(&executed_by)
                            .requested_by(&requested_by)
                            .role(TaskRole::Executor)
                            .error_text(e.wire_message()),
                    );
                    TaskResult {
                        task_id: task_id.clone(),
                        result: Value::Null,
                        error: Some(e.wire_message()),
                        executed_by: Some(executed_by.clone()),
                    }
                }
            };

            if let Some(pid) = task_process.lock().unwrap().remove(&task_id) {
                processes.set_state(&pid, ProcessState::Terminated);
                detector.unregister_process(&pid);
            }

            let _ = tx.send(task_result);
        })
    }

    fn handle_cancel(&self, task_id: &str) -> Response {
        let cancelled = match *self.sched_mode.lock().unwrap() {
            SchedMode::RoundRobin => self.scheduler.cancel_task(task_id),
            SchedMode::Advanced => self.advanced.cancel_task(task_id),
        };

        if cancelled {
            let mut data = BTreeMap::new();
            data.insert("task_id".to_string(), Value::from(task_id));
            Response::status("CANCELLED", data)
        } else {
            Response::error(&WeftError::NotFound(format!(
                "task {} not found or already completed",
                task_id
            )))
        }
    }

    async fn handle_batch(self: &Arc<Self>, tasks: Vec<TaskSpec>) -> Response {
        if tasks.is_empty() {
            return Response::error(&WeftError::Validation("no tasks provided".to_string()));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.handle_cpu_task(task).await {
                Response::CpuResult(result) => results.push(result),
                Response::Error { error } => results.push(TaskResult {
                    task_id: String::new(),
                    result: Value::Null,
                    error: Some(error),
                    executed_by: Some(self.addr.to_string()),
                }),
                other => {
                    return Response::error(&WeftError::Codec(format!(
                        "unexpected batch element reply: {:?}",
                        other
                    )))
                }
            }
        }

        Response::BatchResult { results }
    }

    fn handle_task_history(
        &self,
        limit: Option<usize>,
        task_type: Option<String>,
        task_id: Option<String>,
    ) -> Response {
        if let Some(task_id) = task_id {
            return match self.history.task_info(&task_id) {
                Some(record) => {
                    let mut data = BTreeMap::new();
                    data.insert("task".to_string(), to_value(&record));
                    Response::ok_with(data)
                }
                None => Response::error(&WeftError::NotFound(format!("task {}", task_id))),
            };
        }

        let records = self
            .history
            .history(limit.unwrap_or(100), task_type.as_deref());
        let mut data = BTreeMap::new();
        data.insert(
            "history".to_string(),
            Value::List(records.iter().map(to_value).collect()),
        );
        data.insert("statistics".to_string(), to_value(&self.history.stats()));
        Response::ok_with(data)
    }

    fn handle_set_mem(&self, key: &str, value: Value) -> Response {
        // Overwrites do not grow the key count.
        let projected = self.memory.key_count() + if self.memory.get(key).is_some() { 0 } else { 1 };
        if let Err(e) = self.quota.check_memory_quota(projected) {
            return Response::error(&e);
        }

        self.memory.set(key, value);
        let mut data = BTreeMap::new();
        data.insert("operation".to_string(), Value::from("SET_MEM"));
        data.insert("key".to_string(), Value::from(key));
        Response::ok_with(data)
    }

    fn handle_get_mem(&self, key: &str) -> Response {
        let value = self.memory.get(key);
        Response::MemResponse {
            key: key.to_string(),
            found: value.is_some(),
            value: value.unwrap_or(Value::Null),
        }
    }

    async fn handle_put_file(&self, filename: &str, data_b64: &str) -> Response {
        let data = match BASE64.decode(data_b64) {
            Ok(data) => data,
            Err(e) => {
                return Response::error(&WeftError::Validation(format!(
                    "invalid base64 payload: {}",
                    e
                )))
            }
        };

        if data.len() > self.max_file_size {
            return Response::error(&WeftError::Validation(format!(
                "file too large (max {} bytes)",
                self.max_file_size
            )));
        }
        if let Err(e) = self.quota.check_storage_quota(data.len() as u64) {
            return Response::error(&e);
        }

        if let Err(e) = self.storage.put_file(filename, &data) {
            self.quota.release_storage(data.len() as u64);
            return Response::error(&e);
        }

        if let Err(e) = self
            .tracker
            .register_file(filename, &self.addr.ip, self.addr.port)
            .await
        {
            debug!("Failed to register file with tracker: {}", e);
        }

        let mut response = BTreeMap::new();
        response.insert("operation".to_string(), Value::from("PUT_FILE"));
        response.insert("filename".to_string(), Value::from(filename));
        response.insert("size".to_string(), Value::from(data.len()));
        Response::ok_with(response)
    }

    fn handle_get_file(&self, filename: &str) -> Response {
        // Custodial files are never served over the public path, even when
        // a public file of the same name exists.
        if self.vault.holds(filename) {
            return Response::error(&WeftError::OwnedFileForbidden);
        }

        match self.storage.get_file(filename) {
            Ok(Some(data)) => Response::FileResponse {
                filename: filename.to_string(),
                found: true,
                size: Some(data.len()),
                data: Some(BASE64.encode(&data)),
            },
            Ok(None) => Response::FileResponse {
                filename: filename.to_string(),
                found: false,
                data: None,
                size: None,
            },
            Err(e) => Response::error(&e),
        }
    }

    async fn handle_upload_to_peer(
        &self,
        filename: &str,
        data_b64: &str,
        owner: PeerAddr,
        owner_id: Option<String>,
    ) -> Response {
        let ciphertext = match BASE64.decode(data_b64) {
            Ok(data) => data,
            Err(e) => {
                return Response::error(&WeftError::Validation(format!(
                    "invalid base64 payload: {}",
                    e
                )))
            }
        };

        if ciphertext.len() > self.max_file_size {
            return Response::error(&WeftError::Validation(format!(
                "file too large (max {} bytes)",
                self.max_file_size
            )));
        }

        if let Err(e) = self.vault.store(filename, &owner, &ciphertext) {
            return Response::error(&e);
        }

        if let Err(e) = self
            .tracker
            .register_owned_file(filename, &owner, owner_id.as_deref(), &self.addr)
            .await
        {
            debug!("Failed to register owned file with tracker: {}", e);
        }

        let mut data = BTreeMap::new();
        data.insert("filename".to_string(), Value::from(filename));
        data.insert("size".to_string(), Value::from(ciphertext.len()));
        Response::ok_with(data)
    }

    fn handle_get_owned_file(&self, filename: &str, requester: PeerAddr) -> Response {
        match self.vault.retrieve(filename, &requester) {
            Ok(ciphertext) => Response::OwnedFileResponse {
                filename: filename.to_string(),
                found: true,
                owner_ip: None,
                owner_port: None,
                storage_peers: Vec::new(),
                size: Some(ciphertext.len()),
                data: Some(BASE64.encode(&ciphertext)),
                error: None,
            },
            Err(e) => Response::error(&e),
        }
    }

    fn handle_create_process(
        &self,
        task_data: Value,
        parent_pid: Option<String>,
        group_id: Option<String>,
        max_need: Option<BTreeMap<String, u64>>,
    ) -> Response {
        let pid =
            self.processes
                .create_process(task_data, parent_pid.as_deref(), group_id.as_deref());

        if let Some(max_need) = max_need {
            self.detector.register_process(&pid, max_need);
        }

        let mut data = BTreeMap::new();
        data.insert("pid".to_string(), Value::from(pid));
        Response::ok_with(data)
    }

    async fn handle_send_message(
        &self,
        queue_id: &str,
        sender: String,
        receiver: String,
        message_type: String,
        data: Value,
        timeout: Option<f64>,
    ) -> Response {
        let queue = match self.ipc.queue(queue_id) {
            Some(queue) => queue,
            None => {
                return Response::error(&WeftError::NotFound(format!("queue {}", queue_id)))
            }
        };

        let message = IpcMessage {
            message_id: String::new(),
            sender,
            receiver,
            message_type,
            data,
        };

        match queue
            .send(message, timeout.map(Duration::from_secs_f64))
            .await
        {
            Ok(message_id) => {
                let mut data = BTreeMap::new();
                data.insert("message_id".to_string(), Value::from(message_id));
                Response::ok_with(data)
            }
            Err(e) => Response::error(&e),
        }
    }

    async fn handle_receive_message(
        &self,
        queue_id: &str,
        receiver: &str,
        timeout: Option<f64>,
    ) -> Response {
        let queue = match self.ipc.queue(queue_id) {
            Some(queue) => queue,
            None => {
                return Response::error(&WeftError::NotFound(format!("queue {}", queue_id)))
            }
        };

        match queue
            .receive(receiver, timeout.map(Duration::from_secs_f64))
            .await
        {
            Some(message) => {
                let mut data = BTreeMap::new();
                data.insert("sender".to_string(), Value::from(message.sender));
                data.insert(
                    "message_type".to_string(),
                    Value::from(message.message_type),
                );
                data.insert("data".to_string(), message.data);
                data.insert("message_id".to_string(), Value::from(message.message_id));
                Response::ok_with(data)
            }
            None => Response::error(&WeftError::NotFound("no message received".to_string())),
        }
    }

    /// Swap the round-robin scheduler for the pluggable one, or change the
    /// algorithm if the swap already happened. Pending tasks migrate; the
    /// change loses nothing.
    fn handle_set_scheduler(&self, algorithm: &str) -> Response {
        let algorithm: SchedulingAlgorithm = match algorithm.parse() {
            Ok(algorithm) => algorithm,
            Err(e) => return Response::error(&e),
        };

        let mut mode = self.sched_mode.lock().unwrap();
        match *mode {
            SchedMode::RoundRobin => {
                self.scheduler.stop();
                let pending = self.scheduler.drain_pending();
                let migrated = pending.len();
                self.advanced.set_algorithm(algorithm);
                self.advanced.start();
                for (task, callback) in pending {
                    self.advanced.submit(task, callback);
                }
                *mode = SchedMode::Advanced;
                info!(
                    "Scheduler swapped (algorithm = {:?}) (migrated = {})",
                    algorithm, migrated
                );
            }
            SchedMode::Advanced => self.advanced.set_algorithm(algorithm),
        }

        let mut data = BTreeMap::new();
        data.insert("algorithm".to_string(), to_value(&algorithm));
        Response::ok_with(data)
    }

    fn handle_status(&self) -> Response {
        let mode = *self.sched_mode.lock().unwrap();

        let mut scheduler = BTreeMap::new();
        match mode {
            SchedMode::RoundRobin => {
                scheduler.insert("type".to_string(), Value::from("round_robin"));
                scheduler.insert("stats".to_string(), to_value(&self.scheduler.stats()));
            }
            SchedMode::Advanced => {
                scheduler.insert("type".to_string(), Value::from("advanced"));
                scheduler.insert("stats".to_string(), to_value(&self.advanced.stats()));
            }
        }

        let mut data = BTreeMap::new();
        data.insert("peer_ip".to_string(), Value::from(self.addr.ip.as_str()));
        data.insert("peer_port".to_string(), Value::from(self.addr.port as i64));
        data.insert(
            "durable_id".to_string(),
            Value::from(self.durable_id.as_str()),
        );
        data.insert("scheduler".to_string(), Value::Map(scheduler));
        data.insert("memory".to_string(), to_value(&self.memory.stats()));
        data.insert("storage".to_string(), to_value(&self.storage.stats()));
        data.insert("executor".to_string(), to_value(&self.executor.stats()));
        data.insert("task_history".to_string(), to_value(&self.history.stats()));
        data.insert("cache".to_string(), to_value(&self.cache.stats()));
        data.insert("quota".to_string(), to_value(&self.quota.usage()));
        data.insert(
            "process_manager".to_string(),
            to_value(&self.processes.stats()),
        );
        data.insert(
            "deadlock_detector".to_string(),
            to_value(&self.detector.status()),
        );
        data.insert(
            "memory_allocator".to_string(),
            to_value(&self.allocator.stats()),
        );
        data.insert("ipc".to_string(), to_value(&self.ipc.stats()));
        data.insert(
            "owned_files".to_string(),
            Value::List(
                self.ledger
                    .filenames()
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            ),
        );
        data.insert(
            "stored_for_others".to_string(),
            Value::from(self.vault.file_count()),
        );

        Response::ok_with(data)
    }

    // ------------------------------------------------------------------
    // Client-side operations: this peer acting as a fabric participant.
    // ------------------------------------------------------------------

    /// Submit a task to the fabric. Confidential tasks run here and are
    /// never forwarded; everything else goes to the tracker's least-loaded
    /// pick.
    pub async fn submit_task(self: &Arc<Self>, mut spec: TaskSpec) -> WeftResult<TaskResult> {
        spec.source_peer = Some(self.addr.to_string());

        if spec.confidential {
            info!("Executing confidential task locally (task = {})", spec.task_id);
            return match self.handle_cpu_task(spec).await {
                Response::CpuResult(result) => Ok(result),
                Response::Error { error } => Err(WeftError::from_wire(&error)),
                other => Err(WeftError::Codec(format!("unexpected reply: {:?}", other))),
            };
        }

        let task_id = spec.task_id.clone();
        let (best, _) = self.tracker.request_cpu().await?;
        info!(
            "Dispatching task (task = {}) (target = {})",
            task_id, best
        );

        let client = PeerClient::new(best.ip.clone(), best.port);
        let result = client.submit_task(&spec).await?;

        let status = if result.error.is_none() {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        let executed_by = result
            .executed_by
            .clone()
            .unwrap_or_else(|| best.to_string());
        let mut record = TaskRecord::new(&task_id, "CPU_TASK", status)
            .executed_by(executed_by)
            .requested_by(self.addr.to_string())
            .role(TaskRole::Client);
        if let Some(error) = &result.error {
            record = record.error_text(error.clone());
        } else {
            record = record.result_text(result.result.canonical());
        }
        self.history.record(record);

        Ok(result)
    }

    /// Encrypt and place a file on up to `replication` of the given storage
    /// peers. Success means at least one acknowledged; partial failures are
    /// reported alongside.
    pub async fn upload_owned_file(
        &self,
        filename: &str,
        data: &[u8],
        targets: &[PeerAddr],
        replication: usize,
    ) -> WeftResult<(Vec<PeerAddr>, Vec<String>)> {
        if data.is_empty() {
            return Err(WeftError::Validation("no file data provided".to_string()));
        }
        if data.len() > self.max_file_size {
            return Err(WeftError::Validation(format!(
                "file too large (max {} bytes)",
                self.max_file_size
            )));
        }

        let salt = random_salt();
        let key = derive_keystream(&self.durable_id, &salt);
        let ciphertext = xor_transform(data, &key);

        let mut placed = Vec::new();
        let mut errors = Vec::new();

        for target in targets.iter().take(replication.max(1)) {
            let client = PeerClient::new(target.ip.clone(), target.port);
            match client
                .upload_to_peer(filename, &ciphertext, &self.addr, Some(&self.durable_id))
                .await
            {
                Ok(()) => {
                    placed.push(target.clone());
                    if let Err(e) = self
                        .tracker
                        .register_owned_file(
                            filename,
                            &self.addr,
                            Some(&self.durable_id),
                            target,
                        )
                        .await
                    {
                        debug!("Failed to register owned file with tracker: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Failed to upload to {}: {}", target, e);
                    errors.push(format!("{}: {}", target, e));
                }
            }
        }

        if placed.is_empty() {
            return Err(WeftError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to upload to any peer: {}", errors.join(", ")),
            )));
        }

        self.ledger.record(filename, &salt, placed.clone());
        Ok((placed, errors))
    }

    /// Fetch an owned file back: tracker discovery, storage peers tried in
    /// order, ciphertext decoded with the persisted salt.
    pub async fn download_owned_file(&self, filename: &str) -> WeftResult<Vec<u8>> {
        let meta = self.ledger.meta(filename).ok_or_else(|| {
            WeftError::NotFound(format!("no custody record for {}", filename))
        })?;

        let location = self
            .tracker
            .find_owned_file(filename, &self.addr, Some(&self.durable_id))
            .await?;

        let key = derive_keystream(&self.durable_id, &meta.salt);

        for storage in &location.storage {
            let client = PeerClient::new(storage.ip.clone(), storage.port);
            match client.get_owned_file(filename, &self.addr).await {
                Ok(ciphertext) => {
                    info!(
                        "Downloaded owned file (name = {}) (storage = {})",
                        filename, storage
                    );
                    return Ok(xor_transform(&ciphertext, &key));
                }
                Err(e) => {
                    debug!("Failed to download from {}: {}", storage, e);
                }
            }
        }

        Err(WeftError::NotFound(format!(
            "no storage peer served {}",
            filename
        )))
    }

    pub async fn list_owned_files(&self) -> WeftResult<Vec<(String, Vec<PeerAddr>)>> {
        self.tracker
            .list_owned_files(&self.addr, Some(&self.durable_id))
            .await
    }

    /// Drop the ownership record at the tracker and locally.
    pub async fn delete_owned_file(&self, filename: &str) -> WeftResult<Vec<PeerAddr>> {
        let storage = self
            .tracker
            .delete_owned_file(filename, &self.addr, Some(&self.durable_id))
            .await?;
        self.ledger.remove(filename);
        Ok(storage)
    }

    pub async fn find_file_on_network(&self, filename: &str) -> WeftResult<Vec<PeerAddr>> {
        self.tracker.find_file(filename).await
    }

    /// Download a public file, trying live holders in order.
    pub async fn download_file_from_network(&self, filename: &str) -> WeftResult<Vec<u8>> {
        let holders = self.tracker.find_file(filename).await?;
        if holders.is_empty() {
            return Err(WeftError::NotFound(format!(
                "file {} not found on any peer",
                filename
            )));
        }

        for holder in &holders {
            let client = PeerClient::new(holder.ip.clone(), holder.port);
            match client.get_file(filename).await {
                Ok(Some(data)) => return Ok(data),
                Ok(None) => continue,
                Err(e) => debug!("Failed to download from {}: {}", holder, e),
            }
        }

        Err(WeftError::NotFound(format!(
            "no holder served {}",
            filename
        )))
    }

    pub async fn set_remote_memory(
        &self,
        target: &PeerAddr,
        key: &str,
        value: Value,
    ) -> WeftResult<()> {
        PeerClient::new(target.ip.clone(), target.port)
            .set_mem_remote(key, value)
            .await
    }

    pub async fn get_remote_memory(
        &self,
        target: &PeerAddr,
        key: &str,
    ) -> WeftResult<Option<Value>> {
        PeerClient::new(target.ip.clone(), target.port)
            .get_mem_remote(key)
            .await
    }
}

/// Best local IP for reaching the tracker: route-probe with a UDP socket,
/// falling back to loopback.
pub fn detect_local_ip(tracker_host: &str, tracker_port: u16) -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((tracker_host, tracker_port))?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}
