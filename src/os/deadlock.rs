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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{WeftError, WeftResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

#[derive(Debug, Clone)]
struct Resource {
    kind: ResourceKind,
    total_units: u64,
    available_units: u64,
    allocated: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct ProcEntry {
    allocation: HashMap<String, u64>,
    max_need: HashMap<String, u64>,
    need: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub kind: ResourceKind,
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
    pub allocations: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub allocation: BTreeMap<String, u64>,
    pub need: BTreeMap<String, u64>,
    pub max_need: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub resources: BTreeMap<String, ResourceStatus>,
    pub processes: BTreeMap<String, ProcessStatus>,
    pub safe_state: bool,
}

/// Resource bookkeeping with two complementary services.
///
/// `request` is request-time prevention: the allocation is applied
/// tentatively and committed only if the banker's safety check still finds
/// an order in which every process can finish; otherwise it is rolled back
/// and refused. `detect` is a read-only observation over the wait-for graph
/// that works on any state, including ones the prevention path would never
/// reach (allocations injected through `set_allocation_unchecked`).
pub struct DeadlockDetector {
    inner: Mutex<Inner>,
}

struct Inner {
    resources: HashMap<String, Resource>,
    processes: HashMap<String, ProcEntry>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                resources: HashMap::new(),
                processes: HashMap::new(),
            }),
        }
    }

    pub fn register_resource(&self, resource_id: &str, kind: ResourceKind, total_units: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.resources.insert(
            resource_id.to_string(),
            Resource {
                kind,
                total_units,
                available_units: total_units,
                allocated: HashMap::new(),
            },
        );
        info!("Resource registered (id = {}) (units = {})", resource_id, total_units);
    }

    pub fn register_process(&self, pid: &str, max_need: BTreeMap<String, u64>) {
        let mut inner = self.inner.lock().unwrap();
        let need: HashMap<String, u64> = max_need.iter().map(|(k, v)| (k.clone(), *v)).collect();
        inner.processes.insert(
            pid.to_string(),
            ProcEntry {
                allocation: max_need.keys().map(|k| (k.clone(), 0)).collect(),
                max_need: max_need.into_iter().collect(),
                need,
            },
        );
    }

    pub fn unregister_process(&self, pid: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.processes.remove(pid) {
            for (rid, units) in entry.allocation {
                if let Some(resource) = inner.resources.get_mut(&rid) {
                    resource.available_units += units;
                    resource.allocated.remove(pid);
                }
            }
        }
    }

    pub fn has_process(&self, pid: &str) -> bool {
        self.inner.lock().unwrap().processes.contains_key(pid)
    }

    /// Banker's request. Commits only transitions that stay provably safe.
    pub fn request(&self, pid: &str, resource_id: &str, units: u64) -> WeftResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.processes.contains_key(pid) {
            return Err(WeftError::NotFound(format!("process {} not registered", pid)));
        }
        if !inner.resources.contains_key(resource_id) {
            return Err(WeftError::NotFound(format!(
                "resource {} not registered",
                resource_id
            )));
        }

        let need = inner.processes[pid]
            .need
            .get(resource_id)
            .copied()
            .unwrap_or(0);
        if units > need {
            return Err(WeftError::Validation(format!(
                "request of {} exceeds remaining need {} for {}",
                units, need, resource_id
            )));
        }
        if units > inner.resources[resource_id].available_units {
            return Err(WeftError::Validation(format!(
                "insufficient units of {} available",
                resource_id
            )));
        }

        inner.apply(pid, resource_id, units);

        if inner.is_safe() {
            info!(
                "Resource granted (pid = {}) (resource = {}) (units = {})",
                pid, resource_id, units
            );
            Ok(())
        } else {
            inner.revert(pid, resource_id, units);
            warn!(
                "Resource denied, unsafe state (pid = {}) (resource = {})",
                pid, resource_id
            );
            Err(WeftError::UnsafeState)
        }
    }

    /// Release never blocks and never fails the safety check.
    pub fn release(&self, pid: &str, resource_id: &str, units: u64) -> WeftResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let allocated = inner
            .processes
            .get(pid)
            .and_then(|p| p.allocation.get(resource_id))
            .copied()
            .unwrap_or(0);

        if !inner.processes.contains_key(pid) || !inner.resources.contains_key(resource_id) {
            return Err(WeftError::NotFound(format!(
                "unknown process {} or resource {}",
                pid, resource_id
            )));
        }
        if units > allocated {
            return Err(WeftError::Validation(format!(
                "release of {} exceeds allocation {} for {}",
                units, allocated, resource_id
            )));
        }

        inner.revert(pid, resource_id, units);
        info!(
            "Resource released (pid = {}) (resource = {}) (units = {})",
            pid, resource_id, units
        );
        Ok(())
    }

    /// Force an allocation without the safety check. Diagnostics only: this
    /// is how unsafe states are staged for `detect`.
    pub fn set_allocation_unchecked(
        &self,
        pid: &str,
        resource_id: &str,
        units: u64,
    ) -> WeftResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.processes.contains_key(pid) {
            return Err(WeftError::NotFound(format!("process {} not registered", pid)));
        }
        let available = match inner.resources.get(resource_id) {
            Some(r) => r.available_units,
            None => {
                return Err(WeftError::NotFound(format!(
                    "resource {} not registered",
                    resource_id
                )))
            }
        };
        if units > available {
            return Err(WeftError::Validation(format!(
                "insufficient units of {} available",
                resource_id
            )));
        }

        inner.apply(pid, resource_id, units);
        Ok(())
    }

    /// Wait-for-graph cycle detection. Returns whether a deadlock exists and
    /// the set of processes involved, computed as the union of non-trivial
    /// strongly connected components.
    pub fn detect(&self) -> (bool, Vec<String>) {
        let inner = self.inner.lock().unwrap();

        // P_i -> P_j when P_i still needs a resource P_j holds.
        let mut graph: HashMap<&str, HashSet<&str>> = HashMap::new();
        for pid in inner.processes.keys() {
            graph.entry(pid).or_default();
        }
        for (pid, process) in &inner.processes {
            for (rid, need) in &process.need {
                if *need == 0 {
                    continue;
                }
                if let Some(resource) = inner.resources.get(rid) {
                    for (holder, held) in &resource.allocated {
                        if *held > 0 && holder != pid {
                            graph.entry(pid.as_str()).or_default().insert(holder);
                        }
                    }
                }
            }
        }

        let mut deadlocked: Vec<String> = tarjan_components(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .map(String::from)
            .collect();
        deadlocked.sort();
        deadlocked.dedup();

        if !deadlocked.is_empty() {
            warn!("Deadlock detected (processes = {:?})", deadlocked);
        }

        (!deadlocked.is_empty(), deadlocked)
    }

    pub fn status(&self) -> DetectorStatus {
        let inner = self.inner.lock().unwrap();

        DetectorStatus {
            resources: inner
                .resources
                .iter()
                .map(|(rid, r)| {
                    (
                        rid.clone(),
                        ResourceStatus {
                            kind: r.kind,
                            total: r.total_units,
                            available: r.available_units,
                            allocated: r.allocated.values().sum(),
                            allocations: r
                                .allocated
                                .iter()
                                .map(|(k, v)| (k.clone(), *v))
                                .collect(),
                        },
                    )
                })
                .collect(),
            processes: inner
                .processes
                .iter()
                .map(|(pid, p)| {
                    (
                        pid.clone(),
                        ProcessStatus {
                            allocation: p
                                .allocation
                                .iter()
                                .map(|(k, v)| (k.clone(), *v))
                                .collect(),
                            need: p.need.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                            max_need: p
                                .max_need
                                .iter()
                                .map(|(k, v)| (k.clone(), *v))
                                .collect(),
                        },
                    )
                })
                .collect(),
            safe_state: inner.is_safe(),
        }
    }
}

impl Inner {
    fn apply(&mut self, pid: &str, resource_id: &str, units: u64) {
        if let Some(resource) = self.resources.get_mut(resource_id) {
            resource.available_units -= units;
            *resource.allocated.entry(pid.to_string()).or_insert(0) += units;
            if resource.allocated[pid] == 0 {
                resource.allocated.remove(pid);
            }
        }
        if let Some(process) = self.processes.get_mut(pid) {
            *process.allocation.entry(resource_id.to_string()).or_insert(0) += units;
            let need = process.need.entry(resource_id.to_string()).or_insert(0);
            *need = need.saturating_sub(units);
        }
    }

    fn revert(&mut self, pid: &str, resource_id: &str, units: u64) {
        if let Some(resource) = self.resources.get_mut(resource_id) {
            resource.available_units += units;
            if let Some(held) = resource.allocated.get_mut(pid) {
                *held = held.saturating_sub(units);
                if *held == 0 {
                    resource.allocated.remove(pid);
                }
            }
        }
        if let Some(process) = self.processes.get_mut(pid) {
            let allocation = process.allocation.entry(resource_id.to_string()).or_insert(0);
            *allocation = allocation.saturating_sub(units);
            *process.need.entry(resource_id.to_string()).or_insert(0) += units;
        }
    }

    /// Banker's safety check: repeatedly retire any process whose remaining
    /// need fits in the work pool, reclaiming its allocation; safe iff all
    /// processes retire.
    fn is_safe(&self) -> bool {
        let mut work: HashMap<&str, u64> = self
            .resources
            .iter()
            .map(|(rid, r)| (rid.as_str(), r.available_units))
            .collect();
        let mut finished: HashSet<&str> = HashSet::new();

        loop {
            let mut progressed = false;

            for (pid, process) in &self.processes {
                if finished.contains(pid.as_str()) {
                    continue;
                }

                let can_finish = process
                    .need
                    .iter()
                    .all(|(rid, need)| *need <= work.get(rid.as_str()).copied().unwrap_or(0));

                if can_finish {
                    for (rid, allocated) in &process.allocation {
                        *work.entry(rid.as_str()).or_insert(0) += allocated;
                    }
                    finished.insert(pid);
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }

        finished.len() == self.processes.len()
    }
}

/// Tarjan's strongly connected components over a borrowed adjacency map.
fn tarjan_components<'a>(graph: &HashMap<&'a str, HashSet<&'a str>>) -> Vec<Vec<&'a str>> {
    struct Walk<'g, 'a> {
        graph: &'g HashMap<&'a str, HashSet<&'a str>>,
        index: usize,
        indices: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: HashSet<&'a str>,
        components: Vec<Vec<&'a str>>,
    }

    impl<'g, 'a> Walk<'g, 'a> {
        fn strong_connect(&mut self, node: &'a str) {
            self.indices.insert(node, self.index);
            self.lowlink.insert(node, self.index);
            self.index += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            if let Some(successors) = self.graph.get(node) {
                for &next in successors {
                    if !self.indices.contains_key(next) {
                        self.strong_connect(next);
                        let low = self.lowlink[next].min(self.lowlink[node]);
                        self.lowlink.insert(node, low);
                    } else if self.on_stack.contains(next) {
                        let low = self.indices[next].min(self.lowlink[node]);
                        self.lowlink.insert(node, low);
                    }
                }
            }

            if self.lowlink[node] == self.indices[node] {
                let mut component = Vec::new();
                while let Some(top) = self.stack.pop() {
                    self.on_stack.remove(top);
                    component.push(top);
                    if top == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut walk = Walk {
        graph,
        index: 0,
        indices: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        components: Vec::new(),
    };

    let mut nodes: Vec<&str> = graph.keys().copied().collect();
    nodes.sort();
    for node in nodes {
        if !walk.indices.contains_key(node) {
            walk.strong_connect(node);
        }
    }

    walk.components
}
