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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::value::{to_value, Value};

/// Transitions are unconstrained here; consumers impose whatever ordering
/// their semantics require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Terminated,
    Zombie,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<String>,
    pub state: ProcessState,
    pub priority: i32,
    pub created_at: u64,
    pub cpu_time: f64,
    pub children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub task_data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub total_processes: usize,
    pub process_groups: usize,
    pub processes_by_state: BTreeMap<String, usize>,
}

/// Process bookkeeping: monotonic `P<N>` pids, a parent/child forest,
/// named groups, and lifecycle state.
pub struct ProcessManager {
    inner: Mutex<Inner>,
}

struct Inner {
    processes: HashMap<String, ProcessInfo>,
    groups: HashMap<String, BTreeSet<String>>,
    next_pid: u64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                groups: HashMap::new(),
                next_pid: 1,
            }),
        }
    }

    pub fn create_process(
        &self,
        task_data: Value,
        parent_pid: Option<&str>,
        group_id: Option<&str>,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();

        let pid = format!("P{}", inner.next_pid);
        inner.next_pid += 1;

        let priority = task_data
            .as_map()
            .and_then(|m| m.get("priority"))
            .and_then(|v| v.as_int())
            .unwrap_or(0) as i32;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let process = ProcessInfo {
            pid: pid.clone(),
            ppid: parent_pid
                .filter(|p| inner.processes.contains_key(*p))
                .map(String::from),
            state: ProcessState::New,
            priority,
            created_at,
            cpu_time: 0.0,
            children: Vec::new(),
            group_id: group_id.map(String::from),
            task_data,
        };

        if let Some(parent) = process.ppid.clone() {
            if let Some(parent_info) = inner.processes.get_mut(&parent) {
                parent_info.children.push(pid.clone());
            }
        }
        if let Some(group) = group_id {
            inner
                .groups
                .entry(group.to_string())
                .or_default()
                .insert(pid.clone());
        }

        inner.processes.insert(pid.clone(), process);
        info!(
            "Process created (pid = {}) (parent = {:?}) (group = {:?})",
            pid, parent_pid, group_id
        );
        pid
    }

    pub fn get(&self, pid: &str) -> Option<ProcessInfo> {
        self.inner.lock().unwrap().processes.get(pid).cloned()
    }

    pub fn set_state(&self, pid: &str, state: ProcessState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.processes.get_mut(pid) {
            Some(process) => {
                process.state = state;
                debug!("Process state changed (pid = {}) (state = {:?})", pid, state);
                true
            }
            None => false,
        }
    }

    pub fn add_cpu_time(&self, pid: &str, seconds: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(process) = inner.processes.get_mut(pid) {
            process.cpu_time += seconds;
        }
    }

    /// Terminate a process and, recursively, all of its descendants. The
    /// whole subtree is removed from the table, from parents' child lists
    /// and from groups.
    pub fn terminate_process(&self, pid: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(pid) {
            return false;
        }

        // Collect the subtree before mutating anything.
        let mut doomed = Vec::new();
        let mut frontier = vec![pid.to_string()];
        while let Some(current) = frontier.pop() {
            if let Some(info) = inner.processes.get(&current) {
                frontier.extend(info.children.iter().cloned());
            }
            doomed.push(current);
        }

        for victim in &doomed {
            if let Some(info) = inner.processes.remove(victim) {
                if let Some(parent) = info.ppid {
                    if let Some(parent_info) = inner.processes.get_mut(&parent) {
                        parent_info.children.retain(|c| c != victim);
                    }
                }
                if let Some(group) = info.group_id {
                    if let Some(members) = inner.groups.get_mut(&group) {
                        members.remove(victim);
                    }
                }
            }
        }

        info!("Process terminated (pid = {}) (subtree = {})", pid, doomed.len());
        true
    }

    pub fn create_group(&self, group_id: &str, pids: &[String]) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let members: Vec<String> = pids
            .iter()
            .filter(|p| inner.processes.contains_key(*p))
            .cloned()
            .collect();

        let group = inner.groups.entry(group_id.to_string()).or_default();
        for pid in &members {
            group.insert(pid.clone());
        }
        for pid in &members {
            if let Some(process) = inner.processes.get_mut(pid) {
                process.group_id = Some(group_id.to_string());
            }
        }

        info!("Process group created (group = {}) (members = {})", group_id, members.len());
        true
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .get(group_id)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Terminate every member of a group; returns how many top-level
    /// members were terminated.
    pub fn kill_group(&self, group_id: &str) -> usize {
        let members = {
            let mut inner = self.inner.lock().unwrap();
            match inner.groups.remove(group_id) {
                Some(members) => members,
                None => return 0,
            }
        };

        let mut count = 0;
        for pid in members {
            if self.terminate_process(&pid) {
                count += 1;
            }
        }

        info!("Process group terminated (group = {}) (count = {})", group_id, count);
        count
    }

    /// JSON process tree rooted at `root_pid`, or the whole forest.
    pub fn process_tree(&self, root_pid: Option<&str>) -> Option<Value> {
        let inner = self.inner.lock().unwrap();

        match root_pid {
            Some(pid) => {
                if !inner.processes.contains_key(pid) {
                    return None;
                }
                Some(build_tree(&inner.processes, pid))
            }
            None => {
                let mut roots: Vec<&String> = inner
                    .processes
                    .values()
                    .filter(|p| p.ppid.is_none())
                    .map(|p| &p.pid)
                    .collect();
                roots.sort();

                let mut out = BTreeMap::new();
                out.insert(
                    "roots".to_string(),
                    Value::List(
                        roots
                            .into_iter()
                            .map(|pid| build_tree(&inner.processes, pid))
                            .collect(),
                    ),
                );
                out.insert(
                    "total_processes".to_string(),
                    Value::from(inner.processes.len()),
                );
                Some(Value::Map(out))
            }
        }
    }

    pub fn stats(&self) -> ProcessStats {
        let inner = self.inner.lock().unwrap();

        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        for process in inner.processes.values() {
            let key = to_value(&process.state)
                .as_str()
                .unwrap_or("UNKNOWN")
                .to_string();
            *by_state.entry(key).or_insert(0) += 1;
        }

        ProcessStats {
            total_processes: inner.processes.len(),
            process_groups: inner.groups.len(),
            processes_by_state: by_state,
        }
    }
}

fn build_tree(processes: &HashMap<String, ProcessInfo>, pid: &str) -> Value {
    let mut node = BTreeMap::new();

    if let Some(info) = processes.get(pid) {
        node.insert("pid".to_string(), Value::from(pid));
        if let Some(ppid) = &info.ppid {
            node.insert("ppid".to_string(), Value::from(ppid.as_str()));
        }
        node.insert("state".to_string(), to_value(&info.state));
        node.insert("priority".to_string(), Value::Int(info.priority as i64));

        let mut children = Vec::new();
        for child in &info.children {
            children.push(build_tree(processes, child));
        }
        node.insert("children".to_string(), Value::List(children));
    }

    Value::Map(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic() {
        let manager = ProcessManager::new();
        assert_eq!(manager.create_process(Value::Null, None, None), "P1");
        assert_eq!(manager.create_process(Value::Null, None, None), "P2");

        manager.terminate_process("P1");
        // Terminated pids are never reused.
        assert_eq!(manager.create_process(Value::Null, None, None), "P3");
    }

    #[test]
    fn terminate_cascades_to_descendants() {
        let manager = ProcessManager::new();
        let root = manager.create_process(Value::Null, None, None);
        let child = manager.create_process(Value::Null, Some(&root), None);
        let grandchild = manager.create_process(Value::Null, Some(&child), None);
        let bystander = manager.create_process(Value::Null, None, None);

        assert!(manager.terminate_process(&root));

        assert!(manager.get(&root).is_none());
        assert!(manager.get(&child).is_none());
        assert!(manager.get(&grandchild).is_none());
        assert!(manager.get(&bystander).is_some());
    }

    #[test]
    fn terminate_detaches_from_parent() {
        let manager = ProcessManager::new();
        let root = manager.create_process(Value::Null, None, None);
        let child = manager.create_process(Value::Null, Some(&root), None);

        assert!(manager.terminate_process(&child));
        assert!(manager.get(&root).unwrap().children.is_empty());
    }

    #[test]
    fn groups_kill_together() {
        let manager = ProcessManager::new();
        let a = manager.create_process(Value::Null, None, Some("g"));
        let b = manager.create_process(Value::Null, None, Some("g"));
        let c = manager.create_process(Value::Null, None, None);

        assert_eq!(manager.kill_group("g"), 2);
        assert!(manager.get(&a).is_none());
        assert!(manager.get(&b).is_none());
        assert!(manager.get(&c).is_some());
        assert_eq!(manager.kill_group("g"), 0);
    }

    #[test]
    fn tree_reflects_forest() {
        let manager = ProcessManager::new();
        let root = manager.create_process(Value::Null, None, None);
        let _child = manager.create_process(Value::Null, Some(&root), None);
        let _other = manager.create_process(Value::Null, None, None);

        let forest = manager.process_tree(None).unwrap();
        let map = forest.as_map().unwrap();
        assert_eq!(map.get("total_processes"), Some(&Value::Int(3)));
        assert_eq!(map.get("roots").unwrap().as_list().unwrap().len(), 2);

        let subtree = manager.process_tree(Some(&root)).unwrap();
        let subtree = subtree.as_map().unwrap();
        assert_eq!(
            subtree.get("children").unwrap().as_list().unwrap().len(),
            1
        );

        assert!(manager.process_tree(Some("P99")).is_none());
    }

    #[test]
    fn state_changes_and_cpu_time() {
        let manager = ProcessManager::new();
        let pid = manager.create_process(Value::Null, None, None);

        assert!(manager.set_state(&pid, ProcessState::Running));
        manager.add_cpu_time(&pid, 0.25);
        manager.add_cpu_time(&pid, 0.25);

        let info = manager.get(&pid).unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert!((info.cpu_time - 0.5).abs() < f64::EPSILON);

        assert!(!manager.set_state("P99", ProcessState::Ready));
    }

    #[test]
    fn priority_comes_from_task_data() {
        let manager = ProcessManager::new();
        let task: Value = serde_json::from_str(r#"{"priority": 7}"#).unwrap();
        let pid = manager.create_process(task, None, None);
        assert_eq!(manager.get(&pid).unwrap().priority, 7);
    }
}
