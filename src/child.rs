//! Child record and table: a keyed map owning its own launch spec via move
//! semantics, O(1) removal by key.

use std::collections::HashMap;
use std::os::fd::RawFd;

use nix::unistd::Pid;
use tracing::debug;

use crate::message::LaunchSpec;

/// One launched process. Invariants:
/// 1. created only after `fork` returns a positive pid.
/// 2. pids are unique within the table.
/// 3. `master_fd` is closed at most once.
/// 4. mutated only from the main task.
pub struct Child {
    pub pid: Pid,
    pub master_fd: RawFd,
    pub launch_spec: LaunchSpec,
    pub terminated: bool,
    pub status: i32,
}

/// Keyed by pid for O(1) lookup/removal.
#[derive(Default)]
pub struct ChildTable {
    children: HashMap<Pid, Child>,
}

impl ChildTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Insert a freshly-launched child. Panics if `pid` is already present,
    /// which would violate invariant 2 and can only happen if the OS handed
    /// out a pid still held by an unreaped zombie we forgot to remove.
    pub fn insert(&mut self, pid: Pid, master_fd: RawFd, launch_spec: LaunchSpec) {
        let prior = self.children.insert(
            pid,
            Child {
                pid,
                master_fd,
                launch_spec,
                terminated: false,
                status: 0,
            },
        );
        assert!(prior.is_none(), "pid {pid} already present in child table");
    }

    pub fn get(&self, pid: Pid) -> Option<&Child> {
        self.children.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Child> {
        self.children.values()
    }

    /// Mark a child terminated with the given raw wait status. Returns
    /// `false` if `pid` is not in the table (already removed, or never
    /// launched by us).
    pub fn mark_terminated(&mut self, pid: Pid, status: i32) -> bool {
        match self.children.get_mut(&pid) {
            Some(child) => {
                child.terminated = true;
                child.status = status;
                true
            }
            None => false,
        }
    }

    /// Every non-terminated child, for the SIGCHLD reaper sweep.
    pub fn pids_awaiting_reap(&self) -> Vec<Pid> {
        self.children
            .values()
            .filter(|c| !c.terminated)
            .map(|c| c.pid)
            .collect()
    }

    /// Remove and close a child's master fd. Called only after a successful
    /// `Wait` (errno=0).
    pub fn remove(&mut self, pid: Pid) -> Option<Child> {
        let child = self.children.remove(&pid)?;
        close_master(&child);
        Some(child)
    }
}

impl Drop for ChildTable {
    fn drop(&mut self) {
        for child in self.children.values() {
            close_master(child);
        }
    }
}

fn close_master(child: &Child) {
    debug!(pid = child.pid.as_raw(), fd = child.master_fd, "closing master fd");
    let _ = nix::unistd::close(child.master_fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            path: "/bin/sh".to_string(),
            argv: vec!["sh".to_string()],
            envp: vec![],
            width: 80,
            height: 24,
            is_utf8: true,
            pwd: "/tmp".to_string(),
            unique_id: 1,
        }
    }

    #[test]
    fn insert_get_remove() {
        let mut table = ChildTable::new();
        let pid = Pid::from_raw(4242);
        table.insert(pid, -1, spec());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(pid).unwrap().pid, pid);

        // Use an fd of -1 so close() in remove()/Drop is a harmless no-op.
        let removed = table.remove(pid);
        assert!(removed.is_some());
        assert_eq!(table.len(), 0);
        assert!(table.get(pid).is_none());
    }

    #[test]
    fn mark_terminated_updates_status() {
        let mut table = ChildTable::new();
        let pid = Pid::from_raw(99);
        table.insert(pid, -1, spec());
        assert!(table.mark_terminated(pid, 0));
        assert!(table.get(pid).unwrap().terminated);
        assert!(!table.mark_terminated(Pid::from_raw(100), 0));
    }

    #[test]
    fn pids_awaiting_reap_excludes_terminated() {
        let mut table = ChildTable::new();
        let a = Pid::from_raw(1);
        let b = Pid::from_raw(2);
        table.insert(a, -1, spec());
        table.insert(b, -1, spec());
        table.mark_terminated(a, 0);
        assert_eq!(table.pids_awaiting_reap(), vec![b]);
    }

    #[test]
    #[should_panic]
    fn duplicate_pid_insert_panics() {
        let mut table = ChildTable::new();
        let pid = Pid::from_raw(7);
        table.insert(pid, -1, spec());
        table.insert(pid, -1, spec());
    }
}
