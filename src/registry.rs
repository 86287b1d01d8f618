use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Instant;

/// Metadata kept for one live child process.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: Pid,
    pub queue_group: String,
    pub kind: String,
    pub spawned_at: Instant,
}

/// Spawn timestamps of reaped workers, grouped by queue group.
pub type ReapedStarts = HashMap<String, Vec<Instant>>;

/// The master's authoritative map of live children.
///
/// Buckets preserve insertion order so scale-down always quits the
/// oldest-inserted workers first. Entries leave the registry only through a
/// reap pass.
#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<String, Vec<WorkerRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: WorkerRecord) {
        if self.contains_pid(record.pid) {
            tracing::warn!(pid = %record.pid, "duplicate pid insert ignored");
            return;
        }
        self.groups
            .entry(record.queue_group.clone())
            .or_default()
            .push(record);
    }

    pub fn contains_pid(&self, pid: Pid) -> bool {
        self.groups
            .values()
            .any(|bucket| bucket.iter().any(|r| r.pid == pid))
    }

    /// Remove and return the record for `pid`, pruning its bucket if emptied.
    fn remove(&mut self, pid: Pid) -> Option<WorkerRecord> {
        let mut removed = None;
        for (group, bucket) in self.groups.iter_mut() {
            if let Some(idx) = bucket.iter().position(|r| r.pid == pid) {
                removed = Some((group.clone(), bucket.remove(idx)));
                break;
            }
        }
        let (group, record) = removed?;
        if self.groups.get(&group).map_or(false, |b| b.is_empty()) {
            self.groups.remove(&group);
        }
        Some(record)
    }

    /// Queue groups that currently have at least one live worker.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn count(&self, queue_group: &str) -> usize {
        self.groups.get(queue_group).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.groups
            .values()
            .flat_map(|bucket| bucket.iter().map(|r| r.pid))
            .collect()
    }

    /// The first `n` pids of a bucket in insertion order.
    pub fn first_pids(&self, queue_group: &str, n: usize) -> Vec<Pid> {
        self.groups
            .get(queue_group)
            .map(|bucket| bucket.iter().take(n).map(|r| r.pid).collect())
            .unwrap_or_default()
    }

    pub fn pids_by_group(&self) -> HashMap<String, Vec<Pid>> {
        self.groups
            .iter()
            .map(|(group, bucket)| (group.clone(), bucket.iter().map(|r| r.pid).collect()))
            .collect()
    }

    /// Send `sig` to every live worker. "No such process" is swallowed; the
    /// child already exited and the next reap will collect it.
    pub fn signal_all(&self, sig: Signal) {
        for pid in self.live_pids() {
            match kill(pid, sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    tracing::warn!(pid = %pid, signal = %sig, error = %err, "failed to signal worker");
                }
            }
        }
    }

    /// One non-blocking reap pass over all children.
    ///
    /// Collects every currently-reapable child, removes it from its bucket,
    /// and returns the spawn timestamps of the reaped records so the caller
    /// can feed the backoff governors.
    pub fn reap_nonblocking(&mut self) -> ReapedStarts {
        let mut reaped = ReapedStarts::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    tracing::debug!(pid = %pid, code, "worker exited");
                    self.collect(pid, &mut reaped);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    tracing::debug!(pid = %pid, signal = %sig, "worker killed by signal");
                    self.collect(pid, &mut reaped);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                // ECHILD: nothing left to reap
                Err(_) => break,
            }
        }
        reaped
    }

    fn collect(&mut self, pid: Pid, reaped: &mut ReapedStarts) {
        match self.remove(pid) {
            Some(record) => {
                reaped
                    .entry(record.queue_group)
                    .or_default()
                    .push(record.spawned_at);
            }
            None => {
                // Not ours (e.g. a double-forked grandchild); nothing to track
                tracing::debug!(pid = %pid, "reaped pid not present in registry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(pid: i32, group: &str) -> WorkerRecord {
        WorkerRecord {
            pid: Pid::from_raw(pid),
            queue_group: group.to_string(),
            kind: "default".to_string(),
            spawned_at: Instant::now(),
        }
    }

    #[test]
    fn test_insert_and_count() {
        let mut registry = Registry::new();
        registry.insert(record(100, "a,b"));
        registry.insert(record(101, "a,b"));
        registry.insert(record(102, "c"));

        assert_eq!(registry.count("a,b"), 2);
        assert_eq!(registry.count("c"), 1);
        assert_eq!(registry.count("missing"), 0);
        assert_eq!(registry.total(), 3);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_duplicate_pid_is_rejected() {
        let mut registry = Registry::new();
        registry.insert(record(100, "a"));
        registry.insert(record(100, "b"));

        // The second insert must not create a record under a second group
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.count("a"), 1);
        assert_eq!(registry.count("b"), 0);
    }

    #[test]
    fn test_remove_prunes_empty_buckets() {
        let mut registry = Registry::new();
        registry.insert(record(100, "a"));

        let removed = registry.remove(Pid::from_raw(100)).unwrap();
        assert_eq!(removed.queue_group, "a");
        assert!(registry.is_empty());
        assert!(registry.group_names().is_empty());
    }

    #[test]
    fn test_first_pids_follow_insertion_order() {
        let mut registry = Registry::new();
        for pid in [300, 301, 302, 303] {
            registry.insert(record(pid, "q"));
        }

        let victims = registry.first_pids("q", 2);
        assert_eq!(victims, vec![Pid::from_raw(300), Pid::from_raw(301)]);

        let all = registry.first_pids("q", 10);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_record_keeps_spawn_metadata() {
        let mut registry = Registry::new();
        let before = Instant::now();
        registry.insert(record(100, "mail"));
        let rec = registry.remove(Pid::from_raw(100)).unwrap();

        assert_eq!(rec.kind, "default");
        assert!(rec.spawned_at >= before);
        assert!(rec.spawned_at.elapsed() < Duration::from_secs(1));
    }
}
