use crate::config::QueueCounts;
use crate::worker::WorkerHandle;
use anyhow::Result;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Runs inside each freshly forked child before it begins work.
pub type PreforkHook = Box<dyn Fn(&WorkerHandle) -> Result<()> + Send + Sync>;

/// Runs once per master loop iteration with a snapshot of the pool.
pub type PollHook = Box<dyn Fn(&PoolStatus) -> Result<()> + Send + Sync>;

/// Read-only view of the pool handed to poll hooks.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub master_pid: Pid,
    /// Live worker pids per queue group, in spawn order.
    pub workers: HashMap<String, Vec<Pid>>,
    /// The configuration the master last loaded.
    pub configured: QueueCounts,
    /// Queue groups whose governor currently forbids spawning.
    pub backoff_groups: Vec<String>,
    /// Deferred signals not yet dispatched.
    pub pending_signals: usize,
    /// Signals dropped on queue overflow since startup.
    pub dropped_signals: u64,
}

impl PoolStatus {
    pub fn live_workers(&self, queue_group: &str) -> usize {
        self.workers.get(queue_group).map_or(0, Vec::len)
    }

    pub fn total_workers(&self) -> usize {
        self.workers.values().map(Vec::len).sum()
    }
}

/// Ordered hook sequences, populated during the startup phase and frozen
/// once the master runs.
#[derive(Default)]
pub struct Hooks {
    after_prefork: Vec<PreforkHook>,
    poll: Vec<PollHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_after_prefork(&mut self, hook: PreforkHook) {
        self.after_prefork.push(hook);
    }

    pub fn add_poll(&mut self, hook: PollHook) {
        self.poll.push(hook);
    }

    pub fn after_prefork(&self) -> &[PreforkHook] {
        &self.after_prefork
    }

    pub fn poll(&self) -> &[PollHook] {
        &self.poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            hooks.add_poll(Box::new(move |_status| {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        let status = PoolStatus {
            master_pid: nix::unistd::getpid(),
            workers: HashMap::new(),
            configured: QueueCounts::new(),
            backoff_groups: Vec::new(),
            pending_signals: 0,
            dropped_signals: 0,
        };
        for hook in hooks.poll() {
            hook(&status).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_prefork_hooks_see_the_handle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        let counter = Arc::clone(&calls);
        hooks.add_after_prefork(Box::new(move |handle| {
            assert_eq!(handle.queue_definition, "mail");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let handle = WorkerHandle {
            queue_definition: "mail".to_string(),
            queues: vec!["mail".to_string()],
            kind: "default".to_string(),
            spawned_at: std::time::Instant::now(),
            pool_master_pid: nix::unistd::getpid(),
            worker_parent_pid: nix::unistd::getpid(),
            term_timeout: 4.0,
            term_child: false,
            interval: std::time::Duration::from_secs(5),
            verbose: false,
            very_verbose: false,
            run_at_exit_hooks: false,
        };
        for hook in hooks.after_prefork() {
            hook(&handle).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
