//! Worker kinds and the child side of a spawn.
//!
//! A queue group optionally selects a worker variant with a `kind:` prefix;
//! the kind registry maps each variant name to a factory producing the value
//! that actually processes jobs. The job-execution subsystem itself is a
//! collaborator behind the [`QueueWorker`] trait.

use crate::error::PoolError;
use crate::hooks::Hooks;
use crate::signals::HANDLED_SIGNALS;
use anyhow::Result;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{execvp, getpid, setpgid, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::time::{Duration, Instant};

/// Kind selected when a queue group carries no `kind:` prefix.
pub const DEFAULT_KIND: &str = "default";

/// Everything a freshly forked child knows about itself.
///
/// Populated by the master from its options immediately before the fork.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// The queue group exactly as configured, including any kind prefix.
    pub queue_definition: String,
    /// The individual queues the worker serves.
    pub queues: Vec<String>,
    /// The worker variant serving this group.
    pub kind: String,
    /// When the master forked this worker.
    pub spawned_at: Instant,
    /// Pid of the supervising master.
    pub pool_master_pid: Pid,
    /// Pid of the process that forked this worker (the master).
    pub worker_parent_pid: Pid,
    /// Seconds the worker gives its current job on termination.
    pub term_timeout: f64,
    /// Whether the worker treats `TERM` as the graceful-quit signal.
    pub term_child: bool,
    /// Poll interval for the worker's blocking work routine.
    pub interval: Duration,
    pub verbose: bool,
    pub very_verbose: bool,
    pub run_at_exit_hooks: bool,
}

/// The opaque job-execution capability running inside a forked child.
///
/// `work` blocks until the worker decides to exit; returning is how a worker
/// terminates normally.
pub trait QueueWorker: Send {
    fn work(&mut self, interval: Duration) -> Result<()>;
}

/// Builds a [`QueueWorker`] from the handle the master prepared.
pub type WorkerFactory = Box<dyn Fn(&WorkerHandle) -> Result<Box<dyn QueueWorker>> + Send + Sync>;

/// Result of resolving a queue group against the kind registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKind {
    pub kind: String,
    pub queues: Vec<String>,
}

/// Whether `s` is a legal worker kind name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_kind_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Mapping from worker kind to constructor.
#[derive(Default)]
pub struct KindRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a worker variant. The default kind may be replaced by
    /// registering under [`DEFAULT_KIND`].
    pub fn register(&mut self, kind: &str, factory: WorkerFactory) -> Result<(), PoolError> {
        if !is_valid_kind_ident(kind) {
            return Err(PoolError::InvalidKindIdent(kind.to_string()));
        }
        self.factories.insert(kind.to_string(), factory);
        Ok(())
    }

    pub fn factory(&self, kind: &str) -> Option<&WorkerFactory> {
        self.factories.get(kind)
    }

    /// Split a queue group into its kind and queue list and check the kind is
    /// registered. The queue group string is never otherwise interpreted.
    pub fn resolve(&self, queue_group: &str) -> Result<ResolvedKind, PoolError> {
        let (kind, queues) = match queue_group.split_once(':') {
            Some((prefix, rest)) => {
                if !is_valid_kind_ident(prefix) {
                    return Err(PoolError::InvalidKindIdent(prefix.to_string()));
                }
                (prefix, rest)
            }
            None => (DEFAULT_KIND, queue_group),
        };

        if !self.factories.contains_key(kind) {
            return Err(PoolError::UnknownWorkerKind {
                kind: kind.to_string(),
                queue_group: queue_group.to_string(),
            });
        }

        Ok(ResolvedKind {
            kind: kind.to_string(),
            queues: queues.split(',').map(str::to_string).collect(),
        })
    }
}

/// Child-side setup and work loop. Never returns; the child exits when its
/// work routine finishes or anything in setup fails.
pub(crate) fn run_child(
    handle: WorkerHandle,
    factory: &WorkerFactory,
    hooks: &Hooks,
    single_pgrp: bool,
) -> ! {
    // Detach into an own process group so terminal signals aimed at the
    // master do not hit the worker, unless the operator opted out.
    if !single_pgrp {
        let pid = getpid();
        let _ = setpgid(pid, pid);
    }

    restore_default_signal_handlers();

    for hook in hooks.after_prefork() {
        if let Err(err) = hook(&handle) {
            tracing::error!(error = %err, queues = %handle.queue_definition, "after-prefork hook failed");
            std::process::exit(70);
        }
    }

    let mut worker = match factory(&handle) {
        Ok(worker) => worker,
        Err(err) => {
            tracing::error!(error = %err, queues = %handle.queue_definition, "worker construction failed");
            std::process::exit(70);
        }
    };

    crate::procline::set(&format!("worker {}", handle.queue_definition));

    match worker.work(handle.interval) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, queues = %handle.queue_definition, "worker exited with error");
            std::process::exit(1);
        }
    }
}

/// Put every pool-handled signal back to its default disposition. The child
/// must not inherit the master's handlers.
fn restore_default_signal_handlers() {
    for signum in HANDLED_SIGNALS {
        if let Ok(sig) = Signal::try_from(*signum) {
            // SAFETY: installing SIG_DFL is always async-signal-safe and the
            // child is single-threaded at this point.
            unsafe {
                let _ = signal(sig, SigHandler::SigDfl);
            }
        }
    }
}

/// Baseline worker used by the command-line front-end: exports the queue
/// metadata into the environment and execs a configured worker command.
///
/// Embedders replace this by registering their own factory under
/// [`DEFAULT_KIND`].
pub struct ExecWorker {
    command: String,
    handle: WorkerHandle,
}

impl ExecWorker {
    pub fn factory(command: String) -> WorkerFactory {
        Box::new(move |handle| {
            Ok(Box::new(ExecWorker {
                command: command.clone(),
                handle: handle.clone(),
            }))
        })
    }
}

impl QueueWorker for ExecWorker {
    fn work(&mut self, interval: Duration) -> Result<()> {
        std::env::set_var("QUEUES", self.handle.queues.join(","));
        std::env::set_var("INTERVAL", interval.as_secs().to_string());
        std::env::set_var("TERM_TIMEOUT", self.handle.term_timeout.to_string());
        if self.handle.verbose {
            std::env::set_var("VERBOSE", "1");
        }
        if self.handle.very_verbose {
            std::env::set_var("VVERBOSE", "1");
        }

        let argv = [
            CString::new("sh")?,
            CString::new("-c")?,
            CString::new(self.command.as_str())?,
        ];
        // Replaces the child image; only returns on failure
        let err = execvp(&argv[0], &argv).unwrap_err();
        Err(anyhow::anyhow!(
            "exec of worker command '{}' failed: {}",
            self.command,
            err
        ))
    }
}
