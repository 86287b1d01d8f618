//! The master control loop.
//!
//! A single logical thread of control owns the registry, the configuration,
//! the backoff governors and the signal queue. Asynchronous signal delivery is
//! the only concurrent input, and the intake thread does nothing but enqueue
//! and wake the self-pipe. One loop iteration runs, in order: reap, poll
//! hooks, signal dispatch, bounded wait, configuration reload, reconcile.

use crate::backoff::BackoffGovernor;
use crate::config::{ConfigLoader, PoolOptions, QueueCounts, TermBehavior};
use crate::hooks::{Hooks, PollHook, PoolStatus, PreforkHook};
use crate::procline;
use crate::registry::{Registry, WorkerRecord};
use crate::signals::{PoolSignal, SignalIntake};
use crate::waker::SelfPipe;
use crate::worker::{self, KindRegistry, WorkerFactory, WorkerHandle, DEFAULT_KIND};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on one blocking wait inside the loop.
pub const LOOP_WAIT: Duration = Duration::from_secs(1);

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// A shutdown signal was dispatched; the loop must exit.
    Break,
}

/// The supervising process. All pool state is held here; there are no hidden
/// singletons beyond the logging subscriber.
pub struct Master {
    master_pid: Pid,
    options: PoolOptions,
    loader: Box<dyn ConfigLoader>,
    config: QueueCounts,
    registry: Registry,
    governors: HashMap<String, BackoffGovernor>,
    kinds: KindRegistry,
    hooks: Hooks,
    waker: Arc<SelfPipe>,
    intake: SignalIntake,
}

impl Master {
    /// Create a master for the calling process. Fails only if the self-pipe
    /// cannot be initialized.
    pub fn new(loader: Box<dyn ConfigLoader>, options: PoolOptions) -> Result<Self> {
        let waker = Arc::new(SelfPipe::new().context("initializing self-pipe waker")?);
        let master_pid = getpid();
        let intake = SignalIntake::new(master_pid, Arc::clone(&waker));
        procline::set("(initialized)");

        Ok(Self {
            master_pid,
            options,
            loader,
            config: QueueCounts::new(),
            registry: Registry::new(),
            governors: HashMap::new(),
            kinds: KindRegistry::new(),
            hooks: Hooks::new(),
            waker,
            intake,
        })
    }

    pub fn master_pid(&self) -> Pid {
        self.master_pid
    }

    /// Install a worker variant selectable with a `kind:` queue-group prefix.
    pub fn register_kind(&mut self, kind: &str, factory: WorkerFactory) -> Result<()> {
        self.kinds.register(kind, factory)?;
        Ok(())
    }

    /// Install the factory for queue groups without a kind prefix.
    pub fn register_default(&mut self, factory: WorkerFactory) {
        // DEFAULT_KIND is a valid ident, so this cannot fail
        let _ = self.kinds.register(DEFAULT_KIND, factory);
    }

    /// Add a hook run inside each freshly forked child before it works.
    pub fn after_prefork(&mut self, hook: PreforkHook) {
        self.hooks.add_after_prefork(hook);
    }

    /// Add a hook run once per loop iteration with a pool snapshot.
    pub fn poll_hook(&mut self, hook: PollHook) {
        self.hooks.add_poll(hook);
    }

    /// Feed a raw signal number through the intake as if the OS delivered it.
    /// The front-end uses this for self-signaling; tests drive scenarios with
    /// it without racing the intake thread.
    pub fn deliver_signal(&self, signum: i32) {
        self.intake.deliver(signum);
    }

    /// Snapshot of the pool for hooks, operators and tests.
    pub fn status(&self) -> PoolStatus {
        let backoff_groups = self
            .governors
            .iter()
            .filter(|(_, governor)| !governor.should_spawn())
            .map(|(group, _)| group.clone())
            .collect();

        PoolStatus {
            master_pid: self.master_pid,
            workers: self.registry.pids_by_group(),
            configured: self.config.clone(),
            backoff_groups,
            pending_signals: self.intake.pending(),
            dropped_signals: self.intake.dropped(),
        }
    }

    /// Start the pool and supervise it until a shutdown signal arrives.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        self.join()
    }

    /// Install signal handlers, load the configuration and spawn the initial
    /// worker set. Failures here are fatal; after `start` returns the master
    /// only ever exits through a shutdown signal.
    pub fn start(&mut self) -> Result<()> {
        procline::set("(starting)");
        self.intake
            .install()
            .context("installing signal handlers")?;
        self.load_config(true)?;
        self.reconcile();
        procline::set("(started)");
        tracing::info!(
            master_pid = %self.master_pid,
            workers = self.registry.total(),
            "pool started"
        );
        Ok(())
    }

    /// The steady-state supervisor loop.
    pub fn join(&mut self) -> Result<()> {
        loop {
            if self.tick()? == Flow::Break {
                break;
            }
        }
        procline::set("(shutting down)");
        tracing::info!("pool shut down");
        Ok(())
    }

    /// One loop iteration. Public so scenario tests can single-step the loop.
    pub fn tick(&mut self) -> Result<Flow> {
        self.reap_and_govern();
        self.run_poll_hooks();

        if let Some(sig) = self.intake.pop() {
            return self.dispatch(sig);
        }

        self.waker.wait(LOOP_WAIT);
        self.load_config(false)?;
        self.reconcile();
        Ok(Flow::Continue)
    }

    /// Reap exited children and update the backoff governors: a group whose
    /// oldest reaped child was younger than `delay_step` gets its governor
    /// delayed; any other reap means progress and discards the governor.
    fn reap_and_govern(&mut self) {
        let reaped = self.registry.reap_nonblocking();
        let now = Instant::now();

        for (group, starts) in reaped {
            let Some(oldest) = starts.iter().min().copied() else {
                continue;
            };
            if now.duration_since(oldest) < self.options.delay_step {
                let governor = self.governors.entry(group.clone()).or_insert_with(|| {
                    BackoffGovernor::new(self.options.delay_step, self.options.delay_max)
                });
                governor.delay_spawns();
                tracing::warn!(
                    queue_group = %group,
                    failed_count = governor.failed_count(),
                    "workers dying too quickly, delaying respawn"
                );
            } else {
                self.governors.remove(&group);
            }
        }
    }

    fn run_poll_hooks(&mut self) {
        if self.hooks.poll().is_empty() {
            return;
        }
        let status = self.status();
        for hook in self.hooks.poll() {
            if let Err(err) = hook(&status) {
                tracing::warn!(error = %err, "poll hook failed");
            }
        }
    }

    fn dispatch(&mut self, sig: PoolSignal) -> Result<Flow> {
        tracing::debug!(signal = ?sig, "handling signal");
        match sig {
            PoolSignal::Usr1 => {
                self.registry.signal_all(Signal::SIGUSR1);
                Ok(Flow::Continue)
            }
            PoolSignal::Usr2 => {
                self.registry.signal_all(Signal::SIGUSR2);
                Ok(Flow::Continue)
            }
            PoolSignal::Cont => {
                self.registry.signal_all(Signal::SIGCONT);
                Ok(Flow::Continue)
            }
            PoolSignal::Hup => {
                tracing::info!("HUP: reloading configuration and recycling workers");
                self.load_config(false)?;
                crate::logging::reopen();
                // Old workers quit gracefully; reconcile refills the pool as
                // they exit, and the replacements inherit the reopened logs
                self.registry.signal_all(self.graceful_quit_signal());
                self.reconcile();
                Ok(Flow::Continue)
            }
            PoolSignal::Winch => {
                if self.options.handle_winch {
                    tracing::info!("WINCH: scaling pool to zero");
                    self.config.clear();
                    self.reconcile();
                } else {
                    tracing::debug!("WINCH ignored");
                }
                Ok(Flow::Continue)
            }
            PoolSignal::Quit => {
                if self.options.term_child {
                    self.shutdown_immediate();
                } else {
                    self.graceful_shutdown_and_wait();
                }
                Ok(Flow::Break)
            }
            PoolSignal::Int => {
                self.graceful_shutdown();
                Ok(Flow::Break)
            }
            PoolSignal::Term => {
                match self.options.term_behavior {
                    TermBehavior::GracefulAndWait => self.graceful_shutdown_and_wait(),
                    TermBehavior::Graceful => self.graceful_shutdown(),
                    TermBehavior::TermAndWait => self.term_shutdown_and_wait(),
                    TermBehavior::Immediate => self.shutdown_immediate(),
                }
                Ok(Flow::Break)
            }
        }
    }

    /// The signal that makes a worker finish its current job and exit:
    /// workers running with a term-timeout wrapper treat `TERM` that way,
    /// plain workers treat `QUIT` that way.
    fn graceful_quit_signal(&self) -> Signal {
        if self.options.term_child {
            Signal::SIGTERM
        } else {
            Signal::SIGQUIT
        }
    }

    fn graceful_shutdown_and_wait(&mut self) {
        tracing::info!("graceful shutdown, waiting for workers");
        self.registry.signal_all(Signal::SIGUSR2);
        self.registry.signal_all(self.graceful_quit_signal());
        self.reap_blocking();
    }

    fn graceful_shutdown(&mut self) {
        tracing::info!("graceful shutdown, not waiting for workers");
        self.registry.signal_all(Signal::SIGUSR2);
        self.registry.signal_all(self.graceful_quit_signal());
    }

    fn shutdown_immediate(&mut self) {
        tracing::info!("immediate shutdown");
        self.registry.signal_all(Signal::SIGUSR2);
        let sig = if self.options.term_child {
            Signal::SIGQUIT
        } else {
            Signal::SIGTERM
        };
        self.registry.signal_all(sig);
    }

    fn term_shutdown_and_wait(&mut self) {
        tracing::info!("TERM shutdown, waiting for workers");
        self.registry.signal_all(Signal::SIGUSR2);
        self.registry.signal_all(Signal::SIGTERM);
        self.reap_blocking();
    }

    /// Wait until every child has been reaped. `INT` or `TERM` received while
    /// blocked here unwind the wait through the quit-now escape.
    fn reap_blocking(&mut self) {
        self.intake.set_waiting_for_reaper(true);
        loop {
            self.reap_and_govern();
            if self.registry.is_empty() {
                break;
            }
            if self.intake.take_quit_now() {
                tracing::info!("interrupted while waiting for workers, exiting now");
                break;
            }
            self.waker.wait(LOOP_WAIT);
        }
        self.intake.set_waiting_for_reaper(false);
    }

    /// Refresh the configuration through the loader, invoking its reset hook
    /// first. A failed reload keeps the previous configuration unless this is
    /// the startup load.
    fn load_config(&mut self, startup: bool) -> Result<()> {
        self.loader.reset();
        match self.loader.load(self.options.environment.as_deref()) {
            Ok(config) => {
                if config != self.config {
                    tracing::info!(queue_groups = config.len(), "configuration loaded");
                    self.config = config;
                }
                Ok(())
            }
            Err(err) if startup => Err(err.context("loading pool configuration")),
            Err(err) => {
                tracing::warn!(error = %err, "configuration reload failed, keeping previous");
                Ok(())
            }
        }
    }

    /// Queue groups the reconciler must consider: everything configured plus
    /// everything that still has live workers, so a group dropped from the
    /// configuration gets its surplus workers quit.
    fn known_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.config.keys().cloned().collect();
        for group in self.registry.group_names() {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups.sort();
        groups
    }

    /// Signed distance from live to declared count for one group. A positive
    /// delta collapses to zero while the group's governor forbids spawning;
    /// negative deltas pass through so the pool can still shrink mid-storm.
    fn delta(&self, queue_group: &str) -> i64 {
        let target = self.config.get(queue_group).copied().unwrap_or(0) as i64;
        let delta = target - self.registry.count(queue_group) as i64;
        if delta > 0 {
            if let Some(governor) = self.governors.get(queue_group) {
                if !governor.should_spawn() {
                    return 0;
                }
            }
        }
        delta
    }

    /// Bring every known queue group toward its declared count.
    fn reconcile(&mut self) {
        if !self.is_master() {
            return;
        }

        for group in self.known_groups() {
            let delta = self.delta(&group);
            if delta > 0 {
                for _ in 0..delta {
                    self.spawn(&group);
                }
            } else if delta < 0 {
                let quit = self.graceful_quit_signal();
                for pid in self.registry.first_pids(&group, -delta as usize) {
                    tracing::debug!(pid = %pid, queue_group = %group, "quitting surplus worker");
                    match kill(pid, quit) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(err) => {
                            tracing::warn!(pid = %pid, error = %err, "failed to quit worker");
                        }
                    }
                }
            }
        }

        self.update_procline();
    }

    /// Fork one worker for `queue_group`. An unknown worker kind is a
    /// configuration error: logged, the spawn skipped, the master continues.
    fn spawn(&mut self, queue_group: &str) {
        let resolved = match self.kinds.resolve(queue_group) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(error = %err, queue_group = %queue_group, "cannot spawn worker");
                return;
            }
        };

        let handle = WorkerHandle {
            queue_definition: queue_group.to_string(),
            queues: resolved.queues,
            kind: resolved.kind,
            spawned_at: Instant::now(),
            pool_master_pid: self.master_pid,
            worker_parent_pid: self.master_pid,
            term_timeout: self.options.term_timeout,
            term_child: self.options.term_child,
            interval: self.options.interval,
            verbose: self.options.verbose,
            very_verbose: self.options.very_verbose,
            run_at_exit_hooks: self.options.run_at_exit_hooks,
        };

        // SAFETY: the child calls run_child, which never returns and starts
        // from signal-handler restoration; the parent only records the pid.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                tracing::debug!(
                    pid = %child,
                    queue_group = %queue_group,
                    kind = %handle.kind,
                    "spawned worker"
                );
                self.registry.insert(WorkerRecord {
                    pid: child,
                    queue_group: queue_group.to_string(),
                    kind: handle.kind,
                    spawned_at: handle.spawned_at,
                });
                if let Some(throttle) = self.options.spawn_throttle {
                    std::thread::sleep(throttle);
                }
            }
            Ok(ForkResult::Child) => match self.kinds.factory(&handle.kind) {
                Some(factory) => {
                    worker::run_child(handle, factory, &self.hooks, self.options.single_pgrp)
                }
                // Unreachable: the kind resolved before the fork
                None => std::process::exit(70),
            },
            Err(err) => {
                tracing::error!(error = %err, queue_group = %queue_group, "fork failed");
            }
        }
    }

    fn update_procline(&self) {
        let pids: Vec<String> = self
            .registry
            .live_pids()
            .iter()
            .map(|pid| pid.to_string())
            .collect();
        procline::set(&format!("managing {}", pids.join(",")));
    }

    /// Master-only actions are refused in any forked child that still holds
    /// this value.
    fn is_master(&self) -> bool {
        getpid() == self.master_pid
    }
}
