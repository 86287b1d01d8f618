use crate::waker::SelfPipe;
use nix::unistd::{getpid, Pid};
use signal_hook::consts::{
    SIGCHLD, SIGCONT, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2, SIGWINCH,
};
use signal_hook::iterator::{Handle, Signals};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Maximum number of deferred signals held for the master loop.
/// Deliveries beyond this are dropped with a log line.
pub const SIGNAL_QUEUE_CAPACITY: usize = 5;

/// Raw signal numbers the master installs handlers for.
pub const HANDLED_SIGNALS: &[i32] = &[
    SIGQUIT, SIGINT, SIGTERM, SIGUSR1, SIGUSR2, SIGCONT, SIGHUP, SIGWINCH, SIGCHLD,
];

/// A deferred signal token consumed by the master loop, one per iteration.
///
/// `CHLD` never becomes a token; it only wakes the master so it can reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSignal {
    Usr1,
    Usr2,
    Cont,
    Hup,
    Winch,
    Quit,
    Int,
    Term,
}

impl PoolSignal {
    fn from_raw(signum: i32) -> Option<Self> {
        match signum {
            SIGUSR1 => Some(Self::Usr1),
            SIGUSR2 => Some(Self::Usr2),
            SIGCONT => Some(Self::Cont),
            SIGHUP => Some(Self::Hup),
            SIGWINCH => Some(Self::Winch),
            SIGQUIT => Some(Self::Quit),
            SIGINT => Some(Self::Int),
            SIGTERM => Some(Self::Term),
            _ => None,
        }
    }
}

struct Shared {
    master_pid: Pid,
    queue: Mutex<VecDeque<PoolSignal>>,
    dropped: AtomicU64,
    quit_now: AtomicBool,
    waiting_for_reaper: AtomicBool,
    waker: Arc<SelfPipe>,
}

impl Shared {
    fn deliver(&self, signum: i32) {
        // Handlers fire in forked children until the child restores default
        // dispositions; master-only state must never be touched there.
        if getpid() != self.master_pid {
            return;
        }

        if signum == SIGCHLD {
            self.waker.wake();
            return;
        }

        // While the master is blocked in a wait-for-all reap, INT and TERM
        // bypass the queue entirely: they become the quit-now escape that
        // unwinds the blocking reap.
        if (signum == SIGINT || signum == SIGTERM)
            && self.waiting_for_reaper.load(Ordering::SeqCst)
        {
            self.quit_now.store(true, Ordering::SeqCst);
            self.waker.wake();
            return;
        }

        let Some(token) = PoolSignal::from_raw(signum) else {
            return;
        };

        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= SIGNAL_QUEUE_CAPACITY {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(signal = ?token, "signal queue full, dropping signal");
            } else {
                queue.push_back(token);
            }
        }
        self.waker.wake();
    }
}

/// Translates asynchronous OS signals into synchronous work for the master.
///
/// `install` spawns a dedicated thread consuming a `signal_hook` iterator;
/// the thread only appends to the bounded queue and wakes the self-pipe.
pub struct SignalIntake {
    shared: Arc<Shared>,
    handle: Option<Handle>,
}

impl SignalIntake {
    pub fn new(master_pid: Pid, waker: Arc<SelfPipe>) -> Self {
        Self {
            shared: Arc::new(Shared {
                master_pid,
                queue: Mutex::new(VecDeque::new()),
                dropped: AtomicU64::new(0),
                quit_now: AtomicBool::new(false),
                waiting_for_reaper: AtomicBool::new(false),
                waker,
            }),
            handle: None,
        }
    }

    /// Install handlers for all pool signals and start the intake thread.
    pub fn install(&mut self) -> anyhow::Result<()> {
        let mut signals = Signals::new(HANDLED_SIGNALS)?;
        self.handle = Some(signals.handle());
        let shared = Arc::clone(&self.shared);

        thread::Builder::new()
            .name("respool-signals".to_string())
            .spawn(move || {
                for signum in signals.forever() {
                    shared.deliver(signum);
                }
            })?;

        Ok(())
    }

    /// Feed a raw signal number through the intake as if the OS delivered it.
    pub fn deliver(&self, signum: i32) {
        self.shared.deliver(signum);
    }

    /// Take the oldest deferred signal, if any.
    pub fn pop(&self) -> Option<PoolSignal> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Number of deliveries dropped on queue overflow.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Mark whether the master is currently blocked in a wait-for-all reap.
    pub fn set_waiting_for_reaper(&self, waiting: bool) {
        self.shared
            .waiting_for_reaper
            .store(waiting, Ordering::SeqCst);
    }

    /// Consume the quit-now escape flag.
    pub fn take_quit_now(&self) -> bool {
        self.shared.quit_now.swap(false, Ordering::SeqCst)
    }
}

impl Drop for SignalIntake {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake() -> SignalIntake {
        let waker = Arc::new(SelfPipe::new().unwrap());
        SignalIntake::new(getpid(), waker)
    }

    #[test]
    fn test_signals_queue_in_receipt_order() {
        let intake = intake();
        intake.deliver(SIGUSR1);
        intake.deliver(SIGHUP);
        intake.deliver(SIGUSR2);

        assert_eq!(intake.pop(), Some(PoolSignal::Usr1));
        assert_eq!(intake.pop(), Some(PoolSignal::Hup));
        assert_eq!(intake.pop(), Some(PoolSignal::Usr2));
        assert_eq!(intake.pop(), None);
    }

    #[test]
    fn test_queue_is_bounded_and_counts_drops() {
        let intake = intake();
        for _ in 0..8 {
            intake.deliver(SIGUSR1);
        }

        assert_eq!(intake.pending(), SIGNAL_QUEUE_CAPACITY);
        assert_eq!(intake.dropped(), 3);

        let mut dispatched = 0;
        while intake.pop().is_some() {
            dispatched += 1;
        }
        assert_eq!(dispatched, SIGNAL_QUEUE_CAPACITY);
    }

    #[test]
    fn test_chld_wakes_but_is_not_queued() {
        let waker = Arc::new(SelfPipe::new().unwrap());
        let intake = SignalIntake::new(getpid(), Arc::clone(&waker));

        intake.deliver(SIGCHLD);
        assert_eq!(intake.pending(), 0);
        assert!(waker.wait(std::time::Duration::from_millis(50)));
    }

    #[test]
    fn test_delivery_in_non_master_process_is_a_no_op() {
        let waker = Arc::new(SelfPipe::new().unwrap());
        // Pretend the master is some other process: every delivery must be ignored
        let intake = SignalIntake::new(Pid::from_raw(1), waker);

        intake.deliver(SIGUSR1);
        intake.deliver(SIGTERM);
        assert_eq!(intake.pending(), 0);
        assert!(!intake.take_quit_now());
    }

    #[test]
    fn test_int_during_blocking_reap_becomes_quit_now() {
        let intake = intake();
        intake.set_waiting_for_reaper(true);

        intake.deliver(SIGINT);
        assert_eq!(intake.pending(), 0, "quit-now must bypass the queue");
        assert!(intake.take_quit_now());
        assert!(!intake.take_quit_now(), "flag is consumed on read");

        intake.set_waiting_for_reaper(false);
        intake.deliver(SIGINT);
        assert_eq!(intake.pop(), Some(PoolSignal::Int));
    }

    #[test]
    fn test_term_during_blocking_reap_becomes_quit_now() {
        let intake = intake();
        intake.set_waiting_for_reaper(true);
        intake.deliver(SIGTERM);
        assert!(intake.take_quit_now());
        assert_eq!(intake.pending(), 0);
    }

    #[test]
    fn test_every_enqueue_wakes_the_pipe() {
        let waker = Arc::new(SelfPipe::new().unwrap());
        let intake = SignalIntake::new(getpid(), Arc::clone(&waker));

        intake.deliver(SIGUSR2);
        assert!(waker.wait(std::time::Duration::from_millis(50)));
    }
}
