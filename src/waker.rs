//! Self-pipe wake channel for the master's bounded wait.
//!
//! The signal thread writes one byte to break the master out of its blocking
//! wait; the master drains the pipe on wake. Both descriptors are close-on-exec
//! so exec'd children can never touch them, and non-blocking so a full pipe is
//! never an error (the master is about to wake anyway).

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe2, read, write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

/// A one-byte pipe pair owned exclusively by the master process.
///
/// Dropping the pair (e.g. on re-init) closes both descriptors.
pub struct SelfPipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl SelfPipe {
    pub fn new() -> nix::Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            read_end,
            write_end,
        })
    }

    /// Write a single wake byte, retrying on interrupt.
    ///
    /// A full pipe (EAGAIN) means a wake is already pending, which is all we
    /// need, so it counts as success.
    pub fn wake(&self) {
        loop {
            match write(&self.write_end, b"!") {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "self-pipe wake failed");
                    break;
                }
            }
        }
    }

    /// Block until the pipe is readable or `timeout` elapses, then drain it.
    ///
    /// Returns true if a wake byte was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let mut fds = [PollFd::new(self.read_end.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => false,
            Ok(_) => {
                self.drain();
                true
            }
            Err(Errno::EINTR) => {
                // A signal landed mid-wait; the enqueue side also wakes the
                // pipe, so drain whatever is there and let the loop proceed.
                self.drain()
            }
            Err(err) => {
                tracing::warn!(error = %err, "self-pipe wait failed");
                false
            }
        }
    }

    /// Consume every pending byte without blocking. Returns true if any were read.
    fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            match read(self.read_end.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => drained = true,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        drained
    }
}
