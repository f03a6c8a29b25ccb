//! Transports for NETCONF sessions.
//!
//! Every session talks to its peer through a [`Transport`]: raw file
//! descriptors for stdio subprocess setups and tests, an SSH channel on an
//! authenticated SSH connection, or a TLS stream over TCP. All variants share
//! the same blocking-with-timeout contract; cancellation is by timeout only.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};

pub mod fd;

#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "ssh")]
pub(crate) mod ssh_server;

#[cfg(feature = "tls")]
pub mod tls;

/// Sleep between unsuccessful reads due to EAGAIN/EWOULDBLOCK.
pub(crate) const READ_SLEEP: Duration = Duration::from_micros(100);

/// Which transport variant a session runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// A pair of raw file descriptors (stdio subprocess, tests).
    Fd,
    /// A channel on an authenticated SSH connection, `netconf` subsystem.
    Ssh,
    /// A TLS stream over a connected TCP socket.
    Tls,
}

/// Byte transport under a NETCONF session.
///
/// Reads may suspend the caller up to the timeout: negative means infinite,
/// zero is a non-blocking probe. A read that cannot make progress in time
/// returns [`Error::Timeout`]; an orderly peer close returns
/// [`Error::TransportEof`]. Writes are atomic with respect to other writers
/// because the session performs them under its transport lock.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Probe liveness without consuming bytes.
    fn alive(&self) -> bool;

    /// Whether decrypted bytes are already buffered inside the transport,
    /// invisible to a poll on [`Transport::read_fd`].
    fn buffered(&self) -> bool {
        false
    }

    /// Read-side descriptor for the poll engine, if the variant has one.
    fn read_fd(&self) -> Option<RawFd>;

    /// Release transport resources. Idempotent.
    fn close(&mut self);

    fn kind(&self) -> TransportKind;
}

/// Millisecond deadline arithmetic shared by all transports and codecs.
///
/// A negative construction timeout never expires; zero yields a probe whose
/// remaining budget is always zero, so each underlying wait degenerates to a
/// non-blocking attempt.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub fn new(timeout_ms: i32) -> Deadline {
        if timeout_ms < 0 {
            Deadline { end: None }
        } else {
            Deadline { end: Some(Instant::now() + Duration::from_millis(timeout_ms as u64)) }
        }
    }

    /// Remaining budget in ms: -1 = unbounded, 0 = exhausted (probe only).
    pub fn remaining_ms(&self) -> i32 {
        match self.end {
            None => -1,
            Some(end) => {
                let now = Instant::now();
                if now >= end {
                    0
                } else {
                    (end - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }
}

fn poll_once(fd: BorrowedFd<'_>, events: PollFlags, timeout_ms: i32) -> Result<PollFlags> {
    let timeout = if timeout_ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
    };
    let mut fds = [PollFd::new(fd, events)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(PollFlags::empty()),
            Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Transport(std::io::Error::from(e))),
        }
    }
}

/// Wait until `fd` is readable, hung up, or the timeout elapses.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> Result<bool> {
    let revents = poll_once(fd, PollFlags::POLLIN, timeout_ms)?;
    Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

/// Wait until `fd` accepts more output or the timeout elapses.
pub(crate) fn wait_writable(fd: BorrowedFd<'_>, timeout_ms: i32) -> Result<bool> {
    let revents = poll_once(fd, PollFlags::POLLOUT, timeout_ms)?;
    Ok(revents.intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR))
}

/// Non-destructive liveness probe: false once the peer end reports
/// HUP/ERR/NVAL. Pending readable data does not count against liveness.
pub(crate) fn fd_alive(fd: BorrowedFd<'_>) -> bool {
    match poll_once(fd, PollFlags::empty(), 0) {
        Ok(revents) => {
            !revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        }
        Err(_) => false,
    }
}
