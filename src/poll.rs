//! Poll engine: a set of server sessions multiplexed onto one wait.
//!
//! The set only references sessions; it never owns them. One caller at a time
//! runs [`PollSet::poll`], which waits for any referenced session to become
//! readable, reads exactly one message from one session under that session's
//! transport lock, and dispatches it. Sessions that became ready are served
//! in FIFO order across calls; concurrent `add`/`remove` from other threads
//! is allowed.

use std::collections::VecDeque;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::frame;
use crate::message::{Inbound, ReceivedRpc, ReplyBody, RpcError, RpcReply};
use crate::session::{
    Io, Session, SessionStatus, TermReason, MALFORMED_STRIKE_LIMIT,
};
use crate::transport::Deadline;

/// Produces the reply body for one inbound RPC. Called with the session's
/// transport lock held; do not perform session I/O from inside.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, session: &Arc<Session>, rpc: &ReceivedRpc) -> ReplyBody;
}

impl<F> RpcHandler for F
where
    F: Fn(&Arc<Session>, &ReceivedRpc) -> ReplyBody + Send + Sync,
{
    fn handle(&self, session: &Arc<Session>, rpc: &ReceivedRpc) -> ReplyBody {
        self(session, rpc)
    }
}

/// Outcome of one [`PollSet::poll`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing became ready within the timeout.
    Timeout,
    /// One RPC was read, handled and answered.
    RpcDispatched,
    /// A session left the running state (closed, dropped, or idled out) and
    /// was removed from the set.
    SessionStateChanged,
}

struct Entry {
    token: u64,
    session: Arc<Session>,
    fd: Option<RawFd>,
    last_event: Instant,
}

enum Dispatch {
    Status(PollStatus),
    /// Nothing conclusive; keep polling within the deadline.
    Continue,
    /// The session's transport lock is held elsewhere; retry later.
    Requeue,
}

#[derive(Default)]
pub struct PollSet {
    entries: Mutex<Vec<Entry>>,
    /// FIFO of tokens that became ready; drained one dispatch per poll call.
    ready: Mutex<VecDeque<u64>>,
    next_token: AtomicU64,
    /// poll() is a single-caller operation.
    gate: Mutex<()>,
}

impl PollSet {
    pub fn new() -> PollSet {
        PollSet::default()
    }

    pub fn add(&self, session: Arc<Session>) -> Result<()> {
        if session.status() != SessionStatus::Running {
            return Err(Error::SessionClosed);
        }
        let fd = session.read_fd();
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| Arc::ptr_eq(&e.session, &session)) {
            return Err(Error::InvalidArgument("session already in the poll set".into()));
        }
        entries.push(Entry {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            session,
            fd,
            last_event: Instant::now(),
        });
        Ok(())
    }

    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.session, session));
        before != entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.ready.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn remove_token(&self, token: u64) {
        self.entries.lock().retain(|e| e.token != token);
    }

    fn touch(&self, token: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.token == token) {
            entry.last_event = Instant::now();
        }
    }

    /// Idle or no-longer-running session, if any: move it out of the set.
    fn collect_one(&self) -> Option<PollStatus> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let pos = entries.iter().position(|e| {
            if e.session.status() != SessionStatus::Running {
                return true;
            }
            let idle = e.session.idle_timeout_ms();
            idle > 0 && now.duration_since(e.last_event).as_millis() as i64 >= idle
        })?;
        let entry = entries.remove(pos);
        drop(entries);
        if entry.session.status() == SessionStatus::Running {
            warn!("session {}: idle timeout, closing", entry.session.session_id());
            entry.session.set_closing();
        }
        Some(PollStatus::SessionStateChanged)
    }

    /// Wait up to the timeout for one session to become readable and process
    /// at most one message from it.
    pub fn poll(&self, timeout_ms: i32, handler: &dyn RpcHandler) -> Result<PollStatus> {
        let _gate = self.gate.lock();
        let deadline = Deadline::new(timeout_ms);
        let mut first = true;
        loop {
            if !first && deadline.remaining_ms() == 0 {
                return Ok(PollStatus::Timeout);
            }
            first = false;
            if let Some(status) = self.collect_one() {
                return Ok(status);
            }

            let snapshot: Vec<(u64, Arc<Session>, Option<RawFd>)> = {
                let entries = self.entries.lock();
                entries
                    .iter()
                    .map(|e| (e.token, Arc::clone(&e.session), e.fd))
                    .collect()
            };

            let mut newly_ready: Vec<u64> = snapshot
                .iter()
                .filter(|(_, session, _)| session.has_buffered())
                .map(|(token, _, _)| *token)
                .collect();

            if newly_ready.is_empty() {
                match self.wait_on_fds(&snapshot, deadline.remaining_ms())? {
                    WaitOutcome::Ready(tokens) => newly_ready = tokens,
                    WaitOutcome::Hangup(token) => {
                        if let Some((_, session, _)) =
                            snapshot.iter().find(|(t, _, _)| *t == token)
                        {
                            session.invalidate(TermReason::Dropped);
                        }
                        self.remove_token(token);
                        return Ok(PollStatus::SessionStateChanged);
                    }
                    WaitOutcome::Nothing => continue,
                }
            }

            {
                let mut ready = self.ready.lock();
                for token in newly_ready {
                    if !ready.contains(&token) {
                        ready.push_back(token);
                    }
                }
            }

            let token = {
                let mut ready = self.ready.lock();
                let entries = self.entries.lock();
                loop {
                    match ready.pop_front() {
                        Some(t) if entries.iter().any(|e| e.token == t) => break Some(t),
                        Some(_) => continue,
                        None => break None,
                    }
                }
            };
            let Some(token) = token else { continue };
            let Some(session) = ({
                let entries = self.entries.lock();
                entries
                    .iter()
                    .find(|e| e.token == token)
                    .map(|e| Arc::clone(&e.session))
            }) else {
                continue;
            };

            match self.dispatch(token, &session, handler, &deadline)? {
                Dispatch::Status(status) => return Ok(status),
                Dispatch::Continue => continue,
                Dispatch::Requeue => {
                    self.ready.lock().push_back(token);
                    std::thread::sleep(crate::transport::READ_SLEEP);
                    continue;
                }
            }
        }
    }

    fn wait_on_fds(
        &self,
        snapshot: &[(u64, Arc<Session>, Option<RawFd>)],
        timeout_ms: i32,
    ) -> Result<WaitOutcome> {
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
        };
        let with_fd: Vec<(u64, RawFd)> = snapshot
            .iter()
            .filter_map(|(token, _, fd)| fd.map(|fd| (*token, fd)))
            .collect();
        if with_fd.is_empty() {
            // nothing to wait on; sleep a slice so concurrent add() is seen
            let ms = if timeout_ms < 0 { 10 } else { timeout_ms.min(10) };
            std::thread::sleep(std::time::Duration::from_millis(ms as u64));
            return Ok(WaitOutcome::Nothing);
        }
        let mut fds: Vec<PollFd<'_>> = with_fd
            .iter()
            .map(|(_, fd)| {
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN)
            })
            .collect();
        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(WaitOutcome::Nothing),
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::Transport(std::io::Error::from(e))),
            }
        }
        let mut ready = Vec::new();
        for (i, fd) in fds.iter().enumerate() {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLIN) {
                ready.push(with_fd[i].0);
            } else if revents
                .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
            {
                return Ok(WaitOutcome::Hangup(with_fd[i].0));
            }
        }
        if ready.is_empty() {
            Ok(WaitOutcome::Nothing)
        } else {
            Ok(WaitOutcome::Ready(ready))
        }
    }

    fn dispatch(
        &self,
        token: u64,
        session: &Arc<Session>,
        handler: &dyn RpcHandler,
        deadline: &Deadline,
    ) -> Result<Dispatch> {
        let Some(mut io) = session.try_lock_io() else {
            return Ok(Dispatch::Requeue);
        };
        match session.recv_inbound(&mut io, deadline.remaining_ms()) {
            Ok(Inbound::Rpc(rpc)) if rpc.operation == "close-session" => {
                debug!("session {}: close-session", session.session_id());
                let reply = RpcReply::ok(rpc.message_id.clone());
                let _ = self.write_reply(session, &mut io, &reply);
                session.set_closing();
                io.transport.close();
                drop(io);
                session.invalidate(TermReason::Closed);
                self.remove_token(token);
                Ok(Dispatch::Status(PollStatus::SessionStateChanged))
            }
            Ok(Inbound::Rpc(rpc)) => {
                let body = handler.handle(session, &rpc);
                let reply = RpcReply { message_id: rpc.message_id.clone(), body };
                self.write_reply(session, &mut io, &reply)?;
                drop(io);
                self.touch(token);
                Ok(Dispatch::Status(PollStatus::RpcDispatched))
            }
            Ok(other) => {
                warn!(
                    "session {}: unexpected message in server poll: {other:?}",
                    session.session_id()
                );
                self.touch(token);
                Ok(Dispatch::Continue)
            }
            Err(Error::MalformedXml(m)) => {
                // answer with malformed-message; repeated offenders are cut off
                io.malformed_strikes += 1;
                warn!(
                    "session {}: malformed rpc ({m}), strike {}",
                    session.session_id(),
                    io.malformed_strikes
                );
                if io.malformed_strikes >= MALFORMED_STRIKE_LIMIT {
                    io.transport.close();
                    drop(io);
                    session.invalidate(TermReason::Other("repeated malformed input".into()));
                    self.remove_token(token);
                    return Ok(Dispatch::Status(PollStatus::SessionStateChanged));
                }
                let reply = RpcReply::error("", RpcError::malformed_message());
                self.write_reply(session, &mut io, &reply)?;
                drop(io);
                self.touch(token);
                Ok(Dispatch::Status(PollStatus::RpcDispatched))
            }
            Err(Error::Timeout) => Ok(Dispatch::Continue),
            Err(e) if e.is_fatal() => {
                drop(io);
                session.invalidate(TermReason::Dropped);
                self.remove_token(token);
                Ok(Dispatch::Status(PollStatus::SessionStateChanged))
            }
            Err(e) => Err(e),
        }
    }

    fn write_reply(&self, session: &Arc<Session>, io: &mut Io, reply: &RpcReply) -> Result<()> {
        let wire = frame::encode(session.version(), &reply.to_xml());
        io.transport.write_all(&wire)
    }
}

enum WaitOutcome {
    Ready(Vec<u64>),
    Hangup(u64),
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    impl RpcHandler for DenyAll {
        fn handle(&self, _session: &Arc<Session>, _rpc: &ReceivedRpc) -> ReplyBody {
            ReplyBody::Errors(vec![RpcError::new("application", "operation-failed", "error")])
        }
    }

    #[test]
    fn empty_set_times_out() {
        let set = PollSet::new();
        assert_eq!(set.poll(20, &DenyAll).unwrap(), PollStatus::Timeout);
        assert_eq!(set.poll(0, &DenyAll).unwrap(), PollStatus::Timeout);
    }

    #[test]
    fn clear_detaches_everything() {
        let set = PollSet::new();
        set.clear();
        assert!(set.is_empty());
    }
}
