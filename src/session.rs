//! A NETCONF session: one association between a client and a server.
//!
//! Sessions are shared as `Arc<Session>` across threads. All transport reads
//! and writes happen under the session's transport lock, so per-session
//! operations are strictly serial while distinct sessions proceed in
//! parallel. Out-of-order replies and notifications are parked on bounded
//! deferred queues and drained in insertion order by the next receive of the
//! matching kind.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::frame;
use crate::message::{classify, Capabilities, Hello, Inbound, Notification, Rpc, RpcReply};
use crate::schema::SchemaContext;
#[cfg(feature = "ssh")]
use crate::transport::ssh::SshConnection;
use crate::transport::{Transport, TransportKind};

/// Deferred inbound messages kept per kind before the oldest is dropped.
const DEFERRED_CAP: usize = 1024;

/// Malformed inbound messages tolerated on a server session before it is
/// terminated.
pub(crate) const MALFORMED_STRIKE_LIMIT: u16 = 3;

/// NETCONF protocol versions; the negotiated version selects the framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    /// NETCONF 1.0 (RFC 4741/4742), end-of-message framing.
    V10,
    /// NETCONF 1.1 (RFC 6241/6242), chunked framing.
    V11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Closing,
    Invalid,
}

/// Why a session became invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TermReason {
    /// Orderly close-session exchange.
    Closed,
    /// Terminated by a kill-session request.
    Killed,
    /// Transport failed or the peer disappeared.
    Dropped,
    /// Idle timeout enforced by the poll engine.
    Timeout,
    /// Hello exchange failed.
    BadHello,
    Other(String),
}

struct Meta {
    status: SessionStatus,
    term_reason: Option<TermReason>,
    version: Version,
    session_id: u32,
    capabilities: Capabilities,
}

/// Transport-side state, guarded by the session's transport lock.
pub(crate) struct Io {
    pub(crate) transport: Box<dyn Transport + Send>,
    /// Bytes read from the transport but not yet consumed by the codec.
    pub(crate) rbuf: Vec<u8>,
    pub(crate) malformed_strikes: u16,
}

struct Pending {
    /// Message-ids issued but not yet answered.
    outstanding: HashSet<u64>,
    replies: VecDeque<RpcReply>,
    notifs: VecDeque<Notification>,
}

pub struct Session {
    role: Role,
    meta: Mutex<Meta>,
    io: Mutex<Io>,
    msg_id: AtomicU64,
    pending: Mutex<Pending>,
    host: Option<String>,
    port: u16,
    username: Option<String>,
    idle_timeout_ms: i64,
    schema: Option<Arc<dyn SchemaContext>>,
    #[cfg(feature = "ssh")]
    ssh_conn: Option<Arc<SshConnection>>,
}

impl Session {
    pub(crate) fn new(role: Role, transport: Box<dyn Transport + Send>) -> Session {
        Session {
            role,
            meta: Mutex::new(Meta {
                status: SessionStatus::Starting,
                term_reason: None,
                version: Version::V10,
                session_id: 0,
                capabilities: Capabilities::default(),
            }),
            io: Mutex::new(Io { transport, rbuf: Vec::new(), malformed_strikes: 0 }),
            msg_id: AtomicU64::new(1),
            pending: Mutex::new(Pending {
                outstanding: HashSet::new(),
                replies: VecDeque::new(),
                notifs: VecDeque::new(),
            }),
            host: None,
            port: 0,
            username: None,
            idle_timeout_ms: 0,
            schema: None,
            #[cfg(feature = "ssh")]
            ssh_conn: None,
        }
    }

    pub(crate) fn set_peer(&mut self, host: impl Into<String>, port: u16) {
        self.host = Some(host.into());
        self.port = port;
    }

    pub(crate) fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
    }

    pub(crate) fn set_schema(&mut self, schema: Option<Arc<dyn SchemaContext>>) {
        self.schema = schema;
    }

    pub(crate) fn set_idle_timeout(&mut self, ms: i64) {
        self.idle_timeout_ms = ms;
    }

    #[cfg(feature = "ssh")]
    pub(crate) fn set_ssh_conn(&mut self, conn: Arc<SshConnection>) {
        self.ssh_conn = Some(conn);
    }

    /// The shared SSH connection, when this session is multiplexed over one.
    #[cfg(feature = "ssh")]
    pub(crate) fn ssh_conn(&self) -> Option<&Arc<SshConnection>> {
        self.ssh_conn.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        self.meta.lock().status
    }

    pub fn term_reason(&self) -> Option<TermReason> {
        self.meta.lock().term_reason.clone()
    }

    pub fn version(&self) -> Version {
        self.meta.lock().version
    }

    /// Server-assigned session identifier; zero until the hello exchange.
    pub fn session_id(&self) -> u32 {
        self.meta.lock().session_id
    }

    /// The peer's capability set as negotiated during hello.
    pub fn capabilities(&self) -> Capabilities {
        self.meta.lock().capabilities.clone()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.io.lock().transport.kind()
    }

    pub(crate) fn idle_timeout_ms(&self) -> i64 {
        self.idle_timeout_ms
    }

    pub(crate) fn schema(&self) -> Option<&Arc<dyn SchemaContext>> {
        self.schema.as_ref()
    }

    pub(crate) fn set_version(&self, version: Version) {
        self.meta.lock().version = version;
    }

    pub(crate) fn set_capabilities(&self, caps: Capabilities) {
        self.meta.lock().capabilities = caps;
    }

    /// Set exactly once by the server side of the hello exchange.
    pub(crate) fn set_session_id(&self, sid: u32) {
        let mut meta = self.meta.lock();
        if meta.session_id == 0 {
            meta.session_id = sid;
        }
    }

    pub(crate) fn set_running(&self) {
        let mut meta = self.meta.lock();
        if meta.status == SessionStatus::Starting {
            meta.status = SessionStatus::Running;
        }
    }

    pub(crate) fn set_closing(&self) {
        let mut meta = self.meta.lock();
        if matches!(meta.status, SessionStatus::Starting | SessionStatus::Running) {
            meta.status = SessionStatus::Closing;
        }
    }

    /// Terminal transition; the first reason recorded wins.
    pub(crate) fn invalidate(&self, reason: TermReason) {
        let mut meta = self.meta.lock();
        if meta.status != SessionStatus::Invalid {
            meta.status = SessionStatus::Invalid;
            meta.term_reason = Some(reason);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.meta.lock().status {
            SessionStatus::Running => Ok(()),
            _ => Err(Error::SessionClosed),
        }
    }

    /// Timed acquisition of the transport lock; contention past the timeout
    /// is the would-block outcome.
    pub(crate) fn lock_io(&self, timeout_ms: i32) -> Result<MutexGuard<'_, Io>> {
        if timeout_ms < 0 {
            Ok(self.io.lock())
        } else if timeout_ms == 0 {
            self.io.try_lock().ok_or(Error::Busy)
        } else {
            self.io
                .try_lock_for(Duration::from_millis(timeout_ms as u64))
                .ok_or(Error::Busy)
        }
    }

    pub(crate) fn try_lock_io(&self) -> Option<MutexGuard<'_, Io>> {
        self.io.try_lock()
    }

    /// Read descriptor for the poll engine.
    pub(crate) fn read_fd(&self) -> Option<RawFd> {
        self.io.lock().transport.read_fd()
    }

    /// Whether a complete or partial message is already buffered, invisible
    /// to a descriptor poll.
    pub(crate) fn has_buffered(&self) -> bool {
        match self.io.try_lock() {
            Some(io) => !io.rbuf.is_empty() || io.transport.buffered(),
            None => false,
        }
    }

    pub fn alive(&self) -> bool {
        match self.status() {
            SessionStatus::Invalid => false,
            _ => self.io.lock().transport.alive(),
        }
    }

    fn write_wire(&self, io: &mut Io, wire: &[u8]) -> Result<()> {
        match io.transport.write_all(wire) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.invalidate(TermReason::Dropped);
                }
                Err(e)
            }
        }
    }

    /// Read and classify one complete inbound message under the held lock.
    pub(crate) fn recv_inbound(&self, io: &mut Io, timeout_ms: i32) -> Result<Inbound> {
        let version = self.version();
        let raw = match frame::read_message(io.transport.as_mut(), &mut io.rbuf, version, timeout_ms)
        {
            Ok(raw) => raw,
            Err(e) => {
                if e.is_fatal() {
                    self.invalidate(TermReason::Dropped);
                }
                return Err(e);
            }
        };
        classify(&raw)
    }

    /// Send an RPC and return its message-id (strictly increasing from 1).
    pub fn send_rpc(&self, rpc: &Rpc, timeout_ms: i32) -> Result<u64> {
        self.ensure_running()?;
        self.send_rpc_startup(rpc, timeout_ms)
    }

    /// Like [`Session::send_rpc`] but allowed while the session is still
    /// starting; used by the handshake to fetch schemas.
    pub(crate) fn send_rpc_startup(&self, rpc: &Rpc, timeout_ms: i32) -> Result<u64> {
        if self.role != Role::Client {
            return Err(Error::InvalidArgument("send_rpc on a server session".into()));
        }
        let id = self.msg_id.fetch_add(1, Ordering::SeqCst);
        let wire = frame::encode(self.version(), &rpc.to_xml(id));
        let mut io = self.lock_io(timeout_ms)?;
        self.write_wire(&mut io, &wire)?;
        drop(io);
        self.pending.lock().outstanding.insert(id);
        debug!("session {}: sent rpc #{id}", self.session_id());
        Ok(id)
    }

    /// Receive the reply bearing `msg_id`, regardless of arrival order.
    ///
    /// Replies to other in-flight requests are parked on the deferred-reply
    /// queue; replies with unknown ids are logged and discarded;
    /// notifications arriving meanwhile are parked for
    /// [`Session::recv_notification`].
    pub fn recv_reply(&self, msg_id: u64, timeout_ms: i32) -> Result<RpcReply> {
        self.ensure_running()?;
        self.recv_reply_startup(msg_id, timeout_ms)
    }

    pub(crate) fn recv_reply_startup(&self, msg_id: u64, timeout_ms: i32) -> Result<RpcReply> {
        if self.role != Role::Client {
            return Err(Error::InvalidArgument("recv_reply on a server session".into()));
        }
        {
            let mut pending = self.pending.lock();
            let pos = pending.replies.iter().position(|r| r.numeric_id() == Some(msg_id));
            if let Some(reply) = pos.and_then(|p| pending.replies.remove(p)) {
                pending.outstanding.remove(&msg_id);
                return Ok(reply);
            }
        }
        let deadline = crate::transport::Deadline::new(timeout_ms);
        loop {
            let mut io = self.lock_io(deadline.remaining_ms())?;
            let inbound = self.recv_inbound(&mut io, deadline.remaining_ms());
            drop(io);
            match inbound {
                Ok(Inbound::Reply(reply)) => {
                    if reply.numeric_id() == Some(msg_id) {
                        self.pending.lock().outstanding.remove(&msg_id);
                        return Ok(reply);
                    }
                    self.defer_reply(reply);
                }
                Ok(Inbound::Notification(notif)) => self.defer_notification(notif),
                Ok(other) => {
                    warn!("session {}: discarding unexpected message: {other:?}", self.session_id())
                }
                // malformed inbound data does not kill a client session
                Err(Error::MalformedXml(m)) => {
                    warn!("session {}: skipping malformed message: {m}", self.session_id())
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive the next notification, draining the deferred queue first.
    pub fn recv_notification(&self, timeout_ms: i32) -> Result<Notification> {
        self.ensure_running()?;
        if self.role != Role::Client {
            return Err(Error::InvalidArgument("recv_notification on a server session".into()));
        }
        if let Some(n) = self.pending.lock().notifs.pop_front() {
            return Ok(n);
        }
        let deadline = crate::transport::Deadline::new(timeout_ms);
        loop {
            let mut io = self.lock_io(deadline.remaining_ms())?;
            let inbound = self.recv_inbound(&mut io, deadline.remaining_ms());
            drop(io);
            match inbound {
                Ok(Inbound::Notification(notif)) => return Ok(notif),
                Ok(Inbound::Reply(reply)) => self.defer_reply(reply),
                Ok(other) => {
                    warn!("session {}: discarding unexpected message: {other:?}", self.session_id())
                }
                Err(Error::MalformedXml(m)) => {
                    warn!("session {}: skipping malformed message: {m}", self.session_id())
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn defer_reply(&self, reply: RpcReply) {
        let mut pending = self.pending.lock();
        let known = reply
            .numeric_id()
            .map(|id| pending.outstanding.contains(&id))
            .unwrap_or(false);
        if !known {
            warn!(
                "session {}: discarding reply with unknown message-id {:?}",
                self.session_id(),
                reply.message_id
            );
            return;
        }
        pending.replies.push_back(reply);
        if pending.replies.len() > DEFERRED_CAP {
            pending.replies.pop_front();
            warn!("session {}: deferred-reply queue overflow, oldest dropped", self.session_id());
        }
    }

    fn defer_notification(&self, notif: Notification) {
        let mut pending = self.pending.lock();
        pending.notifs.push_back(notif);
        if pending.notifs.len() > DEFERRED_CAP {
            pending.notifs.pop_front();
            warn!(
                "session {}: deferred-notification queue overflow, oldest dropped",
                self.session_id()
            );
        }
    }

    /// Server side: send a reply built by an RPC handler.
    pub fn send_reply(&self, reply: &RpcReply, timeout_ms: i32) -> Result<()> {
        self.ensure_running()?;
        if self.role != Role::Server {
            return Err(Error::InvalidArgument("send_reply on a client session".into()));
        }
        let wire = frame::encode(self.version(), &reply.to_xml());
        let mut io = self.lock_io(timeout_ms)?;
        self.write_wire(&mut io, &wire)
    }

    /// Server side: send a notification to a subscribed client.
    pub fn send_notification(
        &self,
        event_time: &str,
        body: &str,
        timeout_ms: i32,
    ) -> Result<()> {
        self.ensure_running()?;
        if self.role != Role::Server {
            return Err(Error::InvalidArgument("send_notification on a client session".into()));
        }
        let wire = frame::encode(self.version(), &Notification::to_xml(event_time, body));
        let mut io = self.lock_io(timeout_ms)?;
        self.write_wire(&mut io, &wire)
    }

    pub(crate) fn send_hello(&self, hello: &Hello, timeout_ms: i32) -> Result<()> {
        // hello always travels in 1.0 framing, whatever is negotiated later
        let wire = frame::encode(Version::V10, &hello.to_xml());
        let mut io = self.lock_io(timeout_ms)?;
        self.write_wire(&mut io, &wire)
    }

    pub(crate) fn recv_hello(&self, timeout_ms: i32) -> Result<Hello> {
        let mut guard = self.lock_io(timeout_ms)?;
        let io = &mut *guard;
        let raw = match frame::read_message(
            io.transport.as_mut(),
            &mut io.rbuf,
            Version::V10,
            timeout_ms,
        ) {
            Ok(raw) => raw,
            Err(e) => {
                if e.is_fatal() {
                    self.invalidate(TermReason::Dropped);
                }
                return Err(e);
            }
        };
        drop(guard);
        match classify(&raw)? {
            Inbound::Hello(hello) => Ok(hello),
            _ => Err(Error::MalformedXml("expected hello".into())),
        }
    }

    /// Close the session: a client sends `<close-session>` first, both sides
    /// release the transport. Safe to call repeatedly.
    pub fn close(&self, timeout_ms: i32) -> Result<()> {
        {
            let mut meta = self.meta.lock();
            match meta.status {
                SessionStatus::Closing | SessionStatus::Invalid => return Ok(()),
                SessionStatus::Starting => {
                    meta.status = SessionStatus::Invalid;
                    meta.term_reason = Some(TermReason::Closed);
                    drop(meta);
                    if let Some(mut io) = self.io.try_lock() {
                        io.transport.close();
                    }
                    return Ok(());
                }
                SessionStatus::Running => meta.status = SessionStatus::Closing,
            }
        }
        if self.role == Role::Client {
            let id = self.msg_id.fetch_add(1, Ordering::SeqCst);
            let rpc = Rpc::Generic { content: "<close-session/>".into() };
            let wire = frame::encode(self.version(), &rpc.to_xml(id));
            if let Ok(mut io) = self.lock_io(timeout_ms) {
                if self.write_wire(&mut io, &wire).is_ok() {
                    // best-effort wait for the peer's ok before tearing down
                    let wait = if timeout_ms < 0 { 1000 } else { timeout_ms.min(1000) };
                    let _ = self.recv_inbound(&mut io, wait);
                }
            }
        }
        if let Some(mut io) = self.try_lock_io() {
            io.transport.close();
        }
        self.invalidate(TermReason::Closed);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // no close-session here: dropping must not block on the peer
        self.io.get_mut().transport.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("status", &self.status())
            .field("session_id", &self.session_id())
            .field("version", &self.version())
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct NullTransport;

    impl Transport for NullTransport {
        fn read(&mut self, _buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
            Err(Error::Timeout)
        }

        fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }

        fn alive(&self) -> bool {
            true
        }

        fn read_fd(&self) -> Option<RawFd> {
            None
        }

        fn close(&mut self) {}

        fn kind(&self) -> TransportKind {
            TransportKind::Fd
        }
    }

    #[test]
    fn message_ids_start_at_one_and_increase() {
        let session = Session::new(Role::Client, Box::new(NullTransport));
        session.set_running();
        let ids: Vec<u64> = (0..5)
            .map(|_| session.send_rpc(&Rpc::DiscardChanges, -1).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn operations_fail_on_closed_session() {
        let session = Session::new(Role::Client, Box::new(NullTransport));
        session.set_running();
        session.invalidate(TermReason::Dropped);
        assert!(matches!(
            session.send_rpc(&Rpc::DiscardChanges, -1),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.recv_reply(1, 0), Err(Error::SessionClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let session = Session::new(Role::Client, Box::new(NullTransport));
        session.set_running();
        session.close(0).unwrap();
        session.close(0).unwrap();
        assert_eq!(session.status(), SessionStatus::Invalid);
        assert_eq!(session.term_reason(), Some(TermReason::Closed));
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let session = Session::new(Role::Server, Box::new(NullTransport));
        assert_eq!(session.status(), SessionStatus::Starting);
        session.set_running();
        assert_eq!(session.status(), SessionStatus::Running);
        session.invalidate(TermReason::Dropped);
        session.set_running();
        assert_eq!(session.status(), SessionStatus::Invalid);
        assert_eq!(session.term_reason(), Some(TermReason::Dropped));
    }

    #[test]
    fn session_id_is_set_exactly_once() {
        let session = Session::new(Role::Server, Box::new(NullTransport));
        session.set_session_id(17);
        session.set_session_id(99);
        assert_eq!(session.session_id(), 17);
    }
}
