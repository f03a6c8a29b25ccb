//! NETCONF server: named listening endpoints per transport, the accept loop,
//! and Call-Home dial-out.
//!
//! Endpoint configuration is serialized per transport kind by its own lock;
//! none of those locks is ever held across transport I/O. The accept loop
//! polls every bound listener, performs the transport handshake and
//! authentication for the endpoint that became ready, and finishes with the
//! NETCONF hello.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
#[cfg(any(feature = "ssh", feature = "tls"))]
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::handshake;
use crate::message::{Capabilities, CAP_BASE_10, CAP_BASE_11, CAP_WRITABLE_RUNNING};
use crate::session::{Role, Session};
use crate::transport::{Transport, TransportKind};
use crate::{PORT_CH_SSH, PORT_CH_TLS};

#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "tls")]
pub mod tls;

/// Server-wide protocol options.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Deadline for the hello exchange of a freshly accepted connection.
    pub hello_timeout_ms: i32,
    /// Sessions idle longer than this are closed by the poll engine;
    /// zero disables idle collection.
    pub idle_timeout_ms: i64,
    /// Feature capability URIs advertised on top of the base versions.
    pub capabilities: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            hello_timeout_ms: 60_000,
            idle_timeout_ms: 0,
            capabilities: vec![CAP_WRITABLE_RUNNING.to_string()],
        }
    }
}

struct Bind {
    name: String,
    kind: TransportKind,
    address: String,
    port: u16,
    listener: Option<TcpListener>,
}

impl Bind {
    fn ensure_bound(&mut self) -> Result<()> {
        if self.listener.is_none() {
            let listener = TcpListener::bind((self.address.as_str(), self.port))
                .map_err(Error::Transport)?;
            listener.set_nonblocking(true).map_err(Error::Transport)?;
            info!("endpoint {}: listening on {}:{}", self.name, self.address, self.port);
            self.listener = Some(listener);
        }
        Ok(())
    }
}

pub struct Server {
    config: ServerConfig,
    binds: Mutex<Vec<Bind>>,
    #[cfg(feature = "ssh")]
    ssh_endpoints: Mutex<Vec<ssh::SshEndpoint>>,
    #[cfg(feature = "tls")]
    tls_endpoints: Mutex<Vec<tls::TlsEndpoint>>,
    sid: AtomicU32,
    #[cfg(feature = "ssh")]
    runtime: tokio::runtime::Runtime,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Server> {
        crate::init();
        Ok(Server {
            config,
            binds: Mutex::new(Vec::new()),
            #[cfg(feature = "ssh")]
            ssh_endpoints: Mutex::new(Vec::new()),
            #[cfg(feature = "tls")]
            tls_endpoints: Mutex::new(Vec::new()),
            sid: AtomicU32::new(1),
            #[cfg(feature = "ssh")]
            runtime: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(Error::Transport)?,
        })
    }

    /// Process-unique, non-zero session identifiers.
    fn next_session_id(&self) -> u32 {
        loop {
            let id = self.sid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn server_capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new(vec![CAP_BASE_10.into(), CAP_BASE_11.into()]);
        for uri in &self.config.capabilities {
            caps.push(uri.clone());
        }
        caps
    }

    /// Register a listening endpoint under a unique name. The socket binds
    /// lazily on the first accept.
    pub fn add_endpoint(
        &self,
        name: &str,
        kind: TransportKind,
        address: &str,
        port: u16,
    ) -> Result<()> {
        if kind == TransportKind::Fd {
            return Err(Error::InvalidArgument("fd endpoints cannot listen".into()));
        }
        let mut binds = self.binds.lock();
        if binds.iter().any(|b| b.name == name) {
            return Err(Error::InvalidArgument(format!("endpoint {name} already exists")));
        }
        match kind {
            TransportKind::Ssh => {
                #[cfg(feature = "ssh")]
                self.ssh_endpoints.lock().push(ssh::SshEndpoint::new(name));
                #[cfg(not(feature = "ssh"))]
                return Err(Error::InvalidArgument("ssh support not built".into()));
            }
            TransportKind::Tls => {
                #[cfg(feature = "tls")]
                self.tls_endpoints.lock().push(tls::TlsEndpoint::new(name));
                #[cfg(not(feature = "tls"))]
                return Err(Error::InvalidArgument("tls support not built".into()));
            }
            TransportKind::Fd => unreachable!(),
        }
        binds.push(Bind {
            name: name.to_string(),
            kind,
            address: address.to_string(),
            port,
            listener: None,
        });
        Ok(())
    }

    /// Close the endpoint's socket and forget its configuration.
    pub fn del_endpoint(&self, name: &str) -> Result<()> {
        let mut binds = self.binds.lock();
        let pos = binds
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown endpoint {name}")))?;
        let bind = binds.remove(pos);
        match bind.kind {
            #[cfg(feature = "ssh")]
            TransportKind::Ssh => self.ssh_endpoints.lock().retain(|e| e.name != name),
            #[cfg(feature = "tls")]
            TransportKind::Tls => self.tls_endpoints.lock().retain(|e| e.name != name),
            _ => {}
        }
        Ok(())
    }

    pub fn set_endpoint_address(&self, name: &str, address: &str) -> Result<()> {
        self.with_bind(name, |bind| {
            if bind.address != address {
                bind.address = address.to_string();
                bind.listener = None;
            }
        })
    }

    /// Changing the port drops the socket; it rebinds on the next accept.
    pub fn set_endpoint_port(&self, name: &str, port: u16) -> Result<()> {
        self.with_bind(name, |bind| {
            if bind.port != port {
                bind.port = port;
                bind.listener = None;
            }
        })
    }

    fn with_bind(&self, name: &str, f: impl FnOnce(&mut Bind)) -> Result<()> {
        let mut binds = self.binds.lock();
        let bind = binds
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown endpoint {name}")))?;
        f(bind);
        Ok(())
    }

    #[cfg(feature = "ssh")]
    fn with_ssh_endpoint(
        &self,
        name: &str,
        f: impl FnOnce(&mut ssh::SshEndpoint),
    ) -> Result<()> {
        let mut endpoints = self.ssh_endpoints.lock();
        let endpoint = endpoints
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown ssh endpoint {name}")))?;
        f(endpoint);
        Ok(())
    }

    #[cfg(feature = "ssh")]
    pub fn add_ssh_hostkey(&self, endpoint: &str, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.with_ssh_endpoint(endpoint, |e| e.hostkeys.push(path))
    }

    #[cfg(feature = "ssh")]
    pub fn add_ssh_authorized_key(
        &self,
        endpoint: &str,
        path: impl Into<PathBuf>,
        username: impl Into<String>,
    ) -> Result<()> {
        let entry = ssh::AuthorizedKey { path: path.into(), username: username.into() };
        self.with_ssh_endpoint(endpoint, |e| e.authorized.push(entry))
    }

    #[cfg(feature = "ssh")]
    pub fn del_ssh_authorized_key(&self, endpoint: &str, path: &std::path::Path) -> Result<()> {
        self.with_ssh_endpoint(endpoint, |e| e.authorized.retain(|k| k.path != path))
    }

    #[cfg(feature = "ssh")]
    pub fn set_ssh_auth(&self, endpoint: &str, auth: ssh::SshServerAuth) -> Result<()> {
        self.with_ssh_endpoint(endpoint, |e| e.auth = auth)
    }

    #[cfg(feature = "tls")]
    fn with_tls_endpoint(
        &self,
        name: &str,
        f: impl FnOnce(&mut tls::TlsEndpoint),
    ) -> Result<()> {
        let mut endpoints = self.tls_endpoints.lock();
        let endpoint = endpoints
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown tls endpoint {name}")))?;
        f(endpoint);
        Ok(())
    }

    #[cfg(feature = "tls")]
    pub fn set_tls_identity(
        &self,
        endpoint: &str,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Result<()> {
        let (cert, key) = (cert.into(), key.into());
        self.with_tls_endpoint(endpoint, |e| {
            e.cert = Some(cert);
            e.key = Some(key);
        })
    }

    #[cfg(feature = "tls")]
    pub fn set_tls_trust(&self, endpoint: &str, ca: Option<PathBuf>) -> Result<()> {
        self.with_tls_endpoint(endpoint, |e| e.ca = ca)
    }

    #[cfg(feature = "tls")]
    pub fn set_tls_crl(&self, endpoint: &str, crl: Option<PathBuf>) -> Result<()> {
        self.with_tls_endpoint(endpoint, |e| e.crl = crl)
    }

    #[cfg(feature = "tls")]
    pub fn add_tls_ctn(&self, endpoint: &str, entry: tls::CtnEntry) -> Result<()> {
        self.with_tls_endpoint(endpoint, |e| e.add_ctn(entry))
    }

    #[cfg(feature = "tls")]
    pub fn del_tls_ctn(&self, endpoint: &str, id: u32) -> Result<()> {
        self.with_tls_endpoint(endpoint, |e| e.del_ctn(id))
    }

    /// Wait up to the timeout for an inbound connection on any endpoint,
    /// authenticate it and run the hello exchange. `Ok(None)` is the timeout
    /// outcome; an error applies to the one connection that failed, not to
    /// the server.
    pub fn accept(&self, timeout_ms: i32) -> Result<Option<Arc<Session>>> {
        let accepted = {
            let mut binds = self.binds.lock();
            if binds.is_empty() {
                return Err(Error::InvalidArgument("no listening endpoints".into()));
            }
            for bind in binds.iter_mut() {
                bind.ensure_bound()?;
            }
            let timeout = if timeout_ms < 0 {
                PollTimeout::NONE
            } else {
                PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
            };
            let ready = {
                use std::os::fd::AsFd;
                let mut fds: Vec<PollFd<'_>> = binds
                    .iter()
                    .filter_map(|b| b.listener.as_ref())
                    .map(|l| PollFd::new(l.as_fd(), PollFlags::POLLIN))
                    .collect();
                loop {
                    match poll(&mut fds, timeout) {
                        Ok(0) => break None,
                        Ok(_) => {
                            break fds.iter().position(|fd| {
                                fd.revents()
                                    .map(|r| r.contains(PollFlags::POLLIN))
                                    .unwrap_or(false)
                            })
                        }
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => return Err(Error::Transport(std::io::Error::from(e))),
                    }
                }
            };
            let Some(index) = ready else { return Ok(None) };
            let bind = &binds[index];
            let listener = bind.listener.as_ref().ok_or(Error::Busy)?;
            match listener.accept() {
                Ok((stream, peer)) => (stream, peer, bind.name.clone(), bind.kind),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(Error::Transport(e)),
            }
        };
        let (stream, peer, name, kind) = accepted;
        stream.set_nonblocking(false).map_err(Error::Transport)?;
        debug!("endpoint {name}: connection from {peer}");
        self.materialize(stream, peer, &name, kind).map(Some)
    }

    /// Transport handshake + authentication + hello for one inbound (or
    /// dialed-out Call-Home) connection.
    fn materialize(
        &self,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        name: &str,
        kind: TransportKind,
    ) -> Result<Arc<Session>> {
        let (transport, username): (Box<dyn Transport + Send>, String) = match kind {
            #[cfg(feature = "ssh")]
            TransportKind::Ssh => {
                let (hostkeys, authorized, auth) = {
                    let endpoints = self.ssh_endpoints.lock();
                    endpoints
                        .iter()
                        .find(|e| e.name == name)
                        .map(|e| e.snapshot())
                        .ok_or_else(|| {
                            Error::InvalidArgument(format!("unknown ssh endpoint {name}"))
                        })?
                };
                let (t, u) = ssh::accept_session(
                    self.runtime.handle(),
                    &hostkeys,
                    &authorized,
                    auth,
                    stream,
                )?;
                (Box::new(t), u)
            }
            #[cfg(feature = "tls")]
            TransportKind::Tls => {
                let (cert, key, ca, crl, ctn) = {
                    let endpoints = self.tls_endpoints.lock();
                    let e = endpoints.iter().find(|e| e.name == name).ok_or_else(|| {
                        Error::InvalidArgument(format!("unknown tls endpoint {name}"))
                    })?;
                    (e.cert.clone(), e.key.clone(), e.ca.clone(), e.crl.clone(), e.ctn.clone())
                };
                let (t, u) = tls::accept_session(
                    cert.as_ref(),
                    key.as_ref(),
                    ca.as_ref(),
                    crl.as_ref(),
                    &ctn,
                    stream,
                    self.config.hello_timeout_ms,
                )?;
                (Box::new(t), u)
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "transport {kind:?} cannot accept sessions"
                )))
            }
        };
        let mut session = Session::new(Role::Server, transport);
        session.set_peer(peer.ip().to_string(), peer.port());
        session.set_username(username);
        session.set_idle_timeout(self.config.idle_timeout_ms);
        let session = Arc::new(session);
        let sid = self.next_session_id();
        handshake::run_server(
            &session,
            self.server_capabilities(),
            sid,
            self.config.hello_timeout_ms,
        )?;
        info!(
            "session {sid} up: {} via {name} as {:?}",
            peer,
            session.username().unwrap_or("?")
        );
        Ok(session)
    }

    /// Accept a NETCONF session over a pair of raw descriptors (stdio
    /// subprocess setups, tests); no transport handshake or authentication is
    /// involved, the username comes from the environment that spawned us.
    pub fn accept_fd(
        &self,
        fd_in: std::os::fd::OwnedFd,
        fd_out: std::os::fd::OwnedFd,
        username: &str,
    ) -> Result<Arc<Session>> {
        let transport = crate::transport::fd::FdTransport::new(fd_in, fd_out);
        let mut session = Session::new(Role::Server, Box::new(transport));
        session.set_username(username);
        session.set_idle_timeout(self.config.idle_timeout_ms);
        let session = Arc::new(session);
        let sid = self.next_session_id();
        handshake::run_server(
            &session,
            self.server_capabilities(),
            sid,
            self.config.hello_timeout_ms,
        )?;
        Ok(session)
    }

    /// Call-Home: dial the client's advertised listener and run the transport
    /// handshake in the server role (default ports 4334/4335).
    pub fn connect_callhome(
        &self,
        endpoint: &str,
        host: &str,
        port: Option<u16>,
    ) -> Result<Arc<Session>> {
        let kind = self.endpoint_kind(endpoint)?;
        let port = port.unwrap_or(match kind {
            TransportKind::Ssh => PORT_CH_SSH,
            _ => PORT_CH_TLS,
        });
        let addrs: Vec<_> =
            (host, port).to_socket_addrs().map_err(Error::Transport)?.collect();
        let mut last: Option<std::io::Error> = None;
        for addr in addrs {
            let attempt = if self.config.hello_timeout_ms > 0 {
                TcpStream::connect_timeout(
                    &addr,
                    Duration::from_millis(self.config.hello_timeout_ms as u64),
                )
            } else {
                TcpStream::connect(addr)
            };
            match attempt {
                Ok(stream) => {
                    info!("call-home: dialed {addr} for endpoint {endpoint}");
                    return self.materialize(stream, addr, endpoint, kind);
                }
                Err(e) => {
                    warn!("call-home: {addr} unreachable: {e}");
                    last = Some(e);
                }
            }
        }
        Err(Error::Transport(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no usable address")
        })))
    }

    fn endpoint_kind(&self, name: &str) -> Result<TransportKind> {
        #[cfg(feature = "ssh")]
        if self.ssh_endpoints.lock().iter().any(|e| e.name == name) {
            return Ok(TransportKind::Ssh);
        }
        #[cfg(feature = "tls")]
        if self.tls_endpoints.lock().iter().any(|e| e.name == name) {
            return Ok(TransportKind::Tls);
        }
        Err(Error::InvalidArgument(format!("unknown endpoint {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_names_are_unique() {
        let server = Server::new(ServerConfig::default()).unwrap();
        server.add_endpoint("main", TransportKind::Ssh, "127.0.0.1", 0).unwrap();
        assert!(matches!(
            server.add_endpoint("main", TransportKind::Tls, "127.0.0.1", 0),
            Err(Error::InvalidArgument(_))
        ));
        server.del_endpoint("main").unwrap();
        server.add_endpoint("main", TransportKind::Tls, "127.0.0.1", 0).unwrap();
    }

    #[test]
    fn fd_endpoints_are_rejected() {
        let server = Server::new(ServerConfig::default()).unwrap();
        assert!(matches!(
            server.add_endpoint("x", TransportKind::Fd, "127.0.0.1", 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn session_ids_are_unique_and_nonzero() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = server.next_session_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn server_hello_advertises_both_bases() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let caps = server.server_capabilities();
        assert!(caps.has_base_10());
        assert!(caps.has_base_11());
        assert!(caps.contains(CAP_WRITABLE_RUNNING));
    }

    #[test]
    fn port_change_drops_the_socket() {
        let server = Server::new(ServerConfig::default()).unwrap();
        server.add_endpoint("e", TransportKind::Tls, "127.0.0.1", 0).unwrap();
        {
            let mut binds = server.binds.lock();
            binds[0].ensure_bound().unwrap();
            assert!(binds[0].listener.is_some());
        }
        server.set_endpoint_port("e", 1).unwrap();
        assert!(server.binds.lock()[0].listener.is_none());
    }
}
