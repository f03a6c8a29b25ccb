//! Client-side connectors: outbound SSH, TLS and file-descriptor sessions,
//! plus the reverse (Call-Home) listener.
//!
//! All connection options are explicit configuration values passed at connect
//! time; the default builders below replace process-wide option singletons.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::handshake;
use crate::schema::SchemaContext;
use crate::session::{Role, Session};
use crate::transport::fd::FdTransport;
#[cfg(feature = "ssh")]
use crate::transport::ssh::{ssh_err, SshChannelTransport, SshConnection};
#[cfg(feature = "tls")]
use crate::transport::tls::TlsTransport;
#[cfg(any(feature = "ssh", feature = "tls"))]
use crate::transport::{wait_readable, TransportKind};
#[cfg(feature = "ssh")]
use crate::PORT_SSH;
#[cfg(any(feature = "ssh", feature = "tls"))]
use crate::{PORT_CH_SSH, PORT_CH_TLS};
#[cfg(feature = "tls")]
use crate::PORT_TLS;

/// Answers interactive credential prompts. The default talks to the
/// controlling terminal; tests substitute a scripted implementation.
pub trait CredentialPrompter: Send + Sync {
    fn password(&self, prompt: &str) -> Option<String>;

    fn answer(&self, instruction: &str, prompt: &str, echo: bool) -> Option<String>;
}

/// Prompter reading answers from the controlling terminal.
pub struct TerminalPrompter;

impl CredentialPrompter for TerminalPrompter {
    fn password(&self, prompt: &str) -> Option<String> {
        self.answer("", prompt, false)
    }

    fn answer(&self, instruction: &str, prompt: &str, _echo: bool) -> Option<String> {
        use std::io::{BufRead, Write};
        if !instruction.is_empty() {
            eprintln!("{instruction}");
        }
        eprint!("{prompt}");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok()?;
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Supplies DNS SSHFP fingerprints (DNSSEC-validated) for host-key checking.
/// Resolution itself lives outside this crate.
pub trait SshfpResolver: Send + Sync {
    /// SHA-256 digests of the host's published keys; empty when nothing
    /// validated.
    fn fingerprints(&self, host: &str) -> Vec<Vec<u8>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SshAuthMethod {
    Interactive,
    Password,
    PublicKey,
}

/// A client key pair; the public half is optional when it can be derived.
#[derive(Clone, Debug)]
pub struct SshKeyPair {
    pub pubkey: Option<PathBuf>,
    pub privkey: PathBuf,
    pub passphrase: Option<String>,
}

/// Options for client-role SSH connections.
#[derive(Clone)]
pub struct SshClientConfig {
    pub username: String,
    /// `(method, preference)` pairs; negative preference disables a method.
    pub auth_prefs: Vec<(SshAuthMethod, i16)>,
    pub keys: Vec<SshKeyPair>,
    pub password: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub sshfp: Option<Arc<dyn SshfpResolver>>,
    pub prompter: Option<Arc<dyn CredentialPrompter>>,
    pub timeout_ms: i32,
}

impl SshClientConfig {
    /// Defaults for forward connections: interactive over password over
    /// public key.
    pub fn new(username: impl Into<String>) -> SshClientConfig {
        SshClientConfig {
            username: username.into(),
            auth_prefs: vec![
                (SshAuthMethod::Interactive, 3),
                (SshAuthMethod::Password, 2),
                (SshAuthMethod::PublicKey, 1),
            ],
            keys: Vec::new(),
            password: None,
            known_hosts: None,
            sshfp: None,
            prompter: None,
            timeout_ms: 10_000,
        }
    }

    /// Defaults for Call-Home connections, which rank public key first.
    pub fn new_callhome(username: impl Into<String>) -> SshClientConfig {
        let mut cfg = SshClientConfig::new(username);
        cfg.auth_prefs = vec![
            (SshAuthMethod::PublicKey, 3),
            (SshAuthMethod::Password, 2),
            (SshAuthMethod::Interactive, 1),
        ];
        cfg
    }
}

/// Options for client-role TLS connections.
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Trust anchors; the system store when absent.
    pub ca: Option<PathBuf>,
    pub timeout_ms: i32,
}

impl TlsClientConfig {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> TlsClientConfig {
        TlsClientConfig { cert: cert.into(), key: key.into(), ca: None, timeout_ms: 10_000 }
    }
}

fn tcp_connect(host: &str, port: u16, timeout_ms: i32) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(Error::Transport)?
        .collect();
    if addrs.is_empty() {
        return Err(Error::InvalidArgument(format!("{host}: no usable address")));
    }
    let mut last = None;
    for addr in addrs {
        let attempt = if timeout_ms < 0 {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms as u64))
        };
        match attempt {
            Ok(stream) => {
                debug!("connected to {addr}");
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(Error::Transport(last.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "connect failed")
    })))
}

/// Connect and authenticate a NETCONF-over-SSH session (default port 830).
#[cfg(feature = "ssh")]
pub fn connect_ssh(
    host: &str,
    port: Option<u16>,
    config: &SshClientConfig,
    schema: Option<Arc<dyn SchemaContext>>,
) -> Result<Arc<Session>> {
    crate::init();
    let port = port.unwrap_or(PORT_SSH);
    let stream = tcp_connect(host, port, config.timeout_ms)?;
    let conn = ssh_client_handshake(stream, host, port, config)?;
    session_over_ssh(conn, schema, config.timeout_ms)
}

/// Open an additional NETCONF session over the SSH connection already under
/// `existing`, on a new channel sharing the transport lock.
#[cfg(feature = "ssh")]
pub fn connect_ssh_channel(
    existing: &Arc<Session>,
    schema: Option<Arc<dyn SchemaContext>>,
    timeout_ms: i32,
) -> Result<Arc<Session>> {
    let conn = existing
        .ssh_conn()
        .cloned()
        .ok_or_else(|| Error::InvalidArgument("session is not an SSH client session".into()))?;
    session_over_ssh(conn, schema, timeout_ms)
}

#[cfg(feature = "ssh")]
fn session_over_ssh(
    conn: Arc<SshConnection>,
    schema: Option<Arc<dyn SchemaContext>>,
    timeout_ms: i32,
) -> Result<Arc<Session>> {
    let channel = conn.open_netconf_channel()?;
    let transport = SshChannelTransport::new(Arc::clone(&conn), channel);
    let mut session = Session::new(Role::Client, Box::new(transport));
    session.set_peer(conn.host(), conn.port());
    session.set_username(conn.username());
    session.set_schema(schema);
    session.set_ssh_conn(conn);
    let session = Arc::new(session);
    handshake::run_client(&session, timeout_ms)?;
    info!("ssh session {} up with {:?}", session.session_id(), session.host());
    Ok(session)
}

/// SSH transport handshake in the client role: key exchange, host-key
/// verification against known-hosts (with optional SSHFP rescue), then
/// authentication ranked by the caller's preferences.
#[cfg(feature = "ssh")]
fn ssh_client_handshake(
    stream: TcpStream,
    host: &str,
    port: u16,
    config: &SshClientConfig,
) -> Result<Arc<SshConnection>> {
    let mut sess = ssh2::Session::new().map_err(|e| ssh_err("session init", e))?;
    if config.timeout_ms > 0 {
        sess.set_timeout(config.timeout_ms as u32);
    }
    let fd_stream = stream.try_clone().map_err(Error::Transport)?;
    sess.set_tcp_stream(stream);
    sess.handshake().map_err(|e| ssh_err("ssh handshake", e))?;
    check_host_key(&sess, host, port, config)?;
    authenticate_ssh(&sess, host, config)?;
    Ok(Arc::new(SshConnection::new(sess, fd_stream, host, port, &config.username)))
}

#[cfg(feature = "ssh")]
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

#[cfg(feature = "ssh")]
fn check_host_key(
    sess: &ssh2::Session,
    host: &str,
    port: u16,
    config: &SshClientConfig,
) -> Result<()> {
    use ssh2::CheckResult;

    let Some(kh_path) = &config.known_hosts else {
        // no known-hosts store configured: the caller opted out of checking
        return Ok(());
    };
    let (key, key_type) =
        sess.host_key().ok_or_else(|| Error::AuthenticationFailed("no host key".into()))?;
    let mut kh = sess.known_hosts().map_err(|e| ssh_err("known hosts", e))?;
    if kh_path.exists() {
        kh.read_file(kh_path, ssh2::KnownHostFileKind::OpenSSH)
            .map_err(|e| ssh_err("known hosts read", e))?;
    }
    match kh.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => {
            Err(Error::AuthenticationFailed(format!("host key mismatch for {host}")))
        }
        CheckResult::NotFound | CheckResult::Failure => {
            if let Some(resolver) = &config.sshfp {
                let digest = sess.host_key_hash(ssh2::HashType::Sha256).unwrap_or(&[]);
                if !digest.is_empty()
                    && resolver.fingerprints(host).iter().any(|fp| fp == digest)
                {
                    info!("host key for {host} verified via SSHFP, recording it");
                    kh.add(&known_hosts_name(host, port), key, "netconf-proto", key_type.into())
                        .map_err(|e| ssh_err("known hosts add", e))?;
                    kh.write_file(kh_path, ssh2::KnownHostFileKind::OpenSSH)
                        .map_err(|e| ssh_err("known hosts write", e))?;
                    return Ok(());
                }
            }
            Err(Error::AuthenticationFailed(format!("unknown host key for {host}")))
        }
    }
}

#[cfg(feature = "ssh")]
struct PrompterAdapter<'a> {
    prompter: &'a dyn CredentialPrompter,
}

#[cfg(feature = "ssh")]
impl ssh2::KeyboardInteractivePrompt for PrompterAdapter<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        instructions: &str,
        prompts: &[ssh2::Prompt<'b>],
    ) -> Vec<String> {
        prompts
            .iter()
            .map(|p| {
                self.prompter
                    .answer(instructions, &p.text, p.echo)
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[cfg(feature = "ssh")]
fn authenticate_ssh(sess: &ssh2::Session, host: &str, config: &SshClientConfig) -> Result<()> {
    let mut ranked: Vec<(SshAuthMethod, i16)> = config
        .auth_prefs
        .iter()
        .copied()
        .filter(|(_, pref)| *pref >= 0)
        .collect();
    ranked.sort_by_key(|(_, pref)| std::cmp::Reverse(*pref));
    if ranked.is_empty() {
        return Err(Error::AuthenticationFailed("all authentication methods disabled".into()));
    }

    let user = config.username.as_str();
    for (method, _) in ranked {
        let attempt = match method {
            SshAuthMethod::PublicKey => {
                let mut result =
                    Err(Error::AuthenticationFailed("no usable key pair".into()));
                for key in &config.keys {
                    match sess.userauth_pubkey_file(
                        user,
                        key.pubkey.as_deref(),
                        &key.privkey,
                        key.passphrase.as_deref(),
                    ) {
                        Ok(()) => {
                            result = Ok(());
                            break;
                        }
                        Err(e) => {
                            debug!("public key {:?} rejected: {e}", key.privkey);
                            result = Err(ssh_err("publickey auth", e));
                        }
                    }
                }
                result
            }
            SshAuthMethod::Password => {
                let password = match (&config.password, &config.prompter) {
                    (Some(p), _) => Some(p.clone()),
                    (None, Some(prompter)) => {
                        prompter.password(&format!("{user}@{host} password: "))
                    }
                    (None, None) => None,
                };
                match password {
                    Some(p) => sess
                        .userauth_password(user, &p)
                        .map_err(|e| ssh_err("password auth", e)),
                    None => Err(Error::AuthenticationFailed("no password available".into())),
                }
            }
            SshAuthMethod::Interactive => match &config.prompter {
                Some(prompter) => {
                    let mut adapter = PrompterAdapter { prompter: prompter.as_ref() };
                    sess.userauth_keyboard_interactive(user, &mut adapter)
                        .map_err(|e| ssh_err("keyboard-interactive auth", e))
                }
                None => Err(Error::AuthenticationFailed("no prompter available".into())),
            },
        };
        match attempt {
            Ok(()) if sess.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("auth method {method:?} failed: {e}"),
        }
    }
    Err(Error::AuthenticationFailed(format!("all methods exhausted for {user}@{host}")))
}

/// TLS client handshake helper shared by forward and Call-Home connects.
#[cfg(feature = "tls")]
fn tls_client_handshake(
    stream: TcpStream,
    host: &str,
    config: &TlsClientConfig,
) -> Result<TlsTransport> {
    use openssl::ssl::{SslConnector, SslFiletype, SslMethod};

    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| Error::other("tls init", e))?;
    builder
        .set_certificate_chain_file(&config.cert)
        .map_err(|e| Error::other("client certificate", e))?;
    builder
        .set_private_key_file(&config.key, SslFiletype::PEM)
        .map_err(|e| Error::other("client key", e))?;
    if let Some(ca) = &config.ca {
        builder.set_ca_file(ca).map_err(|e| Error::other("trust anchors", e))?;
    }
    let connector = builder.build();
    if config.timeout_ms > 0 {
        let t = Some(Duration::from_millis(config.timeout_ms as u64));
        stream.set_read_timeout(t).map_err(Error::Transport)?;
        stream.set_write_timeout(t).map_err(Error::Transport)?;
    }
    let tls = connector
        .connect(host, stream)
        .map_err(|e| Error::AuthenticationFailed(format!("tls handshake with {host}: {e}")))?;
    TlsTransport::new(tls)
}

/// Connect a NETCONF-over-TLS session (default port 6513).
#[cfg(feature = "tls")]
pub fn connect_tls(
    host: &str,
    port: Option<u16>,
    config: &TlsClientConfig,
    schema: Option<Arc<dyn SchemaContext>>,
) -> Result<Arc<Session>> {
    crate::init();
    let port = port.unwrap_or(PORT_TLS);
    let stream = tcp_connect(host, port, config.timeout_ms)?;
    let transport = tls_client_handshake(stream, host, config)?;
    let mut session = Session::new(Role::Client, Box::new(transport));
    session.set_peer(host, port);
    session.set_schema(schema);
    let session = Arc::new(session);
    handshake::run_client(&session, config.timeout_ms)?;
    info!("tls session {} up with {host}", session.session_id());
    Ok(session)
}

/// Run a NETCONF session over a pair of raw descriptors; no transport
/// handshake is involved.
pub fn connect_fd(
    fd_in: OwnedFd,
    fd_out: OwnedFd,
    schema: Option<Arc<dyn SchemaContext>>,
    timeout_ms: i32,
) -> Result<Arc<Session>> {
    crate::init();
    let transport = FdTransport::new(fd_in, fd_out);
    let mut session = Session::new(Role::Client, Box::new(transport));
    session.set_schema(schema);
    let session = Arc::new(session);
    handshake::run_client(&session, timeout_ms)?;
    Ok(session)
}

/// Per-transport credentials of a Call-Home listener.
#[cfg(any(feature = "ssh", feature = "tls"))]
#[derive(Clone)]
pub enum CallHomeCredentials {
    #[cfg(feature = "ssh")]
    Ssh(SshClientConfig),
    #[cfg(feature = "tls")]
    Tls(TlsClientConfig),
}

#[cfg(any(feature = "ssh", feature = "tls"))]
impl CallHomeCredentials {
    fn kind(&self) -> TransportKind {
        match self {
            #[cfg(feature = "ssh")]
            CallHomeCredentials::Ssh(_) => TransportKind::Ssh,
            #[cfg(feature = "tls")]
            CallHomeCredentials::Tls(_) => TransportKind::Tls,
        }
    }

    fn timeout_ms(&self) -> i32 {
        match self {
            #[cfg(feature = "ssh")]
            CallHomeCredentials::Ssh(c) => c.timeout_ms,
            #[cfg(feature = "tls")]
            CallHomeCredentials::Tls(c) => c.timeout_ms,
        }
    }
}

/// Reverse-connection listener: a NETCONF client waiting for servers to dial
/// in (RFC 8071). The accepted session runs in the NETCONF client role.
#[cfg(any(feature = "ssh", feature = "tls"))]
pub struct CallHomeListener {
    listener: TcpListener,
    credentials: CallHomeCredentials,
    schema: Option<Arc<dyn SchemaContext>>,
}

#[cfg(any(feature = "ssh", feature = "tls"))]
impl CallHomeListener {
    /// Bind on `address:port`; the default port is 4334 for SSH and 4335 for
    /// TLS.
    pub fn bind(
        address: &str,
        port: Option<u16>,
        credentials: CallHomeCredentials,
        schema: Option<Arc<dyn SchemaContext>>,
    ) -> Result<CallHomeListener> {
        crate::init();
        let port = port.unwrap_or(match credentials.kind() {
            TransportKind::Ssh => PORT_CH_SSH,
            TransportKind::Tls => PORT_CH_TLS,
            TransportKind::Fd => {
                return Err(Error::InvalidArgument("fd transport cannot call home".into()))
            }
        });
        let listener = TcpListener::bind((address, port)).map_err(Error::Transport)?;
        listener.set_nonblocking(true).map_err(Error::Transport)?;
        info!("call-home listener on {address}:{port}");
        Ok(CallHomeListener { listener, credentials, schema })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr().map_err(Error::Transport)?.port())
    }

    /// Wait up to the timeout for a server to dial in, then run the transport
    /// handshake in the client role and the NETCONF hello.
    pub fn accept(&self, timeout_ms: i32) -> Result<Option<Arc<Session>>> {
        use std::os::fd::AsFd as _;
        if !wait_readable(self.listener.as_fd(), timeout_ms)? {
            return Ok(None);
        }
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::Transport(e)),
        };
        stream.set_nonblocking(false).map_err(Error::Transport)?;
        info!("call-home connection from {peer}");
        let host = peer.ip().to_string();
        let timeout_ms = self.credentials.timeout_ms();
        match &self.credentials {
            #[cfg(feature = "ssh")]
            CallHomeCredentials::Ssh(cfg) => {
                let conn = ssh_client_handshake(stream, &host, peer.port(), cfg)?;
                session_over_ssh(conn, self.schema.clone(), timeout_ms).map(Some)
            }
            #[cfg(feature = "tls")]
            CallHomeCredentials::Tls(cfg) => {
                let transport = tls_client_handshake(stream, &host, cfg)?;
                let mut session = Session::new(Role::Client, Box::new(transport));
                session.set_peer(&host, peer.port());
                session.set_schema(self.schema.clone());
                let session = Arc::new(session);
                handshake::run_client(&session, timeout_ms)?;
                Ok(Some(session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_callhome_rank_methods_differently() {
        let fwd = SshClientConfig::new("admin");
        assert_eq!(fwd.auth_prefs[0].0, SshAuthMethod::Interactive);
        let ch = SshClientConfig::new_callhome("admin");
        assert_eq!(ch.auth_prefs[0].0, SshAuthMethod::PublicKey);
    }

    #[test]
    fn known_hosts_entry_name_carries_nonstandard_port() {
        #[cfg(feature = "ssh")]
        {
            assert_eq!(known_hosts_name("router", 22), "router");
            assert_eq!(known_hosts_name("router", 830), "[router]:830");
        }
    }

    #[test]
    fn tcp_connect_rejects_unresolvable_host() {
        assert!(tcp_connect("", 830, 100).is_err());
    }
}
