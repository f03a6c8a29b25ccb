//! Server-side SSH endpoints: host keys, authorized keys and the
//! authentication handler driving russh for one inbound connection.

use std::borrow::Cow;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};

use crate::error::{Error, Result};
use crate::transport::ssh_server::{channel_pipe, ChannelSink, SshServerTransport};

/// Validates password and keyboard-interactive credentials for a server
/// endpoint; injected by the embedding application.
pub trait PasswordAuthenticator: Send + Sync {
    fn check(&self, username: &str, password: &str) -> bool;
}

/// A public key authorized on an endpoint and the NETCONF username it maps
/// to.
#[derive(Clone, Debug)]
pub struct AuthorizedKey {
    pub path: PathBuf,
    pub username: String,
}

/// Authentication policy of an SSH endpoint: which methods run, how many
/// attempts each gets, and the overall authentication deadline.
#[derive(Clone)]
pub struct SshServerAuth {
    /// Attempt cap per method; `None` disables the method.
    pub publickey_attempts: Option<u16>,
    pub password_attempts: Option<u16>,
    pub interactive_attempts: Option<u16>,
    pub timeout_ms: i32,
    pub password_check: Option<Arc<dyn PasswordAuthenticator>>,
}

impl Default for SshServerAuth {
    fn default() -> SshServerAuth {
        SshServerAuth {
            publickey_attempts: Some(3),
            password_attempts: Some(3),
            interactive_attempts: None,
            timeout_ms: 10_000,
            password_check: None,
        }
    }
}

/// One named SSH listening endpoint.
pub(crate) struct SshEndpoint {
    pub(crate) name: String,
    pub(crate) hostkeys: Vec<PathBuf>,
    pub(crate) authorized: Vec<AuthorizedKey>,
    pub(crate) auth: SshServerAuth,
}

impl SshEndpoint {
    pub(crate) fn new(name: impl Into<String>) -> SshEndpoint {
        SshEndpoint {
            name: name.into(),
            hostkeys: Vec::new(),
            authorized: Vec::new(),
            auth: SshServerAuth::default(),
        }
    }

    /// Materialized credentials, loaded outside the configuration lock.
    pub(crate) fn snapshot(&self) -> (Vec<PathBuf>, Vec<AuthorizedKey>, SshServerAuth) {
        (self.hostkeys.clone(), self.authorized.clone(), self.auth.clone())
    }
}

fn key_err(what: &str, e: russh::keys::Error) -> Error {
    Error::AuthenticationFailed(format!("{what}: {e}"))
}

enum AcceptEvent {
    Ready { username: String, channel: ChannelId },
}

struct AcceptHandler {
    authorized: Arc<Vec<(PublicKey, String)>>,
    auth: SshServerAuth,
    sink: ChannelSink,
    event_tx: Sender<AcceptEvent>,
    username: Option<String>,
    netconf_channel: Option<ChannelId>,
    publickey_tries: u16,
    password_tries: u16,
    interactive_tries: u16,
}

impl AcceptHandler {
    fn reject(&self) -> Auth {
        Auth::Reject { proceed_with_methods: None, partial_success: false }
    }

    /// Bump the method's attempt counter; past the cap the transport goes
    /// down.
    fn strike(count: &mut u16, limit: u16) -> std::result::Result<(), russh::Error> {
        *count += 1;
        if *count > limit {
            warn!("ssh auth attempt cap reached, disconnecting");
            Err(russh::Error::Disconnect)
        } else {
            Ok(())
        }
    }

    fn check_password(&self, user: &str, password: &str) -> bool {
        match &self.auth.password_check {
            Some(check) => check.check(user, password),
            None => false,
        }
    }
}

impl russh::server::Handler for AcceptHandler {
    type Error = russh::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let known = self
            .authorized
            .iter()
            .any(|(k, name)| k.key_data() == key.key_data() && name == user);
        Ok(if known { Auth::Accept } else { self.reject() })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let Some(limit) = self.auth.publickey_attempts else {
            return Ok(self.reject());
        };
        Self::strike(&mut self.publickey_tries, limit)?;
        let matched = self
            .authorized
            .iter()
            .any(|(k, name)| k.key_data() == key.key_data() && name == user);
        if matched {
            debug!("ssh publickey auth ok for {user}");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(self.reject())
        }
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        let Some(limit) = self.auth.password_attempts else {
            return Ok(self.reject());
        };
        Self::strike(&mut self.password_tries, limit)?;
        if self.check_password(user, password) {
            debug!("ssh password auth ok for {user}");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(self.reject())
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> std::result::Result<Auth, Self::Error> {
        let Some(limit) = self.auth.interactive_attempts else {
            return Ok(self.reject());
        };
        let Some(mut response) = response else {
            // first round: issue a single password prompt
            return Ok(Auth::Partial {
                name: Cow::Borrowed(""),
                instructions: Cow::Borrowed(""),
                prompts: Cow::Owned(vec![(Cow::Borrowed("Password: "), false)]),
            });
        };
        Self::strike(&mut self.interactive_tries, limit)?;
        let answer = response
            .next()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        if self.check_password(user, &answer) {
            debug!("ssh keyboard-interactive auth ok for {user}");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(self.reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        if self.netconf_channel.is_some() {
            return Ok(false);
        }
        self.netconf_channel = Some(channel.id());
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name == "netconf" && self.netconf_channel == Some(channel) {
            session.channel_success(channel)?;
            if let Some(username) = self.username.clone() {
                let _ = self.event_tx.send(AcceptEvent::Ready { username, channel });
            }
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.netconf_channel == Some(channel) {
            self.sink.push(data);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.netconf_channel == Some(channel) {
            self.sink.set_eof();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.netconf_channel == Some(channel) {
            self.sink.set_eof();
        }
        Ok(())
    }
}

fn method_set(auth: &SshServerAuth) -> MethodSet {
    let mut methods = MethodSet::empty();
    if auth.publickey_attempts.is_some() {
        methods.push(MethodKind::PublicKey);
    }
    if auth.password_attempts.is_some() {
        methods.push(MethodKind::Password);
    }
    if auth.interactive_attempts.is_some() {
        methods.push(MethodKind::KeyboardInteractive);
    }
    methods
}

/// Establish SSH transport in the server role on an accepted socket: key
/// exchange, user authentication and the `netconf` subsystem, surfaced as a
/// blocking transport plus the authenticated username.
pub(crate) fn accept_session(
    rt: &tokio::runtime::Handle,
    hostkeys: &[PathBuf],
    authorized: &[AuthorizedKey],
    auth: SshServerAuth,
    stream: TcpStream,
) -> Result<(SshServerTransport, String)> {
    if hostkeys.is_empty() {
        return Err(Error::InvalidArgument("endpoint has no host key".into()));
    }
    let mut keys = Vec::with_capacity(hostkeys.len());
    for path in hostkeys {
        keys.push(
            russh::keys::load_secret_key(path, None).map_err(|e| key_err("host key", e))?,
        );
    }
    let mut authorized_keys = Vec::with_capacity(authorized.len());
    for entry in authorized {
        let key = russh::keys::load_public_key(&entry.path)
            .map_err(|e| key_err("authorized key", e))?;
        authorized_keys.push((key, entry.username.clone()));
    }

    let timeout_ms = auth.timeout_ms;
    let config = Arc::new(russh::server::Config {
        methods: method_set(&auth),
        keys,
        auth_rejection_time: Duration::from_millis(0),
        ..Default::default()
    });

    let (sink, source) = channel_pipe()?;
    let (event_tx, event_rx): (Sender<AcceptEvent>, Receiver<AcceptEvent>) =
        std::sync::mpsc::channel();
    let handler = AcceptHandler {
        authorized: Arc::new(authorized_keys),
        auth,
        sink,
        event_tx,
        username: None,
        netconf_channel: None,
        publickey_tries: 0,
        password_tries: 0,
        interactive_tries: 0,
    };

    stream.set_nonblocking(true).map_err(Error::Transport)?;
    let handle: Handle = rt.block_on(async {
        let stream = tokio::net::TcpStream::from_std(stream).map_err(Error::Transport)?;
        let running = russh::server::run_stream(config, stream, handler)
            .await
            .map_err(|e| Error::AuthenticationFailed(format!("ssh handshake: {e}")))?;
        let handle = running.handle();
        tokio::spawn(running);
        Ok::<Handle, Error>(handle)
    })?;

    let wait = if timeout_ms < 0 { Duration::from_secs(3600) } else {
        Duration::from_millis(timeout_ms as u64)
    };
    match event_rx.recv_timeout(wait) {
        Ok(AcceptEvent::Ready { username, channel }) => {
            let transport = SshServerTransport::new(rt.clone(), handle, channel, source);
            Ok((transport, username))
        }
        Err(_) => {
            warn!("ssh authentication did not complete in time");
            let _ = rt.block_on(handle.disconnect(
                russh::Disconnect::ByApplication,
                "authentication timeout".into(),
                "en".into(),
            ));
            Err(Error::AuthenticationFailed("authentication did not complete".into()))
        }
    }
}
