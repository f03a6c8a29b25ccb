//! SSH transport (client role) over ssh2.
//!
//! A [`SshConnection`] is one authenticated SSH connection. Several NETCONF
//! sessions may run over it, one SSH channel each; they share the connection's
//! transport lock, and the connection disconnects when the last session
//! releases its `Arc` handle.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use ssh2::Channel;

use crate::error::{Error, Result};
use crate::transport::{fd_alive, wait_readable, Deadline, Transport, TransportKind, READ_SLEEP};

pub(crate) fn ssh_err(what: &str, e: ssh2::Error) -> Error {
    Error::other(what, e)
}

/// One authenticated SSH connection shared by sibling NETCONF sessions.
pub struct SshConnection {
    /// libssh2 connections are single-threaded; this mutex is the transport
    /// lock shared by every channel on the connection.
    sess: Mutex<ssh2::Session>,
    stream: TcpStream,
    host: String,
    port: u16,
    username: String,
}

impl SshConnection {
    pub(crate) fn new(
        sess: ssh2::Session,
        stream: TcpStream,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
    ) -> SshConnection {
        SshConnection {
            sess: Mutex::new(sess),
            stream,
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    /// Open a new channel with the `netconf` subsystem, for the first session
    /// or an additional multiplexed one.
    pub(crate) fn open_netconf_channel(&self) -> Result<Channel> {
        let sess = self.sess.lock();
        sess.set_blocking(true);
        let mut channel = sess.channel_session().map_err(|e| ssh_err("channel open", e))?;
        channel.subsystem("netconf").map_err(|e| ssh_err("netconf subsystem", e))?;
        debug!("ssh {}:{}: netconf channel open", self.host, self.port);
        Ok(channel)
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        // last sibling released: one disconnect for the whole connection
        let _ = self.sess.get_mut().disconnect(None, "session closed", None);
    }
}

/// NETCONF over one channel of a shared SSH connection.
pub struct SshChannelTransport {
    conn: Arc<SshConnection>,
    channel: Channel,
    closed: bool,
}

impl SshChannelTransport {
    pub(crate) fn new(conn: Arc<SshConnection>, channel: Channel) -> SshChannelTransport {
        SshChannelTransport { conn, channel, closed: false }
    }
}

impl Transport for SshChannelTransport {
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let deadline = Deadline::new(timeout_ms);
        loop {
            {
                let sess = self.conn.sess.lock();
                sess.set_blocking(false);
                match self.channel.read(buf) {
                    Ok(0) => return Err(Error::TransportEof),
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if self.channel.eof() {
                            return Err(Error::TransportEof);
                        }
                    }
                    Err(e) => return Err(Error::Transport(e)),
                }
            }
            let remaining = deadline.remaining_ms();
            if remaining == 0 {
                return Err(Error::Timeout);
            }
            // the socket may be carrying a sibling channel's data, so wait in
            // slices and retry the channel rather than trusting one poll
            let slice = if remaining < 0 { 100 } else { remaining.min(100) };
            wait_readable(self.conn.stream.as_fd(), slice)?;
            std::thread::sleep(READ_SLEEP);
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let sess = self.conn.sess.lock();
        sess.set_blocking(true);
        self.channel.write_all(buf).map_err(Error::Transport)?;
        self.channel.flush().map_err(Error::Transport)?;
        Ok(())
    }

    fn alive(&self) -> bool {
        if self.closed {
            return false;
        }
        if let Some(_sess) = self.conn.sess.try_lock() {
            if self.channel.eof() {
                return false;
            }
        }
        fd_alive(self.conn.stream.as_fd())
    }

    fn buffered(&self) -> bool {
        match self.conn.sess.try_lock() {
            Some(_sess) => self.channel.read_window().available > 0,
            None => false,
        }
    }

    fn read_fd(&self) -> Option<RawFd> {
        Some(self.conn.stream.as_raw_fd())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let sess = self.conn.sess.lock();
        sess.set_blocking(true);
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }
}
