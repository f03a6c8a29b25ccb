//! TLS transport over an openssl `SslStream`.
//!
//! The TCP socket is switched to non-blocking after the TLS handshake;
//! would-block is told apart from fatal failures by the TLS error code and
//! turned into a poll on the underlying descriptor.

use std::io;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use openssl::ssl::{ErrorCode, SslStream};
use openssl::x509::X509;

use crate::error::{Error, Result};
use crate::transport::{fd_alive, wait_readable, wait_writable, Deadline, Transport, TransportKind};

fn tls_io_err(e: openssl::ssl::Error) -> Error {
    match e.into_io_error() {
        Ok(io_err) => Error::Transport(io_err),
        Err(e) => Error::Transport(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

/// NETCONF over TLS.
pub struct TlsTransport {
    stream: SslStream<TcpStream>,
    closed: bool,
}

impl TlsTransport {
    /// Wrap a freshly handshaken stream; the socket goes non-blocking here.
    pub(crate) fn new(stream: SslStream<TcpStream>) -> Result<TlsTransport> {
        stream.get_ref().set_nonblocking(true).map_err(Error::Transport)?;
        Ok(TlsTransport { stream, closed: false })
    }

    /// The peer certificate presented during the handshake.
    pub(crate) fn peer_certificate(&self) -> Option<X509> {
        self.stream.ssl().peer_certificate()
    }
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let deadline = Deadline::new(timeout_ms);
        loop {
            match self.stream.ssl_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => {
                        let remaining = deadline.remaining_ms();
                        if remaining == 0 {
                            return Err(Error::Timeout);
                        }
                        wait_readable(self.stream.get_ref().as_fd(), remaining)?;
                    }
                    ErrorCode::WANT_WRITE => {
                        wait_writable(self.stream.get_ref().as_fd(), deadline.remaining_ms())?;
                    }
                    ErrorCode::ZERO_RETURN => return Err(Error::TransportEof),
                    _ => return Err(tls_io_err(e)),
                },
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let mut written = 0;
        while written < buf.len() {
            match self.stream.ssl_write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) => match e.code() {
                    ErrorCode::WANT_WRITE => {
                        wait_writable(self.stream.get_ref().as_fd(), -1)?;
                    }
                    ErrorCode::WANT_READ => {
                        wait_readable(self.stream.get_ref().as_fd(), -1)?;
                    }
                    ErrorCode::ZERO_RETURN => return Err(Error::TransportEof),
                    _ => return Err(tls_io_err(e)),
                },
            }
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        !self.closed && fd_alive(self.stream.get_ref().as_fd())
    }

    fn buffered(&self) -> bool {
        self.stream.ssl().pending() > 0
    }

    fn read_fd(&self) -> Option<RawFd> {
        Some(self.stream.get_ref().as_raw_fd())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // best-effort close_notify; the socket is non-blocking
        let _ = self.stream.shutdown();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }
}
