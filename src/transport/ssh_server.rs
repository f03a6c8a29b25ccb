//! SSH transport (server role): a blocking facade over a russh channel.
//!
//! The async side lives on the server's tokio runtime. The connection handler
//! forwards inbound channel data into an in-process queue and nudges a signal
//! pipe (one byte per queued chunk) so the poll engine has a real descriptor
//! to wait on; writes go back through the russh session handle under
//! `block_on`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use russh::server::Handle;
use russh::ChannelId;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportKind};

fn nonblocking_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(Error::Transport(io::Error::last_os_error()));
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Async half: owned by the connection handler.
pub(crate) struct ChannelSink {
    tx: Sender<Vec<u8>>,
    signal_wr: OwnedFd,
    eof: Arc<AtomicBool>,
}

impl ChannelSink {
    pub(crate) fn push(&self, data: &[u8]) {
        if self.tx.send(data.to_vec()).is_ok() {
            self.nudge();
        }
    }

    pub(crate) fn set_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.nudge();
    }

    fn nudge(&self) {
        // nonblocking; a full pipe already carries enough wakeups
        unsafe {
            libc::write(self.signal_wr.as_raw_fd(), [1u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Sync half: consumed by [`SshServerTransport`].
pub(crate) struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    signal_rd: OwnedFd,
    eof: Arc<AtomicBool>,
}

pub(crate) fn channel_pipe() -> Result<(ChannelSink, ChannelSource)> {
    let (signal_rd, signal_wr) = nonblocking_pipe()?;
    let (tx, rx) = std::sync::mpsc::channel();
    let eof = Arc::new(AtomicBool::new(false));
    Ok((
        ChannelSink { tx, signal_wr, eof: Arc::clone(&eof) },
        ChannelSource { rx, signal_rd, eof },
    ))
}

pub(crate) struct SshServerTransport {
    rt: tokio::runtime::Handle,
    handle: Handle,
    channel: ChannelId,
    source: ChannelSource,
    /// Partially consumed inbound chunk.
    pending: Vec<u8>,
    closed: bool,
}

impl SshServerTransport {
    pub(crate) fn new(
        rt: tokio::runtime::Handle,
        handle: Handle,
        channel: ChannelId,
        source: ChannelSource,
    ) -> SshServerTransport {
        SshServerTransport { rt, handle, channel, source, pending: Vec::new(), closed: false }
    }

    fn consume_signal(&self) {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(
                self.source.signal_rd.as_raw_fd(),
                byte.as_mut_ptr() as *mut libc::c_void,
                1,
            );
        }
    }

    fn next_chunk(&mut self, timeout_ms: i32) -> Result<Vec<u8>> {
        match self.source.rx.try_recv() {
            Ok(chunk) => {
                self.consume_signal();
                return Ok(chunk);
            }
            Err(TryRecvError::Disconnected) => return Err(Error::TransportEof),
            Err(TryRecvError::Empty) => {}
        }
        if self.source.eof.load(Ordering::SeqCst) {
            return Err(Error::TransportEof);
        }
        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }
        let result = if timeout_ms < 0 {
            self.source.rx.recv().map_err(|_| Error::TransportEof)
        } else {
            self.source.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)).map_err(|e| {
                match e {
                    RecvTimeoutError::Timeout => Error::Timeout,
                    RecvTimeoutError::Disconnected => Error::TransportEof,
                }
            })
        };
        let chunk = result?;
        self.consume_signal();
        Ok(chunk)
    }
}

impl Transport for SshServerTransport {
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if self.pending.is_empty() {
            self.pending = self.next_chunk(timeout_ms)?;
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let data = russh::CryptoVec::from_slice(buf);
        self.rt
            .block_on(self.handle.data(self.channel, data))
            .map_err(|_| Error::TransportEof)
    }

    fn alive(&self) -> bool {
        if self.closed {
            return false;
        }
        !self.pending.is_empty() || !self.source.eof.load(Ordering::SeqCst)
    }

    fn buffered(&self) -> bool {
        !self.pending.is_empty()
    }

    fn read_fd(&self) -> Option<RawFd> {
        Some(self.source.signal_rd.as_raw_fd())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.rt.block_on(async {
            let _ = self.handle.eof(self.channel).await;
            self.handle.close(self.channel).await
        });
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_signals_and_source_drains() {
        let (sink, source) = channel_pipe().unwrap();
        sink.push(b"abc");
        sink.push(b"def");
        // two queued chunks, two signal bytes pending on the pipe
        let mut probe = [0u8; 8];
        let n = unsafe {
            libc::read(
                source.signal_rd.as_raw_fd(),
                probe.as_mut_ptr() as *mut libc::c_void,
                probe.len(),
            )
        };
        assert_eq!(n, 2);
        assert_eq!(source.rx.try_recv().unwrap(), b"abc");
        assert_eq!(source.rx.try_recv().unwrap(), b"def");
        sink.set_eof();
        assert!(source.eof.load(Ordering::SeqCst));
    }
}
