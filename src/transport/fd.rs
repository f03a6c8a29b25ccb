//! Raw file-descriptor transport.
//!
//! Used for stdio subprocess sessions and for tests; the input and output
//! sides are independent descriptors.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use log::trace;

use crate::error::{Error, Result};
use crate::transport::{
    fd_alive, wait_readable, wait_writable, Deadline, Transport, TransportKind, READ_SLEEP,
};

/// NETCONF over a pair of file descriptors.
pub struct FdTransport {
    fd_in: Option<OwnedFd>,
    fd_out: Option<OwnedFd>,
}

impl FdTransport {
    pub fn new(fd_in: OwnedFd, fd_out: OwnedFd) -> FdTransport {
        FdTransport { fd_in: Some(fd_in), fd_out: Some(fd_out) }
    }

    fn input(&self) -> Result<&OwnedFd> {
        self.fd_in.as_ref().ok_or(Error::SessionClosed)
    }

    fn output(&self) -> Result<&OwnedFd> {
        self.fd_out.as_ref().ok_or(Error::SessionClosed)
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl Transport for FdTransport {
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let deadline = Deadline::new(timeout_ms);
        let fd = self.input()?.as_raw_fd();
        loop {
            let remaining = deadline.remaining_ms();
            if !wait_readable(self.input()?.as_fd(), remaining)? && remaining >= 0 {
                return Err(Error::Timeout);
            }
            match raw_read(fd, buf) {
                Ok(0) => return Err(Error::TransportEof),
                Ok(n) => {
                    trace!("fd {fd}: read {n} bytes");
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if deadline.remaining_ms() == 0 {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(READ_SLEEP);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let fd = self.output()?.as_raw_fd();
        let mut written = 0;
        while written < buf.len() {
            match raw_write(fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(self.output()?.as_fd(), -1)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                    return Err(Error::TransportEof)
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        match &self.fd_in {
            Some(fd) => fd_alive(fd.as_fd()),
            None => false,
        }
    }

    fn read_fd(&self) -> Option<RawFd> {
        self.fd_in.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn close(&mut self) {
        self.fd_in.take();
        self.fd_out.take();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Fd
    }
}
