//! Shared plumbing for the integration tests: socketpair-backed descriptor
//! pairs and raw frame helpers for scripting a peer by hand.
#![allow(dead_code)] // each test binary uses a different subset

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

pub const EOM: &[u8] = b"]]>]]>";

/// One end of a socketpair as an (input, output) descriptor pair plus a raw
/// handle the test keeps for scripting.
pub fn fd_pair() -> (
    (std::os::fd::OwnedFd, std::os::fd::OwnedFd),
    UnixStream,
) {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let fd_in = a.try_clone().expect("clone").into();
    let fd_out = a.into();
    ((fd_in, fd_out), b)
}

/// Read one 1.0-framed message from the scripted side, marker stripped.
pub fn read_frame_eom(stream: &mut UnixStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).expect("read");
        assert!(n > 0, "peer closed mid-frame");
        buf.push(byte[0]);
        if buf.ends_with(EOM) {
            buf.truncate(buf.len() - EOM.len());
            return String::from_utf8(buf).expect("utf8");
        }
    }
}

/// Read one 1.1 chunked message from the scripted side.
pub fn read_frame_chunked(stream: &mut UnixStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).expect("read");
        assert!(n > 0, "peer closed mid-frame");
        buf.push(byte[0]);
        if buf.ends_with(b"\n##\n") {
            break;
        }
    }
    // walk the chunk headers
    let mut msg = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        assert_eq!(&buf[pos..pos + 2], b"\n#", "chunk header at {pos}");
        let nl = buf[pos + 2..].iter().position(|&b| b == b'\n').expect("header newline")
            + pos
            + 2;
        let header = &buf[pos + 2..nl];
        if header == b"#" {
            break;
        }
        let len: usize = std::str::from_utf8(header).unwrap().parse().unwrap();
        msg.extend_from_slice(&buf[nl + 1..nl + 1 + len]);
        pos = nl + 1 + len;
    }
    String::from_utf8(msg).expect("utf8")
}

pub fn write_frame_eom(stream: &mut UnixStream, payload: &str) {
    stream.write_all(payload.as_bytes()).expect("write");
    stream.write_all(EOM).expect("write");
}

pub fn write_frame_chunked(stream: &mut UnixStream, payload: &str) {
    let bytes = payload.as_bytes();
    stream
        .write_all(format!("\n#{}\n", bytes.len()).as_bytes())
        .expect("write");
    stream.write_all(bytes).expect("write");
    stream.write_all(b"\n##\n").expect("write");
}

/// A server hello advertising `caps` with the given session-id.
pub fn server_hello(caps: &[&str], session_id: u32) -> String {
    let caps = caps
        .iter()
        .map(|c| format!("<capability>{c}</capability>"))
        .collect::<String>();
    format!(
        "<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
         <capabilities>{caps}</capabilities>\
         <session-id>{session_id}</session-id></hello>"
    )
}

pub const BASE_10: &str = "urn:ietf:params:netconf:base:1.0";
pub const BASE_11: &str = "urn:ietf:params:netconf:base:1.1";
