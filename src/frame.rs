//! Wire framing codecs (RFC 6242).
//!
//! NETCONF 1.0 terminates each message with the `]]>]]>` end-of-message
//! marker. NETCONF 1.1 sends a sequence of `\n#<len>\n`-prefixed chunks closed
//! by `\n##\n`. Hello messages always use the 1.0 framing; the session
//! switches codecs once the version is negotiated.

use memmem::{Searcher, TwoWaySearcher};

use crate::error::{Error, Result};
use crate::session::Version;
use crate::transport::{Deadline, Transport};

/// NETCONF 1.0 end-of-message marker.
pub(crate) const EOM: &[u8] = b"]]>]]>";

/// Largest chunk the 1.1 encoder will emit.
pub(crate) const MAX_CHUNK: usize = 65536;

/// Largest chunk length the 1.1 decoder accepts (RFC 6242 chunk-size).
const MAX_CHUNK_DECL: u64 = 4_294_967_295;

/// Longest well-formed chunk header: `\n#` + 10 digits + `\n`.
const MAX_CHUNK_HEADER: usize = 13;

/// Frame `payload` for the wire according to `version`.
pub(crate) fn encode(version: Version, payload: &str) -> Vec<u8> {
    match version {
        Version::V10 => {
            let mut out = Vec::with_capacity(payload.len() + EOM.len());
            out.extend_from_slice(payload.as_bytes());
            out.extend_from_slice(EOM);
            out
        }
        Version::V11 => encode_chunked(payload, MAX_CHUNK),
    }
}

/// Chunked encoding with an explicit split size, for tests; production use
/// goes through [`encode`].
pub(crate) fn encode_chunked(payload: &str, chunk_size: usize) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 16);
    for chunk in bytes.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("\n#{}\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(b"\n##\n");
    out
}

/// Read one complete message from `transport`, consuming leftover bytes from
/// and leaving trailing bytes in `rbuf`.
pub(crate) fn read_message(
    transport: &mut dyn Transport,
    rbuf: &mut Vec<u8>,
    version: Version,
    timeout_ms: i32,
) -> Result<String> {
    let deadline = Deadline::new(timeout_ms);
    match version {
        Version::V10 => read_eom(transport, rbuf, &deadline),
        Version::V11 => read_chunked(transport, rbuf, &deadline),
    }
}

/// Pull more bytes from the transport into `rbuf` within the deadline.
fn fill(transport: &mut dyn Transport, rbuf: &mut Vec<u8>, deadline: &Deadline) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = transport.read(&mut buf, deadline.remaining_ms())?;
    rbuf.extend_from_slice(&buf[..n]);
    Ok(())
}

fn read_eom(
    transport: &mut dyn Transport,
    rbuf: &mut Vec<u8>,
    deadline: &Deadline,
) -> Result<String> {
    let search = TwoWaySearcher::new(EOM);
    let pos = loop {
        if let Some(pos) = search.search_in(rbuf) {
            break pos;
        }
        fill(transport, rbuf, deadline)?;
    };
    let payload = String::from_utf8(rbuf[..pos].to_vec())
        .map_err(|_| Error::MalformedXml("message is not valid UTF-8".into()))?;
    rbuf.drain(..pos + EOM.len());
    Ok(payload)
}

fn read_chunked(
    transport: &mut dyn Transport,
    rbuf: &mut Vec<u8>,
    deadline: &Deadline,
) -> Result<String> {
    let mut msg: Vec<u8> = Vec::new();
    loop {
        // chunk header: `\n#<len>\n`, or the terminator `\n##\n`
        while rbuf.len() < 3 {
            fill(transport, rbuf, deadline)?;
        }
        if &rbuf[..2] != b"\n#" {
            return Err(Error::MalformedFraming("chunk does not start with \\n#".into()));
        }
        let nl = loop {
            match rbuf[2..].iter().position(|&b| b == b'\n') {
                Some(off) => break 2 + off,
                None => {
                    if rbuf.len() > MAX_CHUNK_HEADER {
                        return Err(Error::MalformedFraming("unterminated chunk header".into()));
                    }
                    fill(transport, rbuf, deadline)?;
                }
            }
        };
        let header = &rbuf[2..nl];
        if header == b"#" {
            rbuf.drain(..nl + 1);
            return String::from_utf8(msg)
                .map_err(|_| Error::MalformedXml("message is not valid UTF-8".into()));
        }
        if header.is_empty() || !header.iter().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedFraming("chunk length is not a number".into()));
        }
        let len: u64 = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::MalformedFraming("chunk length is not a number".into()))?;
        if len == 0 || len > MAX_CHUNK_DECL {
            return Err(Error::MalformedFraming(format!("chunk length {len} out of range")));
        }
        let len = len as usize;
        while rbuf.len() < nl + 1 + len {
            fill(transport, rbuf, deadline)?;
        }
        msg.extend_from_slice(&rbuf[nl + 1..nl + 1 + len]);
        rbuf.drain(..nl + 1 + len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    /// Transport over an in-memory byte script.
    struct ScriptTransport {
        data: Vec<u8>,
        pos: usize,
    }

    impl ScriptTransport {
        fn new(data: Vec<u8>) -> ScriptTransport {
            ScriptTransport { data, pos: 0 }
        }
    }

    impl Transport for ScriptTransport {
        fn read(&mut self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
            if self.pos >= self.data.len() {
                return Err(Error::TransportEof);
            }
            // dribble one byte at a time to exercise the refill paths
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }

        fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }

        fn alive(&self) -> bool {
            self.pos < self.data.len()
        }

        fn read_fd(&self) -> Option<std::os::fd::RawFd> {
            None
        }

        fn close(&mut self) {}

        fn kind(&self) -> TransportKind {
            TransportKind::Fd
        }
    }

    fn decode(version: Version, wire: Vec<u8>) -> Result<String> {
        let mut t = ScriptTransport::new(wire);
        let mut rbuf = Vec::new();
        read_message(&mut t, &mut rbuf, version, -1)
    }

    #[test]
    fn eom_round_trip() {
        let payload = "<rpc message-id=\"1\"><get/></rpc>";
        let wire = encode(Version::V10, payload);
        assert!(wire.ends_with(EOM));
        assert_eq!(decode(Version::V10, wire).unwrap(), payload);
    }

    #[test]
    fn eom_leaves_trailing_bytes() {
        let mut wire = encode(Version::V10, "<a/>");
        wire.extend_from_slice(encode(Version::V10, "<b/>").as_slice());
        let mut t = ScriptTransport::new(wire);
        let mut rbuf = Vec::new();
        assert_eq!(read_message(&mut t, &mut rbuf, Version::V10, -1).unwrap(), "<a/>");
        assert_eq!(read_message(&mut t, &mut rbuf, Version::V10, -1).unwrap(), "<b/>");
    }

    #[test]
    fn chunked_round_trip_all_sizes() {
        let payload = "<rpc message-id=\"2\"><lock><target><running/></target></lock></rpc>";
        for k in [1usize, 16, 4096] {
            let wire = encode_chunked(payload, k);
            assert_eq!(decode(Version::V11, wire).unwrap(), payload, "chunk_size={k}");
        }
    }

    #[test]
    fn chunked_totals_match() {
        // chunks summing to N bytes decode to exactly N bytes and the
        // terminator never appears inside a payload
        let payload = "x".repeat(100_000);
        let wire = encode(Version::V11, &payload);
        let decoded = decode(Version::V11, wire).unwrap();
        assert_eq!(decoded.len(), payload.len());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn chunked_empty_message() {
        let wire = encode(Version::V11, "");
        assert_eq!(wire, b"\n##\n");
        assert_eq!(decode(Version::V11, wire).unwrap(), "");
    }

    #[test]
    fn chunked_rejects_zero_length() {
        let wire = b"\n#0\n\n##\n".to_vec();
        assert!(matches!(decode(Version::V11, wire), Err(Error::MalformedFraming(_))));
    }

    #[test]
    fn chunked_rejects_bad_header() {
        for wire in [&b"\n#abc\n"[..], b"#3\nfoo\n##\n", b"\n#\nx"] {
            assert!(
                matches!(decode(Version::V11, wire.to_vec()), Err(Error::MalformedFraming(_))),
                "{wire:?}"
            );
        }
    }

    #[test]
    fn chunked_rejects_oversized_length() {
        let wire = b"\n#4294967296\nx".to_vec();
        assert!(matches!(decode(Version::V11, wire), Err(Error::MalformedFraming(_))));
    }

    #[test]
    fn chunked_short_payload_is_eof() {
        let wire = b"\n#10\nshort".to_vec();
        assert!(matches!(decode(Version::V11, wire), Err(Error::TransportEof)));
    }
}
