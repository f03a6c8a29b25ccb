//! Hello exchange, version selection and capability negotiation.

use log::debug;

use crate::error::{Error, Result};
use crate::message::{Capabilities, Hello, CAP_BASE_10, CAP_BASE_11};
use crate::schema;
use crate::session::{Session, TermReason, Version};

/// Capabilities a plain client advertises: both base versions.
pub(crate) fn client_capabilities() -> Capabilities {
    Capabilities::new(vec![CAP_BASE_10.into(), CAP_BASE_11.into()])
}

/// v1.1 when both sides advertise base:1.1, else v1.0 when both advertise
/// base:1.0, else the handshake fails.
pub(crate) fn negotiate(local: &Capabilities, remote: &Capabilities) -> Result<Version> {
    if local.has_base_11() && remote.has_base_11() {
        Ok(Version::V11)
    } else if local.has_base_10() && remote.has_base_10() {
        Ok(Version::V10)
    } else {
        Err(Error::VersionMismatch)
    }
}

/// Client side of the hello exchange: send our capabilities, take the
/// server's session-id and capability set, negotiate the version and populate
/// the schema context.
pub(crate) fn run_client(session: &Session, timeout_ms: i32) -> Result<()> {
    let local = client_capabilities();
    let result = (|| {
        session.send_hello(&Hello::new(local.clone(), None), timeout_ms)?;
        let peer = session.recv_hello(timeout_ms)?;
        let sid = peer
            .session_id
            .filter(|sid| *sid != 0)
            .ok_or_else(|| Error::MalformedXml("server hello without session-id".into()))?;
        let version = negotiate(&local, &peer.capabilities)?;
        session.set_session_id(sid);
        session.set_version(version);
        session.set_capabilities(peer.capabilities);
        debug!("session {sid}: negotiated {version:?}");
        schema::populate(session, timeout_ms)?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            session.set_running();
            Ok(())
        }
        Err(e) => {
            session.invalidate(TermReason::BadHello);
            Err(e)
        }
    }
}

/// Server side of the hello exchange: advertise `capabilities` and the
/// assigned session-id, then negotiate against the client's hello.
pub(crate) fn run_server(
    session: &Session,
    capabilities: Capabilities,
    session_id: u32,
    timeout_ms: i32,
) -> Result<()> {
    let result = (|| {
        session.send_hello(&Hello::new(capabilities.clone(), Some(session_id)), timeout_ms)?;
        let peer = session.recv_hello(timeout_ms)?;
        if peer.session_id.is_some() {
            return Err(Error::MalformedXml("client hello carries a session-id".into()));
        }
        let version = negotiate(&capabilities, &peer.capabilities)?;
        session.set_session_id(session_id);
        session.set_version(version);
        session.set_capabilities(peer.capabilities);
        debug!("session {session_id}: negotiated {version:?}");
        Ok(())
    })();
    match result {
        Ok(()) => {
            session.set_running();
            Ok(())
        }
        Err(e) => {
            session.invalidate(TermReason::BadHello);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(uris: &[&str]) -> Capabilities {
        Capabilities::new(uris.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn both_11_negotiates_11() {
        let a = caps(&[CAP_BASE_10, CAP_BASE_11]);
        let b = caps(&[CAP_BASE_10, CAP_BASE_11]);
        assert_eq!(negotiate(&a, &b).unwrap(), Version::V11);
    }

    #[test]
    fn one_side_10_negotiates_10() {
        let a = caps(&[CAP_BASE_10, CAP_BASE_11]);
        let b = caps(&[CAP_BASE_10]);
        assert_eq!(negotiate(&a, &b).unwrap(), Version::V10);
        assert_eq!(negotiate(&b, &a).unwrap(), Version::V10);
    }

    #[test]
    fn disjoint_bases_fail() {
        let a = caps(&[CAP_BASE_11]);
        let b = caps(&[CAP_BASE_10]);
        assert!(matches!(negotiate(&a, &b), Err(Error::VersionMismatch)));
        assert!(matches!(negotiate(&b, &a), Err(Error::VersionMismatch)));
    }

    #[test]
    fn no_base_capability_fails() {
        let a = caps(&[CAP_BASE_10, CAP_BASE_11]);
        let b = caps(&["urn:example:nothing"]);
        assert!(matches!(negotiate(&a, &b), Err(Error::VersionMismatch)));
    }
}
