//! # netconf-proto
//!
//! A Rust library for the NETCONF protocol ([RFC 6241](https://datatracker.ietf.org/doc/html/rfc6241)).
//!
//! NETCONF is a network management protocol defined by the IETF. It provides
//! mechanisms to install, manipulate, and delete the configuration of network
//! devices. Its operations are realized as Remote Procedure Calls (RPCs)
//! encoded in XML. This crate implements both protocol roles:
//!
//! - **Client**: [`client::connect_ssh`], [`client::connect_tls`] and
//!   [`client::connect_fd`] establish outbound sessions;
//!   [`client::CallHomeListener`] accepts reverse (Call-Home, RFC 8071)
//!   connections.
//! - **Server**: [`server::Server`] listens on named endpoints, authenticates
//!   SSH or TLS clients, and hands running sessions to a [`poll::PollSet`]
//!   that dispatches inbound RPCs to a handler, one session at a time.
//!
//! Both NETCONF framings are supported and selected by hello negotiation:
//! end-of-message (`]]>]]>`) for 1.0 and chunked framing for 1.1 (RFC 6242).
//!
//! ## Quick Start
//!
//! ```ignore
//! use netconf_proto::client::{self, SshClientConfig};
//! use netconf_proto::message::{Datastore, ReplyBody, Rpc};
//!
//! # fn main() -> netconf_proto::Result<()> {
//! let config = SshClientConfig::new("admin");
//! let session = client::connect_ssh("192.0.2.1", None, &config, None)?;
//! let id = session.send_rpc(&Rpc::Lock { target: Datastore::Running }, 1000)?;
//! match session.recv_reply(id, 1000)?.body {
//!     ReplyBody::Ok => println!("locked"),
//!     other => println!("lock failed: {other:?}"),
//! }
//! session.close(1000)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Cargo Features
//!
//! - **`ssh`** (default): SSH transport, client role via ssh2, server role
//!   via russh
//! - **`tls`** (default): TLS transport via openssl, both roles
//!
//! The fd transport is always available and carries NETCONF over a pair of
//! raw descriptors (stdio subprocess setups, tests).
//!
//! ## Concurrency
//!
//! Sessions are `Arc`-shared; every transport read and write happens under
//! the session's transport lock, so per-session operations serialize while
//! distinct sessions proceed in parallel. Blocking operations take a timeout
//! in milliseconds: negative waits forever, zero probes without blocking.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

pub mod client;
pub mod error;
mod frame;
mod handshake;
pub mod message;
pub mod poll;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;
pub mod xml;

pub use crate::error::{Error, Result};
pub use crate::message::{
    Capabilities, Datastore, EditDefaultOp, EditErrOpt, EditTestOpt, Hello, Notification,
    ReceivedRpc, ReplyBody, Rpc, RpcError, RpcReply, WithDefaults,
};
pub use crate::poll::{PollSet, PollStatus, RpcHandler};
pub use crate::schema::SchemaContext;
pub use crate::session::{Role, Session, SessionStatus, TermReason, Version};
pub use crate::transport::{Transport, TransportKind};

/// Default NETCONF-over-SSH port.
pub const PORT_SSH: u16 = 830;
/// Default NETCONF-over-TLS port.
pub const PORT_TLS: u16 = 6513;
/// Default SSH Call-Home port.
pub const PORT_CH_SSH: u16 = 4334;
/// Default TLS Call-Home port.
pub const PORT_CH_TLS: u16 = 4335;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Bracket the crate's use of the underlying crypto libraries. Idempotent;
/// connect and accept entry points call it on their own, so an explicit call
/// is only needed to control initialization timing.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    #[cfg(feature = "tls")]
    openssl::init();
    debug!("netconf-proto initialized");
}

/// Counterpart of [`init`]. The Rust crypto bindings release their state with
/// the process, so this only rearms [`init`]; calling it more than once is
/// safe.
pub fn destroy() {
    INITIALIZED.store(false, Ordering::SeqCst);
}
