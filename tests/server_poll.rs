//! Server-side accept over descriptors plus poll-engine dispatch, with a real
//! client session on the other end of a socketpair.

mod common;

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netconf_proto::client;
use netconf_proto::message::{Datastore, ReceivedRpc, ReplyBody, Rpc, RpcError};
use netconf_proto::server::{Server, ServerConfig};
use netconf_proto::{PollSet, PollStatus, Session, SessionStatus};

use common::{fd_pair, read_frame_chunked, write_frame_chunked};

/// Handshake both sides over one socketpair; returns the server session, the
/// client session, and a raw handle on the client's socket for scripting.
fn establish(server: &Server) -> (Arc<Session>, Arc<Session>, UnixStream) {
    let ((client_in, client_out), peer) = fd_pair();
    let raw = peer.try_clone().expect("clone");
    let server_in = peer.try_clone().expect("clone").into();
    let server_out = peer.into();
    thread::scope(|scope| {
        let accepted = scope.spawn(|| server.accept_fd(server_in, server_out, "tester"));
        let client = client::connect_fd(client_in, client_out, None, 5000).expect("client");
        let served = accepted.join().unwrap().expect("server");
        (served, client, raw)
    })
}

fn answer_get(_session: &Arc<Session>, rpc: &ReceivedRpc) -> ReplyBody {
    match rpc.operation.as_str() {
        "get" => ReplyBody::Data("<state><up/></state>".into()),
        "lock" => ReplyBody::Ok,
        _ => ReplyBody::Errors(vec![RpcError::new("protocol", "operation-not-supported", "error")]),
    }
}

#[test]
fn poll_dispatches_one_rpc_per_call() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, client, _raw) = establish(&server);
    assert_eq!(served.session_id(), client.session_id());
    assert_eq!(served.username(), Some("tester"));

    let set = PollSet::new();
    set.add(Arc::clone(&served)).unwrap();

    let handler = |session: &Arc<Session>, rpc: &ReceivedRpc| -> ReplyBody {
        answer_get(session, rpc)
    };

    let id = client.send_rpc(&Rpc::Get { filter: None, with_defaults: None }, 1000).unwrap();
    assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::RpcDispatched);
    let reply = client.recv_reply(id, 2000).unwrap();
    assert_eq!(reply.body, ReplyBody::Data("<state><up/></state>".into()));

    // second RPC needs a second poll call: one dispatch per call
    let id = client.send_rpc(&Rpc::Lock { target: Datastore::Running }, 1000).unwrap();
    assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::RpcDispatched);
    assert_eq!(client.recv_reply(id, 2000).unwrap().body, ReplyBody::Ok);
}

#[test]
fn poll_times_out_when_nothing_arrives() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, _client, _raw) = establish(&server);
    let set = PollSet::new();
    set.add(served).unwrap();
    let handler = answer_get;
    assert_eq!(set.poll(50, &handler).unwrap(), PollStatus::Timeout);
}

#[test]
fn malformed_rpc_gets_an_error_reply_and_the_session_survives() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, client, mut raw) = establish(&server);
    let set = PollSet::new();
    set.add(Arc::clone(&served)).unwrap();
    let handler = answer_get;

    // mismatched tags straight onto the wire (sessions negotiated 1.1)
    write_frame_chunked(&mut raw, "<rpc message-id=\"9\"><lock></rpc>");
    assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::RpcDispatched);
    let reply = read_frame_chunked(&mut raw);
    assert!(reply.contains("malformed-message"), "{reply}");
    assert!(reply.contains("<error-severity>error</error-severity>"), "{reply}");
    assert_eq!(served.status(), SessionStatus::Running);

    // a proper RPC still goes through afterwards
    let id = client.send_rpc(&Rpc::Get { filter: None, with_defaults: None }, 1000).unwrap();
    assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::RpcDispatched);
    assert!(matches!(client.recv_reply(id, 2000).unwrap().body, ReplyBody::Data(_)));
}

#[test]
fn repeated_malformed_input_terminates_the_session() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, _client, mut raw) = establish(&server);
    let set = PollSet::new();
    set.add(Arc::clone(&served)).unwrap();
    let handler = answer_get;

    for _ in 0..2 {
        write_frame_chunked(&mut raw, "<rpc><broken</rpc>");
        assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::RpcDispatched);
        read_frame_chunked(&mut raw);
    }
    write_frame_chunked(&mut raw, "<rpc><broken</rpc>");
    assert_eq!(set.poll(2000, &handler).unwrap(), PollStatus::SessionStateChanged);
    assert_eq!(served.status(), SessionStatus::Invalid);
    assert!(set.is_empty());
}

#[test]
fn close_session_is_answered_and_reported() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, client, _raw) = establish(&server);
    let set = PollSet::new();
    set.add(Arc::clone(&served)).unwrap();
    let handler = answer_get;

    thread::scope(|scope| {
        let poller = scope.spawn(|| set.poll(5000, &handler));
        client.close(2000).unwrap();
        assert_eq!(poller.join().unwrap().unwrap(), PollStatus::SessionStateChanged);
    });
    assert_eq!(served.status(), SessionStatus::Invalid);
    assert!(set.is_empty());
}

#[test]
fn idle_sessions_are_collected() {
    let config = ServerConfig { idle_timeout_ms: 50, ..ServerConfig::default() };
    let server = Server::new(config).unwrap();
    let (served, _client, _raw) = establish(&server);
    let set = PollSet::new();
    set.add(Arc::clone(&served)).unwrap();
    let handler = answer_get;

    thread::sleep(Duration::from_millis(80));
    assert_eq!(set.poll(500, &handler).unwrap(), PollStatus::SessionStateChanged);
    assert_eq!(served.status(), SessionStatus::Closing);
    assert!(set.is_empty());
}

#[test]
fn server_pushes_notifications_to_the_client() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (served, client, _raw) = establish(&server);
    served
        .send_notification("2024-06-01T12:00:00Z", "<alarm xmlns=\"urn:example:x\"/>", 1000)
        .unwrap();
    let notif = client.recv_notification(2000).unwrap();
    assert_eq!(notif.event_time, "2024-06-01T12:00:00Z");
    assert!(notif.xml.contains("<alarm"));
}
