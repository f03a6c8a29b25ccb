//! Client session I/O against a hand-scripted server: framing round-trips on
//! the wire, reply correlation and reply/notification interleaving.

mod common;

use std::sync::Arc;
use std::thread;

use netconf_proto::client;
use netconf_proto::message::{Datastore, ReplyBody, Rpc};
use netconf_proto::{Session, Version};

use common::{
    fd_pair, read_frame_chunked, read_frame_eom, server_hello, write_frame_chunked,
    write_frame_eom, BASE_10, BASE_11,
};

const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
const NOTIF_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

fn ok_reply(id: &str) -> String {
    format!("<rpc-reply message-id=\"{id}\" xmlns=\"{BASE_NS}\"><ok/></rpc-reply>")
}

fn start_session(
    caps: &'static [&'static str],
) -> (Arc<Session>, std::os::unix::net::UnixStream) {
    let ((fd_in, fd_out), mut peer) = fd_pair();
    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        write_frame_eom(&mut peer, &server_hello(caps, 1));
        peer
    });
    let session = client::connect_fd(fd_in, fd_out, None, 5000).expect("handshake");
    (session, server.join().unwrap())
}

#[test]
fn lock_over_v10_framing() {
    let (session, mut peer) = start_session(&[BASE_10]);
    assert_eq!(session.version(), Version::V10);

    let server = thread::spawn(move || {
        let rpc = read_frame_eom(&mut peer);
        assert!(rpc.contains("message-id=\"1\""), "{rpc}");
        assert!(rpc.contains("<lock><target><running/></target></lock>"), "{rpc}");
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    let id = session.send_rpc(&Rpc::Lock { target: Datastore::Running }, 1000).unwrap();
    assert_eq!(id, 1);
    let reply = session.recv_reply(id, 5000).unwrap();
    assert_eq!(reply.body, ReplyBody::Ok);
    server.join().unwrap();
}

#[test]
fn lock_over_v11_chunked_framing() {
    let (session, mut peer) = start_session(&[BASE_10, BASE_11]);
    assert_eq!(session.version(), Version::V11);

    let server = thread::spawn(move || {
        let rpc = read_frame_chunked(&mut peer);
        assert!(rpc.contains("message-id=\"1\""), "{rpc}");
        assert!(rpc.contains("<lock><target><running/></target></lock>"), "{rpc}");
        write_frame_chunked(&mut peer, &ok_reply("1"));
        peer
    });

    let id = session.send_rpc(&Rpc::Lock { target: Datastore::Running }, 1000).unwrap();
    let reply = session.recv_reply(id, 5000).unwrap();
    assert_eq!(reply.body, ReplyBody::Ok);
    server.join().unwrap();
}

#[test]
fn replies_correlate_regardless_of_arrival_order() {
    let (session, mut peer) = start_session(&[BASE_10]);

    let server = thread::spawn(move || {
        let first = read_frame_eom(&mut peer);
        let second = read_frame_eom(&mut peer);
        assert!(first.contains("message-id=\"1\""));
        assert!(second.contains("message-id=\"2\""));
        // answer in reverse order
        write_frame_eom(&mut peer, &ok_reply("2"));
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    let id1 = session.send_rpc(&Rpc::DiscardChanges, 1000).unwrap();
    let id2 = session.send_rpc(&Rpc::Commit {
        confirmed: false,
        confirm_timeout: None,
        persist: None,
        persist_id: None,
    }, 1000).unwrap();
    // the reply for id2 arrives first and is parked on the deferred queue
    let r1 = session.recv_reply(id1, 5000).unwrap();
    assert_eq!(r1.message_id, "1");
    // id2's reply is served from the queue without touching the transport
    let r2 = session.recv_reply(id2, 0).unwrap();
    assert_eq!(r2.message_id, "2");
    server.join().unwrap();
}

#[test]
fn unknown_reply_ids_are_discarded() {
    let (session, mut peer) = start_session(&[BASE_10]);

    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        write_frame_eom(&mut peer, &ok_reply("999"));
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    let id = session.send_rpc(&Rpc::DiscardChanges, 1000).unwrap();
    let reply = session.recv_reply(id, 5000).unwrap();
    assert_eq!(reply.message_id, "1");
    server.join().unwrap();
}

#[test]
fn notification_is_buffered_while_waiting_for_a_reply() {
    let (session, mut peer) = start_session(&[BASE_10]);

    let server = thread::spawn(move || {
        let rpc = read_frame_eom(&mut peer);
        assert!(rpc.contains("create-subscription"));
        // notification first, then the pending reply
        let notif = format!(
            "<notification xmlns=\"{NOTIF_NS}\">\
             <eventTime>2024-06-01T10:00:00Z</eventTime>\
             <link-up xmlns=\"urn:example:events\"/></notification>"
        );
        write_frame_eom(&mut peer, &notif);
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    let id = session
        .send_rpc(
            &Rpc::CreateSubscription {
                stream: None,
                filter: None,
                start_time: None,
                stop_time: None,
            },
            1000,
        )
        .unwrap();
    let reply = session.recv_reply(id, 5000).unwrap();
    assert_eq!(reply.body, ReplyBody::Ok);
    // the notification that arrived first is waiting on the deferred queue
    let notif = session.recv_notification(0).unwrap();
    assert_eq!(notif.event_time, "2024-06-01T10:00:00Z");
    assert!(notif.xml.contains("link-up"));
    server.join().unwrap();
}

#[test]
fn malformed_inbound_does_not_kill_a_client_session() {
    let (session, mut peer) = start_session(&[BASE_10]);

    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        write_frame_eom(&mut peer, "<rpc-reply><broken</rpc-reply>");
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    let id = session.send_rpc(&Rpc::DiscardChanges, 1000).unwrap();
    let reply = session.recv_reply(id, 5000).unwrap();
    assert_eq!(reply.body, ReplyBody::Ok);
    assert_eq!(session.status(), netconf_proto::SessionStatus::Running);
    server.join().unwrap();
}

#[test]
fn concurrent_senders_do_not_interleave_frames() {
    let (session, mut peer) = start_session(&[BASE_10]);
    const PER_THREAD: usize = 25;

    let server = thread::spawn(move || {
        let mut ids = Vec::new();
        for _ in 0..2 * PER_THREAD {
            let rpc = read_frame_eom(&mut peer);
            // every frame is one complete, well-formed rpc
            assert!(rpc.trim_start().starts_with("<?xml"), "{rpc}");
            assert!(rpc.trim_end().ends_with("</rpc>"), "{rpc}");
            let id: u64 = rpc
                .split("message-id=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
                .and_then(|s| s.parse().ok())
                .expect("message-id");
            ids.push(id);
        }
        ids
    });

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                for _ in 0..PER_THREAD {
                    session.send_rpc(&Rpc::DiscardChanges, -1).unwrap();
                }
            });
        }
    });

    let mut ids = server.join().unwrap();
    ids.sort_unstable();
    let expected: Vec<u64> = (1..=2 * PER_THREAD as u64).collect();
    assert_eq!(ids, expected);
}

#[test]
fn close_terminates_once_and_stays_closed() {
    let (session, mut peer) = start_session(&[BASE_10]);

    let server = thread::spawn(move || {
        let rpc = read_frame_eom(&mut peer);
        assert!(rpc.contains("<close-session/>"), "{rpc}");
        write_frame_eom(&mut peer, &ok_reply("1"));
        peer
    });

    session.close(1000).unwrap();
    session.close(1000).unwrap();
    assert_eq!(session.status(), netconf_proto::SessionStatus::Invalid);
    assert!(matches!(
        session.send_rpc(&Rpc::DiscardChanges, 0),
        Err(netconf_proto::Error::SessionClosed)
    ));
    server.join().unwrap();
}
