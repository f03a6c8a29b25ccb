//! Hello exchange against a hand-scripted peer over a socketpair.

mod common;

use std::thread;

use netconf_proto::client;
use netconf_proto::{Error, SessionStatus, Version};

use common::{fd_pair, read_frame_eom, server_hello, write_frame_eom, BASE_10, BASE_11};

#[test]
fn negotiates_v11_when_both_sides_speak_it() {
    let ((fd_in, fd_out), mut peer) = fd_pair();
    let server = thread::spawn(move || {
        let hello = read_frame_eom(&mut peer);
        assert!(hello.contains(BASE_10));
        assert!(hello.contains(BASE_11));
        assert!(!hello.contains("session-id"));
        write_frame_eom(&mut peer, &server_hello(&[BASE_10, BASE_11], 42));
        peer
    });
    let session = client::connect_fd(fd_in, fd_out, None, 5000).expect("handshake");
    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(session.session_id(), 42);
    assert_eq!(session.version(), Version::V11);
    assert!(session.capabilities().has_base_11());
    server.join().unwrap();
}

#[test]
fn falls_back_to_v10() {
    let ((fd_in, fd_out), mut peer) = fd_pair();
    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        write_frame_eom(&mut peer, &server_hello(&[BASE_10], 7));
        peer
    });
    let session = client::connect_fd(fd_in, fd_out, None, 5000).expect("handshake");
    assert_eq!(session.version(), Version::V10);
    server.join().unwrap();
}

#[test]
fn fails_without_a_common_base() {
    let ((fd_in, fd_out), mut peer) = fd_pair();
    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        write_frame_eom(&mut peer, &server_hello(&["urn:example:unrelated"], 9));
        peer
    });
    let err = client::connect_fd(fd_in, fd_out, None, 5000).unwrap_err();
    assert!(matches!(err, Error::VersionMismatch), "{err:?}");
    server.join().unwrap();
}

#[test]
fn rejects_server_hello_without_session_id() {
    let ((fd_in, fd_out), mut peer) = fd_pair();
    let server = thread::spawn(move || {
        read_frame_eom(&mut peer);
        let hello = format!(
            "<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
             <capabilities><capability>{BASE_10}</capability></capabilities></hello>"
        );
        write_frame_eom(&mut peer, &hello);
        peer
    });
    let err = client::connect_fd(fd_in, fd_out, None, 5000).unwrap_err();
    assert!(matches!(err, Error::MalformedXml(_)), "{err:?}");
    server.join().unwrap();
}

#[test]
fn hello_times_out_against_a_mute_peer() {
    let ((fd_in, fd_out), _peer) = fd_pair();
    let err = client::connect_fd(fd_in, fd_out, None, 100).unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
}
