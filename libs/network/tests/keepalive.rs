//! Keepalive liveness against a scripted peer
//!
//! The peer is a bare `TcpListener` speaking the wire format directly, so the
//! test controls exactly which system frames get answered.

mod common;

use common::{send_config, wait_until};
use linkmq_codec::{BufferError, Frame, SnapBuffer, SysMessageType};
use linkmq_network::{LinkState, SendDaemon};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const KEEPALIVE_MS: u64 = 200;

/// What a scripted peer saw on one connection
#[derive(Debug, Default)]
struct PeerLog {
    keepalives: usize,
    closed_by_sender: bool,
}

fn accept_within(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                return Some(stream);
            }
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
    None
}

/// Accept auth, then read until `until`, answering keepalives if `respond`
fn script_peer(mut stream: TcpStream, respond: bool, until: Duration) -> PeerLog {
    stream
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();
    let mut buf = SnapBuffer::new(4096);
    let mut log = PeerLog::default();
    let deadline = Instant::now() + until;

    while Instant::now() < deadline {
        match buf.fill_from(&mut stream) {
            Ok(_) => {}
            Err(BufferError::Closed) => {
                log.closed_by_sender = true;
                break;
            }
            Err(e) if e.is_would_block() => continue,
            Err(BufferError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => panic!("peer read failed: {e}"),
        }

        while let Some(frame) = buf.next_frame(4096 - 15).unwrap() {
            match SysMessageType::from_wire(frame.msg_type()) {
                Ok(SysMessageType::LinkAuthRequest) => {
                    stream.write_all(&Frame::auth_response(0, true).encode()).unwrap();
                }
                Ok(SysMessageType::KeepaliveRequest) => {
                    log.keepalives += 1;
                    if respond {
                        stream.write_all(&Frame::keepalive_response(0).encode()).unwrap();
                    }
                }
                other => panic!("unexpected frame from sender: {other:?}"),
            }
        }
    }
    log
}

fn single_link_sender(dir: &std::path::Path, port: u16) -> SendDaemon {
    let mut config = send_config(dir, port);
    config.send_threads = 1;
    config.timing.keepalive_interval_ms = KEEPALIVE_MS;
    config.timing.poll_timeout_ms = 10;
    config.timing.reconnect_interval_ms = 100;
    let mut send = SendDaemon::new(config).unwrap();
    send.start().unwrap();
    send
}

#[test]
fn test_silent_peer_gets_one_keepalive_then_reconnect() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut send = single_link_sender(dir.path(), port);

    let first = accept_within(&listener, Duration::from_secs(2)).expect("no connection");
    let log = script_peer(first, false, Duration::from_secs(3));

    assert!(log.closed_by_sender, "sender never gave up on the silent peer");
    assert_eq!(log.keepalives, 1);

    let second = accept_within(&listener, Duration::from_secs(2));
    assert!(second.is_some(), "no reconnect attempt observed");
    assert!(send.link_stats().reconnects >= 1);

    send.shutdown();
}

#[test]
fn test_answered_keepalives_keep_link_up() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut send = single_link_sender(dir.path(), port);

    let stream = accept_within(&listener, Duration::from_secs(2)).expect("no connection");
    let log = script_peer(stream, true, Duration::from_millis(KEEPALIVE_MS * 6));

    assert!(!log.closed_by_sender);
    assert!(log.keepalives >= 2, "saw {} keepalives", log.keepalives);
    assert!(wait_until(Duration::from_millis(100), || {
        send.link_state(0) == Some(LinkState::Established)
    }));
    assert_eq!(send.link_stats().reconnects, 0);

    send.shutdown();
}
