//! End-to-end link tests over loopback TCP
//!
//! A real `RecvDaemon` and `SendDaemon` run in-process with their command
//! sockets in a temporary work directory.

mod common;

use common::{
    peer_on_server, recv_config, send_config, wait_until, RECEIVER_NODE, SENDER_NODE,
};
use linkmq_network::{query, Command, LinkState, RecvDaemon, SendDaemon, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

type Seen = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

fn collecting_receiver(dir: &std::path::Path, msg_type: u16) -> (RecvDaemon, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let mut recv = RecvDaemon::new(recv_config(dir)).unwrap();
    let sink = seen.clone();
    recv.register(msg_type, move |_t: u16, node_id: u32, payload: &[u8]| {
        sink.lock().push((node_id, payload.to_vec()));
        Ok(())
    })
    .unwrap();
    recv.start().unwrap();
    (recv, seen)
}

fn connected_sender(dir: &std::path::Path, recv: &RecvDaemon) -> SendDaemon {
    let port = recv.local_addr().unwrap().port();
    let mut send = SendDaemon::new(send_config(dir, port)).unwrap();
    send.start().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || send.established_links() == 2),
        "links never established"
    );
    send
}

/// Submit, retrying while the send queue pushes back
fn submit_with_backpressure(send: &SendDaemon, msg_type: u16, payload: Vec<u8>) {
    for _ in 0..1_000 {
        match send.submit(msg_type, payload.clone()) {
            Ok(()) => return,
            Err(TransportError::ResourceExhausted { .. }) => {
                thread::sleep(Duration::from_millis(2))
            }
            Err(e) => panic!("submit failed: {e}"),
        }
    }
    panic!("send queue never drained");
}

#[test]
fn test_fifty_messages_over_two_links() {
    let dir = tempdir().unwrap();
    let (mut recv, seen) = collecting_receiver(dir.path(), 7);
    let mut send = connected_sender(dir.path(), &recv);

    for i in 0..50u32 {
        submit_with_backpressure(&send, 7, i.to_be_bytes().to_vec());
    }

    assert!(
        wait_until(Duration::from_secs(5), || seen.lock().len() >= 50),
        "only {} of 50 delivered",
        seen.lock().len()
    );
    // Nothing extra trickles in
    thread::sleep(Duration::from_millis(100));

    let seen = seen.lock();
    assert_eq!(seen.len(), 50);
    assert!(seen.iter().all(|(node, _)| *node == SENDER_NODE));
    let mut values: Vec<u32> = seen
        .iter()
        .map(|(_, p)| u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..50).collect::<Vec<_>>());

    // Both links carried traffic
    let sent: Vec<u64> = (0..2)
        .map(|i| send.session_stats(i).unwrap().send_total)
        .collect();
    assert_eq!(sent.iter().sum::<u64>(), 50);
    assert!(sent.iter().all(|&n| n > 0));
    assert_eq!(recv.proc_stats().proc_total, 50);

    send.shutdown();
    recv.shutdown();
}

#[test]
fn test_unregistered_type_is_counted_as_drop() {
    let dir = tempdir().unwrap();
    let (mut recv, seen) = collecting_receiver(dir.path(), 7);
    let mut send = connected_sender(dir.path(), &recv);

    for i in 0..10u8 {
        submit_with_backpressure(&send, 9, vec![i]);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        recv.proc_stats().drop_total == 10
    }));
    assert!(seen.lock().is_empty());
    assert_eq!(recv.proc_stats().proc_total, 0);

    send.shutdown();
    recv.shutdown();
}

#[test]
fn test_rejected_credentials_never_reach_handlers() {
    let dir = tempdir().unwrap();
    let mut config = recv_config(dir.path());
    config.auth.password = "other".to_string();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let mut recv = RecvDaemon::new(config).unwrap();
    recv.register(7, move |_t: u16, _n: u32, _p: &[u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    recv.start().unwrap();

    let port = recv.local_addr().unwrap().port();
    let mut send = SendDaemon::new(send_config(dir.path(), port)).unwrap();
    send.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        recv.link_stats().err_total >= 2
    }));
    for i in 0..3u8 {
        send.submit(7, vec![i]).unwrap();
    }
    thread::sleep(Duration::from_millis(200));

    assert_eq!(send.established_links(), 0);
    assert_eq!(send.link_state(0), Some(LinkState::AuthPending));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!recv.is_connected(SENDER_NODE));
    // Application data is held back until authentication succeeds
    assert_eq!(send.link_stats().send_total, 0);

    send.shutdown();
    recv.shutdown();
}

#[test]
fn test_reply_reaches_sender_handler() {
    let dir = tempdir().unwrap();
    let (mut recv, _seen) = collecting_receiver(dir.path(), 7);

    let port = recv.local_addr().unwrap().port();
    let replies: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    let mut send = SendDaemon::new(send_config(dir.path(), port)).unwrap();
    send.register(12, move |_t: u16, node_id: u32, payload: &[u8]| {
        sink.lock().push((node_id, payload.to_vec()));
        Ok(())
    })
    .unwrap();
    send.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        send.established_links() == 2 && recv.is_connected(SENDER_NODE)
    }));

    recv.reply(SENDER_NODE, 12, b"pong".to_vec()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || !replies.lock().is_empty()));
    let replies = replies.lock();
    assert_eq!(replies.as_slice(), &[(RECEIVER_NODE, b"pong".to_vec())]);
    assert_eq!(send.proc_stats().proc_total, 1);

    send.shutdown();
    recv.shutdown();
}

#[test]
fn test_reply_survives_closing_one_of_two_links() {
    let dir = tempdir().unwrap();
    let (mut recv, _seen) = collecting_receiver(dir.path(), 7);

    // Two links for the same node, held by different servers
    let (mut first, first_server) = peer_on_server(&recv, None);
    let (mut second, second_server) = peer_on_server(&recv, Some(first_server));
    assert_ne!(first_server, second_server);
    assert!(first.authenticate(SENDER_NODE));
    assert!(second.authenticate(SENDER_NODE));
    assert_eq!(recv.link_count(SENDER_NODE), 2);

    // The later-authenticated link goes away
    drop(second);
    assert!(wait_until(Duration::from_secs(5), || {
        recv.link_count(SENDER_NODE) == 1
    }));
    assert!(recv.is_connected(SENDER_NODE));

    recv.reply(SENDER_NODE, 12, b"still here".to_vec()).unwrap();
    let frame = first
        .next_application(Duration::from_secs(2))
        .expect("reply never reached the remaining link");
    assert_eq!(frame.msg_type(), 12);
    assert_eq!(frame.node_id(), RECEIVER_NODE);
    assert_eq!(frame.payload().as_ref(), b"still here");

    drop(first);
    assert!(wait_until(Duration::from_secs(5), || {
        !recv.is_connected(SENDER_NODE)
    }));
    assert!(recv.reply(SENDER_NODE, 12, b"gone".to_vec()).is_err());

    recv.shutdown();
}

#[test]
fn test_command_channel_queries() {
    let dir = tempdir().unwrap();
    let (mut recv, seen) = collecting_receiver(dir.path(), 7);
    let mut send = connected_sender(dir.path(), &recv);

    submit_with_backpressure(&send, 7, vec![1, 2, 3, 4]);
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));

    let timeout = Duration::from_secs(2);

    let conf = query(&recv.listener_socket(), timeout, |reply_to| {
        Command::QueryConf { reply_to }
    });
    match conf.unwrap() {
        Command::ConfReply(conf) => {
            assert_eq!(conf.name, "rcv");
            assert_eq!(conf.port, recv.local_addr().unwrap().port());
            assert_eq!(conf.recv_queue_count, 4);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let mut recv_total = 0;
    for i in 0..2 {
        let reply = query(&recv.server_socket(i), timeout, |reply_to| {
            Command::QueryRecvStat { reply_to }
        });
        match reply.unwrap() {
            Command::RecvStatReply(stats) => recv_total += stats.recv_total,
            other => panic!("unexpected reply: {other:?}"),
        }
    }
    // Two auth requests plus the one application frame
    assert!(recv_total >= 3);

    let mut processed = 0;
    for i in 0..2 {
        let reply = query(&recv.worker_socket(i), timeout, |reply_to| {
            Command::QueryProcStat { reply_to }
        });
        match reply.unwrap() {
            Command::ProcStatReply(stats) => processed += stats.proc_total,
            other => panic!("unexpected reply: {other:?}"),
        }
    }
    assert_eq!(processed, 1);

    let conf = query(&send.session_socket(0), timeout, |reply_to| {
        Command::QueryConf { reply_to }
    });
    match conf.unwrap() {
        Command::ConfReply(conf) => {
            assert_eq!(conf.name, "snd");
            assert_eq!(conf.node_id, SENDER_NODE);
            assert_eq!(conf.link_threads, 2);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    send.shutdown();
    recv.shutdown();
}

#[test]
fn test_sender_reconnects_after_receiver_restart() {
    let dir = tempdir().unwrap();
    let (mut recv, _seen) = collecting_receiver(dir.path(), 7);
    let port = recv.local_addr().unwrap().port();
    let mut send = connected_sender(dir.path(), &recv);

    recv.shutdown();
    drop(recv);
    assert!(wait_until(Duration::from_secs(5), || send.established_links() == 0));

    let mut config = recv_config(dir.path());
    config.port = port;
    let mut recv = RecvDaemon::new(config).unwrap();
    recv.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || send.established_links() == 2));
    assert!(send.link_stats().reconnects >= 2);

    send.shutdown();
    recv.shutdown();
}
