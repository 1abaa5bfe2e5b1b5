//! Shared fixtures for link tests: fast timers, small queues, loopback only

#![allow(dead_code)]

use linkmq_codec::{
    BufferError, Frame, LinkAuthResponse, SnapBuffer, SysMessageType, HEADER_SIZE,
};
use linkmq_config::{AuthConfig, QueueConfig, RecvConfig, SendConfig, TimingConfig};
use linkmq_network::{query, Command, RecvDaemon};
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

pub const SENDER_NODE: u32 = 7;
pub const RECEIVER_NODE: u32 = 100;

pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        reconnect_interval_ms: 50,
        keepalive_interval_ms: 5_000,
        poll_timeout_ms: 20,
        connect_timeout_ms: 1_000,
        idle_timeout_ms: 10_000,
    }
}

pub fn recv_config(dir: &Path) -> RecvConfig {
    RecvConfig {
        node_id: RECEIVER_NODE,
        name: "rcv".to_string(),
        work_dir: dir.to_path_buf(),
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        recv_threads: 2,
        work_threads: 2,
        recv_queue: QueueConfig {
            capacity: 64,
            slot_size: 64,
        },
        reply_queue: QueueConfig {
            capacity: 16,
            slot_size: 64,
        },
        send_buffer_size: 4096,
        recv_buffer_size: 4096,
        timing: fast_timing(),
        ..RecvConfig::default()
    }
}

pub fn send_config(dir: &Path, port: u16) -> SendConfig {
    SendConfig {
        node_id: SENDER_NODE,
        name: "snd".to_string(),
        work_dir: dir.to_path_buf(),
        remote_addr: "127.0.0.1".to_string(),
        remote_port: port,
        auth: AuthConfig::default(),
        send_threads: 2,
        work_threads: 1,
        send_queue: QueueConfig {
            capacity: 16,
            slot_size: 64,
        },
        recv_queue: QueueConfig {
            capacity: 16,
            slot_size: 64,
        },
        send_buffer_size: 4096,
        recv_buffer_size: 4096,
        timing: fast_timing(),
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Hand-driven link that speaks the wire format directly
pub struct RawPeer {
    stream: TcpStream,
    buf: SnapBuffer,
    closed: bool,
}

impl RawPeer {
    const BUFFER: usize = 4096;

    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        Self {
            stream,
            buf: SnapBuffer::new(Self::BUFFER),
            closed: false,
        }
    }

    pub fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.encode()).unwrap();
    }

    /// Authenticate with the default credentials; true when accepted
    pub fn authenticate(&mut self, node_id: u32) -> bool {
        let auth = AuthConfig::default();
        self.send(&Frame::auth_request(node_id, &auth.username, &auth.password).unwrap());
        let frame = self
            .next_system(SysMessageType::LinkAuthResponse, Duration::from_secs(2))
            .expect("no auth response");
        LinkAuthResponse::decode(frame.payload()).unwrap().is_success()
    }

    /// Next frame within `timeout`; `None` on timeout or close
    pub fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.buf.next_frame(Self::BUFFER - HEADER_SIZE).unwrap() {
                return Some(frame);
            }
            if self.closed || Instant::now() >= deadline {
                return None;
            }
            match self.buf.fill_from(&mut self.stream) {
                Ok(_) => {}
                Err(BufferError::Closed) => self.closed = true,
                Err(e) if e.is_would_block() => {}
                Err(BufferError::Io(e)) if e.kind() == ErrorKind::TimedOut => {}
                Err(BufferError::Io(e)) if e.kind() == ErrorKind::ConnectionReset => {
                    self.closed = true
                }
                Err(e) => panic!("raw peer read failed: {e}"),
            }
        }
    }

    /// Next system frame of `kind`, skipping anything else
    pub fn next_system(&mut self, kind: SysMessageType, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        while let Some(frame) = self.next_frame(remaining(deadline)) {
            let matched = matches!(SysMessageType::from_wire(frame.msg_type()), Ok(k) if k == kind);
            if frame.is_system() && matched {
                return Some(frame);
            }
        }
        None
    }

    /// Next application frame, skipping system traffic
    pub fn next_application(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        while let Some(frame) = self.next_frame(remaining(deadline)) {
            if !frame.is_system() {
                return Some(frame);
            }
        }
        None
    }

    /// Read until the remote end closes or `timeout` passes
    pub fn closed_within(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.closed && Instant::now() < deadline {
            self.next_frame(remaining(deadline));
        }
        self.closed
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Open connections per receive server, read over the command channel
pub fn server_connections(recv: &RecvDaemon) -> Vec<u64> {
    (0..recv.config().recv_threads)
        .map(|i| {
            let reply = query(&recv.server_socket(i), Duration::from_secs(2), |reply_to| {
                Command::QueryRecvStat { reply_to }
            })
            .unwrap();
            match reply {
                Command::RecvStatReply(stats) => stats.connections,
                other => panic!("unexpected reply: {other:?}"),
            }
        })
        .collect()
}

/// Open raw links until one lands on a server other than `avoid`
///
/// Returns the peer and the index of the server it landed on.
pub fn peer_on_server(recv: &RecvDaemon, avoid: Option<usize>) -> (RawPeer, usize) {
    let addr = recv.local_addr().unwrap();
    for _ in 0..64 {
        let before = server_connections(recv);
        let peer = RawPeer::connect(addr);

        let mut landed = None;
        wait_until(Duration::from_secs(2), || {
            let now = server_connections(recv);
            landed = now.iter().zip(&before).position(|(n, b)| n > b);
            landed.is_some()
        });
        let server = landed.expect("connection never reached a server");
        if Some(server) != avoid {
            return (peer, server);
        }

        drop(peer);
        assert!(wait_until(Duration::from_secs(2), || {
            server_connections(recv) == before
        }));
    }
    panic!("listener never picked another server");
}
