//! Sender session
//!
//! One thread, one TCP link. The session connects, authenticates, drains its
//! send queue into the link and feeds frames coming back from the peer into
//! the sending daemon's receive queues.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► AuthPending ──auth ok──► Established
//!      ▲                        │                  │                        │
//!      └────────── error, EOF, checksum mismatch, keepalive timeout ◄───────┘
//! ```
//!
//! System frames go through the private pending list and are always written
//! before any application frame. Nothing is requeued when a link dies.

use crate::command::{Command, CommandSocket};
use crate::error::{Result, TransportError};
use crate::event;
use crate::queue::{FrameQueue, ReceiveQueues};
use crate::stats::{ConfSnapshot, LinkStats};
use linkmq_codec::{
    BufferError, Frame, LinkAuthResponse, SnapBuffer, SysMessageType, HEADER_SIZE,
};
use linkmq_config::{AuthConfig, TimingConfig};
use nix::poll::{PollFd, PollFlags};
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Most frames moved from the send queue per writable event
const SEND_BATCH: usize = 256;

/// Link state of a sender session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    AuthPending = 2,
    Established = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::AuthPending,
            3 => LinkState::Established,
            _ => LinkState::Disconnected,
        }
    }
}

/// Keepalive sub-state, meaningful only while established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Unknown,
    /// Request written, no response yet
    Sent,
    Ok,
}

/// Link state readable from other threads
#[derive(Debug)]
pub struct SharedLinkState(AtomicU8);

impl SharedLinkState {
    fn new() -> Self {
        Self(AtomicU8::new(LinkState::Disconnected as u8))
    }

    pub fn load(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Static parameters of one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub index: usize,
    pub node_id: u32,
    pub remote: SocketAddr,
    pub auth: AuthConfig,
    pub timing: TimingConfig,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
}

pub struct SenderSession {
    settings: SessionSettings,
    cmd: CommandSocket,
    stream: Option<TcpStream>,
    send_buf: SnapBuffer,
    recv_buf: SnapBuffer,
    /// System frames waiting for the send buffer
    pending: VecDeque<Frame>,
    send_queue: Arc<FrameQueue>,
    recv_queues: Arc<ReceiveQueues>,
    conf: Arc<ConfSnapshot>,
    stats: Arc<LinkStats>,
    state: Arc<SharedLinkState>,
    keepalive: KeepaliveState,
    last_write: Instant,
    next_scan: Instant,
    retry_at: Option<Instant>,
    attempted: bool,
    shutdown: Arc<AtomicBool>,
}

impl SenderSession {
    pub fn new(
        settings: SessionSettings,
        cmd: CommandSocket,
        send_queue: Arc<FrameQueue>,
        recv_queues: Arc<ReceiveQueues>,
        stats: Arc<LinkStats>,
        conf: Arc<ConfSnapshot>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            send_buf: SnapBuffer::new(settings.send_buffer_size),
            recv_buf: SnapBuffer::new(settings.recv_buffer_size),
            settings,
            cmd,
            stream: None,
            pending: VecDeque::new(),
            send_queue,
            recv_queues,
            conf,
            stats,
            state: Arc::new(SharedLinkState::new()),
            keepalive: KeepaliveState::Unknown,
            last_write: now,
            next_scan: now,
            retry_at: None,
            attempted: false,
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<LinkStats> {
        self.stats.clone()
    }

    pub fn shared_state(&self) -> Arc<SharedLinkState> {
        self.state.clone()
    }

    pub fn state(&self) -> LinkState {
        self.state.load()
    }

    pub fn keepalive_state(&self) -> KeepaliveState {
        self.keepalive
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state);
    }

    pub fn run(mut self) {
        let index = self.settings.index;
        debug!(session = index, remote = %self.settings.remote, "Sender session started");

        while !self.shutdown.load(Ordering::Acquire) {
            if self.stream.is_none() {
                if let Some(at) = self.retry_at {
                    let now = Instant::now();
                    if now < at {
                        self.idle(at - now);
                        continue;
                    }
                }
                if let Err(e) = self.connect() {
                    warn!(session = index, error = %e, "Connect failed");
                    self.set_state(LinkState::Disconnected);
                    self.retry_at =
                        Some(Instant::now() + self.settings.timing.reconnect_interval());
                }
                continue;
            }

            if let Err(e) = self.step() {
                self.close(&e);
            }
        }

        if self.stream.is_some() {
            self.close(&TransportError::system("session shutting down"));
        }
        debug!(session = index, "Sender session stopped");
    }

    /// `Disconnected → Connecting → AuthPending`
    fn connect(&mut self) -> Result<()> {
        let remote = self.settings.remote;
        self.pending.clear();
        self.set_state(LinkState::Connecting);
        if self.attempted {
            self.stats.record_reconnect();
        }
        self.attempted = true;

        let auth = Frame::auth_request(
            self.settings.node_id,
            &self.settings.auth.username,
            &self.settings.auth.password,
        )?;

        let stream = TcpStream::connect_timeout(&remote, self.settings.timing.connect_timeout())
            .map_err(|e| {
                TransportError::connection_with_source("connect failed", Some(remote), e)
            })?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let now = Instant::now();
        self.stream = Some(stream);
        self.last_write = now;
        self.next_scan = now + self.settings.timing.keepalive_interval();
        self.retry_at = None;
        self.keepalive = KeepaliveState::Unknown;
        self.pending.push_back(auth);
        self.set_state(LinkState::AuthPending);
        self.stats.connection_opened();

        info!(session = self.settings.index, remote = %remote, "Connected, authenticating");
        Ok(())
    }

    /// One pass of the event loop on a live link
    fn step(&mut self) -> Result<()> {
        let want_write = !self.pending.is_empty()
            || !self.send_buf.is_empty()
            || (self.state() == LinkState::Established && !self.send_queue.is_empty());

        let (cmd_ready, readable, writable) = {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            let mut flags = PollFlags::POLLIN;
            if want_write {
                flags |= PollFlags::POLLOUT;
            }
            let mut fds = [
                PollFd::new(self.cmd.as_fd(), PollFlags::POLLIN),
                PollFd::new(stream.as_fd(), flags),
            ];
            event::wait(&mut fds, self.settings.timing.poll_timeout())?;
            (
                event::is_readable(&fds[0]),
                event::is_readable(&fds[1]),
                event::is_writable(&fds[1]),
            )
        };

        if cmd_ready {
            self.drain_commands();
        }
        if readable {
            self.on_readable()?;
        }
        if writable {
            self.on_writable()?;
        }
        self.scan_timeouts()
    }

    /// Wait out the reconnect interval while still answering commands
    fn idle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(self.settings.timing.poll_timeout());
            match self.cmd.recv_timeout(wait) {
                Ok(Some(cmd)) => self.handle_command(cmd),
                Ok(None) => {}
                Err(e) => {
                    debug!(session = self.settings.index, error = %e, "Command socket error");
                    std::thread::sleep(wait);
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.cmd.try_recv() {
                Ok(Some(cmd)) => self.handle_command(cmd),
                Ok(None) => break,
                Err(e) => {
                    debug!(session = self.settings.index, error = %e, "Command socket error");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            // Wake-up only; the send queue is checked on every pass
            Command::SendAll | Command::Shutdown => {}
            Command::QueryRecvStat { reply_to } => {
                self.cmd
                    .reply(&reply_to, &Command::RecvStatReply(self.stats.snapshot()));
            }
            Command::QueryConf { reply_to } => {
                self.cmd
                    .reply(&reply_to, &Command::ConfReply(self.conf.as_ref().clone()));
            }
            other => debug!(session = self.settings.index, command = ?other, "Ignoring command"),
        }
    }

    fn on_readable(&mut self) -> Result<()> {
        let remote = Some(self.settings.remote);
        // The whole arena may hold one frame; oversized application frames are
        // rejected later by the receive queue
        let parse_limit = self.recv_buf.capacity().saturating_sub(HEADER_SIZE);

        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            match self.recv_buf.fill_from(stream) {
                Ok(n) => trace!(session = self.settings.index, bytes = n, "Read"),
                Err(e) if e.is_would_block() => return Ok(()),
                Err(BufferError::Closed) => {
                    return Err(TransportError::connection("peer closed the link", remote))
                }
                Err(e) => {
                    return Err(TransportError::connection_with_source("read failed", remote, e))
                }
            }

            while let Some(frame) = self.recv_buf.next_frame(parse_limit)? {
                self.handle_frame(frame)?;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let index = self.settings.index;
        self.stats.record_recv();

        if !frame.is_system() {
            if self.state() != LinkState::Established {
                self.stats.record_drop();
                debug!(
                    session = index,
                    msg_type = frame.msg_type(),
                    "Application frame before auth, dropping"
                );
                return Ok(());
            }
            if let Err(e) = self.recv_queues.dispatch(frame, &self.cmd, index) {
                self.stats.record_drop();
                debug!(session = index, error = %e, "Dropped inbound frame");
            }
            return Ok(());
        }

        match SysMessageType::from_wire(frame.msg_type()) {
            Ok(SysMessageType::KeepaliveResponse) => {
                trace!(session = index, "Keepalive answered");
                self.keepalive = KeepaliveState::Ok;
            }
            Ok(SysMessageType::KeepaliveRequest) => {
                self.pending
                    .push_back(Frame::keepalive_response(self.settings.node_id));
            }
            Ok(SysMessageType::LinkAuthResponse) => {
                let response = LinkAuthResponse::decode(frame.payload())?;
                if response.is_success() {
                    self.keepalive = KeepaliveState::Unknown;
                    self.set_state(LinkState::Established);
                    info!(
                        session = index,
                        remote = %self.settings.remote,
                        peer_node = response.node_id(),
                        "Link established"
                    );
                } else {
                    self.stats.record_error();
                    warn!(
                        session = index,
                        remote = %self.settings.remote,
                        "Authentication rejected by peer"
                    );
                }
            }
            Ok(kind) => {
                self.stats.record_error();
                warn!(session = index, kind = ?kind, "Unexpected system message");
            }
            Err(e) => {
                self.stats.record_error();
                warn!(session = index, error = %e, "Unknown system message");
            }
        }
        Ok(())
    }

    fn on_writable(&mut self) -> Result<()> {
        self.fill_send_buffer();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let written = self.send_buf.drain_to(stream).map_err(|e| {
            TransportError::connection_with_source("write failed", Some(self.settings.remote), e)
        })?;
        if written > 0 {
            self.last_write = Instant::now();
            trace!(session = self.settings.index, bytes = written, "Wrote");
        }
        Ok(())
    }

    /// Pending system frames first, then application frames once established
    fn fill_send_buffer(&mut self) {
        while let Some(frame) = self.pending.front() {
            if !self.send_buf.append_frame(frame) {
                return;
            }
            self.pending.pop_front();
        }

        if self.state() != LinkState::Established {
            return;
        }
        let room = self.send_buf.free_space() / self.send_queue.slot_size();
        if room == 0 {
            return;
        }
        let batch = self.send_queue.mpop(room.min(SEND_BATCH));
        let mut sent = 0;
        for frame in batch {
            if self.send_buf.append_frame(&frame) {
                sent += 1;
            } else {
                self.stats.record_drop();
            }
        }
        self.stats.record_sent(sent);
    }

    /// Keepalive and authentication deadlines, checked every pass
    fn scan_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        if now < self.next_scan {
            return Ok(());
        }
        let interval = self.settings.timing.keepalive_interval();
        self.next_scan = now + interval;

        match self.state() {
            LinkState::AuthPending => Err(TransportError::authentication(format!(
                "no successful auth response within {}ms",
                interval.as_millis()
            ))),
            LinkState::Established => {
                if self.keepalive == KeepaliveState::Sent {
                    return Err(TransportError::timeout(
                        "keepalive response",
                        interval.as_millis() as u64,
                    ));
                }
                if now.duration_since(self.last_write) >= interval {
                    debug!(session = self.settings.index, "Link idle, sending keepalive");
                    self.pending
                        .push_back(Frame::keepalive_request(self.settings.node_id));
                    self.keepalive = KeepaliveState::Sent;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Tear the link down and schedule a reconnect
    fn close(&mut self, reason: &TransportError) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.stats.connection_closed();
            warn!(
                session = self.settings.index,
                remote = %self.settings.remote,
                category = reason.category(),
                "Link closed: {}",
                reason
            );
        }
        self.send_buf.reset();
        self.recv_buf.reset();
        self.pending.clear();
        self.keepalive = KeepaliveState::Unknown;
        self.set_state(LinkState::Disconnected);
        self.retry_at = Some(Instant::now() + self.settings.timing.reconnect_interval());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{socket_path, SocketRole};
    use linkmq_codec::{decode_frame, LinkAuthRequest};
    use linkmq_config::QueueConfig;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn session(dir: &std::path::Path, remote: SocketAddr) -> SenderSession {
        let queue_config = QueueConfig {
            capacity: 16,
            slot_size: 128,
        };
        let settings = SessionSettings {
            index: 0,
            node_id: 42,
            remote,
            auth: AuthConfig::default(),
            timing: TimingConfig {
                poll_timeout_ms: 10,
                keepalive_interval_ms: 200,
                ..TimingConfig::default()
            },
            send_buffer_size: 1024,
            recv_buffer_size: 1024,
        };
        let cmd = CommandSocket::bind(&socket_path(dir, "s", SocketRole::SendSession, 0)).unwrap();
        let recv_queues = ReceiveQueues::new(
            &queue_config,
            1,
            vec![socket_path(dir, "s", SocketRole::SendWorker, 0)],
        )
        .unwrap();
        SenderSession::new(
            settings,
            cmd,
            Arc::new(FrameQueue::new(&queue_config).unwrap()),
            Arc::new(recv_queues),
            Arc::new(LinkStats::default()),
            Arc::new(ConfSnapshot::default()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_link_state_round_trip() {
        let shared = SharedLinkState::new();
        for state in [
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::AuthPending,
            LinkState::Established,
        ] {
            shared.store(state);
            assert_eq!(shared.load(), state);
        }
    }

    #[test]
    fn test_connect_queues_auth_first() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());

        s.send_queue
            .push(Frame::application(7, 42, b"data".to_vec()))
            .unwrap();
        s.connect().unwrap();
        assert_eq!(s.state(), LinkState::AuthPending);
        let (mut peer, _) = listener.accept().unwrap();

        // Data stays queued until the peer accepts the credentials
        s.on_writable().unwrap();
        assert_eq!(s.send_queue.len(), 1);

        let mut buf = [0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        let (frame, used) = decode_frame(&buf[..n], 128).unwrap().unwrap();
        assert_eq!(used, n);
        assert_eq!(frame.msg_type(), u16::from(SysMessageType::LinkAuthRequest));
        let auth = LinkAuthRequest::decode(frame.payload()).unwrap();
        assert_eq!(auth.node_id(), 42);
        assert!(auth.matches("linkmq", "linkmq"));

        s.handle_frame(Frame::auth_response(0, true)).unwrap();
        assert_eq!(s.state(), LinkState::Established);
        s.on_writable().unwrap();
        assert!(s.send_queue.is_empty());
        assert_eq!(s.stats.snapshot().send_total, 1);
    }

    #[test]
    fn test_rejected_auth_stalls_until_scan() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());
        s.connect().unwrap();

        s.handle_frame(Frame::auth_response(0, false)).unwrap();
        assert_eq!(s.state(), LinkState::AuthPending);
        assert!(s.scan_timeouts().is_ok());

        s.next_scan = Instant::now();
        let err = s.scan_timeouts().unwrap_err();
        assert_eq!(err.category(), "authentication");
    }

    #[test]
    fn test_keepalive_sent_once_then_times_out() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());
        s.connect().unwrap();
        s.handle_frame(Frame::auth_response(0, true)).unwrap();
        s.pending.clear();

        s.last_write = Instant::now() - Duration::from_secs(1);
        s.next_scan = Instant::now();
        s.scan_timeouts().unwrap();
        assert_eq!(s.keepalive_state(), KeepaliveState::Sent);
        assert_eq!(s.pending.len(), 1);

        // Scans between deadlines do nothing
        s.scan_timeouts().unwrap();
        assert_eq!(s.pending.len(), 1);

        s.next_scan = Instant::now();
        assert_eq!(s.scan_timeouts().unwrap_err().category(), "timeout");

        s.close(&TransportError::timeout("keepalive response", 200));
        assert_eq!(s.state(), LinkState::Disconnected);
        assert!(s.pending.is_empty());
        assert!(s.retry_at.is_some());
    }

    #[test]
    fn test_peer_keepalive_request_is_answered() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());
        s.connect().unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        s.handle_frame(Frame::auth_response(0, true)).unwrap();
        s.on_writable().unwrap();

        peer.write_all(&Frame::keepalive_request(0).encode()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while s.pending.is_empty() && Instant::now() < deadline {
            s.on_readable().unwrap();
        }
        assert_eq!(
            s.pending.front().map(Frame::msg_type),
            Some(u16::from(SysMessageType::KeepaliveResponse))
        );
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());
        s.connect().unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut wire = Frame::keepalive_response(0).encode().to_vec();
        wire[14] ^= 0xFF;
        peer.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match s.on_readable() {
                Err(e) => {
                    assert_eq!(e.category(), "protocol");
                    break;
                }
                Ok(()) => assert!(Instant::now() < deadline, "corrupt frame accepted"),
            }
        }
    }

    #[test]
    fn test_peer_close_is_reported() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut s = session(dir.path(), listener.local_addr().unwrap());
        s.connect().unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match s.on_readable() {
                Err(e) => {
                    assert_eq!(e.category(), "connection");
                    break;
                }
                Ok(()) => assert!(Instant::now() < deadline, "EOF not reported"),
            }
        }
    }
}
