//! Receive server
//!
//! Multiplexes many peer connections on one thread. A connection must
//! authenticate before its application frames are accepted, and every frame
//! it sends afterwards must carry the node id it authenticated with.

use super::listener::Handoff;
use super::routes::RouteTable;
use crate::command::{Command, CommandSocket};
use crate::error::{Result, TransportError};
use crate::event;
use crate::queue::{FrameQueue, ReceiveQueues};
use crate::stats::{ConfSnapshot, LinkStats};
use linkmq_codec::{
    BufferError, Frame, LinkAuthRequest, SnapBuffer, SysMessageType, HEADER_SIZE,
};
use linkmq_config::{AuthConfig, TimingConfig};
use nix::poll::{PollFd, PollFlags};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Reply frames routed per pass
const REPLY_BATCH: usize = 256;

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    send_buf: SnapBuffer,
    recv_buf: SnapBuffer,
    node_id: Option<u32>,
    last_read: Instant,
    closed: Option<TransportError>,
}

/// Static parameters of one server
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub index: usize,
    pub node_id: u32,
    pub auth: AuthConfig,
    pub timing: TimingConfig,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
}

/// Everything frame handling needs besides the connection itself
struct ServerContext {
    settings: ServerSettings,
    cmd: CommandSocket,
    recv_queues: Arc<ReceiveQueues>,
    routes: Arc<RouteTable>,
    stats: Arc<LinkStats>,
}

pub struct ReceiveServer {
    ctx: ServerContext,
    conns: Vec<Connection>,
    handoff: Arc<Handoff>,
    reply_queue: Arc<FrameQueue>,
    conf: Arc<ConfSnapshot>,
    shutdown: Arc<AtomicBool>,
}

impl ReceiveServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ServerSettings,
        cmd: CommandSocket,
        handoff: Arc<Handoff>,
        reply_queue: Arc<FrameQueue>,
        recv_queues: Arc<ReceiveQueues>,
        routes: Arc<RouteTable>,
        stats: Arc<LinkStats>,
        conf: Arc<ConfSnapshot>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx: ServerContext {
                settings,
                cmd,
                recv_queues,
                routes,
                stats,
            },
            conns: Vec::new(),
            handoff,
            reply_queue,
            conf,
            shutdown,
        }
    }

    pub fn run(mut self) {
        let index = self.ctx.settings.index;
        debug!(server = index, "Receive server started");

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.step() {
                warn!(server = index, error = %e, "Receive server wait failed");
                std::thread::sleep(self.ctx.settings.timing.poll_timeout());
            }
        }

        for conn in &mut self.conns {
            conn.closed = Some(TransportError::system("server shutting down"));
        }
        self.reap();
        debug!(server = index, "Receive server stopped");
    }

    fn step(&mut self) -> Result<()> {
        self.route_replies();

        let ready: Vec<(bool, bool)> = {
            let mut fds = Vec::with_capacity(self.conns.len() + 1);
            fds.push(PollFd::new(self.ctx.cmd.as_fd(), PollFlags::POLLIN));
            for conn in &self.conns {
                let mut flags = PollFlags::POLLIN;
                if !conn.send_buf.is_empty() {
                    flags |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(conn.stream.as_fd(), flags));
            }
            event::wait(&mut fds, self.ctx.settings.timing.poll_timeout())?;
            fds.iter()
                .map(|fd| (event::is_readable(fd), event::is_writable(fd)))
                .collect()
        };

        for (conn, &(readable, writable)) in self.conns.iter_mut().zip(&ready[1..]) {
            if readable {
                if let Err(e) = self.ctx.on_readable(conn) {
                    conn.closed = Some(e);
                    continue;
                }
            }
            if writable || !conn.send_buf.is_empty() {
                if let Err(e) = on_writable(conn) {
                    conn.closed = Some(e);
                }
            }
        }

        if ready[0].0 {
            self.drain_commands();
        }
        // Also covers hand-offs whose notification was dropped
        self.accept_handoffs();
        self.close_idle();
        self.reap();
        Ok(())
    }

    fn drain_commands(&mut self) {
        loop {
            let cmd = match self.ctx.cmd.try_recv() {
                Ok(Some(cmd)) => cmd,
                Ok(None) => break,
                Err(e) => {
                    debug!(server = self.ctx.settings.index, error = %e, "Command socket error");
                    break;
                }
            };
            match cmd {
                // Hand-offs and replies are picked up on every pass
                Command::AddConnection | Command::SendAll | Command::Shutdown => {}
                Command::QueryRecvStat { reply_to } => self
                    .ctx
                    .cmd
                    .reply(&reply_to, &Command::RecvStatReply(self.ctx.stats.snapshot())),
                Command::QueryConf { reply_to } => self
                    .ctx
                    .cmd
                    .reply(&reply_to, &Command::ConfReply(self.conf.as_ref().clone())),
                other => debug!(
                    server = self.ctx.settings.index,
                    command = ?other,
                    "Ignoring command"
                ),
            }
        }
    }

    fn accept_handoffs(&mut self) {
        while let Some((stream, peer)) = self.handoff.pop() {
            info!(server = self.ctx.settings.index, peer = %peer, "Accepted connection");
            self.ctx.stats.connection_opened();
            self.conns.push(Connection {
                stream,
                peer,
                send_buf: SnapBuffer::new(self.ctx.settings.send_buffer_size),
                recv_buf: SnapBuffer::new(self.ctx.settings.recv_buffer_size),
                node_id: None,
                last_read: Instant::now(),
                closed: None,
            });
        }
    }

    /// Move queued replies into the send buffer of the destination link
    fn route_replies(&mut self) {
        let local = self.ctx.settings.node_id;
        for frame in self.reply_queue.mpop(REPLY_BATCH) {
            let dest = frame.node_id();
            let conn = self
                .conns
                .iter_mut()
                .find(|c| c.closed.is_none() && c.node_id == Some(dest));
            let Some(conn) = conn else {
                self.ctx.stats.record_drop();
                debug!(
                    server = self.ctx.settings.index,
                    node_id = dest,
                    "No link for reply, dropping"
                );
                continue;
            };
            // The peer sees the replying node as the origin
            let out = Frame::application(frame.msg_type(), local, frame.payload().clone());
            if !conn.send_buf.append_frame(&out) {
                self.ctx.stats.record_drop();
                debug!(node_id = dest, "Send buffer full, dropping reply");
            } else {
                self.ctx.stats.record_sent(1);
            }
        }
    }

    fn close_idle(&mut self) {
        let idle = self.ctx.settings.timing.idle_timeout();
        let now = Instant::now();
        for conn in &mut self.conns {
            if conn.closed.is_none() && now.duration_since(conn.last_read) >= idle {
                conn.closed = Some(TransportError::timeout(
                    "idle connection",
                    idle.as_millis() as u64,
                ));
            }
        }
    }

    /// Drop closed connections and the routes they held
    fn reap(&mut self) {
        let index = self.ctx.settings.index;
        let mut i = 0;
        while i < self.conns.len() {
            let Some(reason) = self.conns[i].closed.take() else {
                i += 1;
                continue;
            };
            let conn = self.conns.swap_remove(i);
            let _ = conn.stream.shutdown(Shutdown::Both);
            self.ctx.stats.connection_closed();
            warn!(
                server = index,
                peer = %conn.peer,
                node_id = ?conn.node_id,
                category = reason.category(),
                "Connection closed: {}",
                reason
            );

            if let Some(node) = conn.node_id {
                self.ctx.routes.unlink(node, index);
            }
        }
    }
}

impl ServerContext {
    fn on_readable(&self, conn: &mut Connection) -> Result<()> {
        let parse_limit = conn.recv_buf.capacity().saturating_sub(HEADER_SIZE);
        loop {
            match conn.recv_buf.fill_from(&mut conn.stream) {
                Ok(n) => {
                    conn.last_read = Instant::now();
                    trace!(peer = %conn.peer, bytes = n, "Read");
                }
                Err(e) if e.is_would_block() => return Ok(()),
                Err(BufferError::Closed) => {
                    return Err(TransportError::connection(
                        "peer closed the link",
                        Some(conn.peer),
                    ))
                }
                Err(e) => {
                    return Err(TransportError::connection_with_source(
                        "read failed",
                        Some(conn.peer),
                        e,
                    ))
                }
            }

            while let Some(frame) = conn.recv_buf.next_frame(parse_limit)? {
                self.handle_frame(conn, frame)?;
            }
        }
    }

    fn handle_frame(&self, conn: &mut Connection, frame: Frame) -> Result<()> {
        let index = self.settings.index;
        self.stats.record_recv();

        if !frame.is_system() {
            if conn.node_id != Some(frame.node_id()) {
                self.stats.record_drop();
                debug!(
                    server = index,
                    peer = %conn.peer,
                    node_id = frame.node_id(),
                    authenticated = ?conn.node_id,
                    "Frame from unauthenticated origin, dropping"
                );
                return Ok(());
            }
            if let Err(e) = self.recv_queues.dispatch(frame, &self.cmd, index) {
                self.stats.record_drop();
                debug!(server = index, error = %e, "Dropped inbound frame");
            }
            return Ok(());
        }

        match SysMessageType::from_wire(frame.msg_type()) {
            Ok(SysMessageType::KeepaliveRequest) => {
                self.queue_system(conn, Frame::keepalive_response(self.settings.node_id));
            }
            Ok(SysMessageType::KeepaliveResponse) => {
                trace!(server = index, peer = %conn.peer, "Keepalive response");
            }
            Ok(SysMessageType::LinkAuthRequest) => {
                let request = LinkAuthRequest::decode(frame.payload())?;
                let accepted =
                    request.matches(&self.settings.auth.username, &self.settings.auth.password);
                // A repeated request replaces whatever the link held before
                if let Some(previous) = conn.node_id.take() {
                    self.routes.unlink(previous, index);
                }
                if accepted {
                    conn.node_id = Some(request.node_id());
                    self.routes.link(request.node_id(), index);
                    info!(
                        server = index,
                        peer = %conn.peer,
                        node_id = request.node_id(),
                        "Peer authenticated"
                    );
                } else {
                    self.stats.record_error();
                    warn!(
                        server = index,
                        peer = %conn.peer,
                        node_id = request.node_id(),
                        "Rejected credentials"
                    );
                }
                self.queue_system(conn, Frame::auth_response(self.settings.node_id, accepted));
            }
            Ok(kind) => {
                self.stats.record_error();
                warn!(server = index, kind = ?kind, "Unexpected system message");
            }
            Err(e) => {
                self.stats.record_error();
                warn!(server = index, error = %e, "Unknown system message");
            }
        }
        Ok(())
    }

    fn queue_system(&self, conn: &mut Connection, frame: Frame) {
        if !conn.send_buf.append_frame(&frame) {
            self.stats.record_drop();
            warn!(peer = %conn.peer, "Send buffer full, dropping system frame");
        }
    }
}

fn on_writable(conn: &mut Connection) -> Result<()> {
    let written = conn
        .send_buf
        .drain_to(&mut conn.stream)
        .map_err(|e| TransportError::connection_with_source("write failed", Some(conn.peer), e))?;
    if written > 0 {
        trace!(peer = %conn.peer, bytes = written, "Wrote");
    }
    Ok(())
}
