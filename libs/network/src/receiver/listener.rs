//! TCP accept loop
//!
//! Accepted connections are handed to a random receive server through its
//! hand-off queue, followed by an `AddConnection` command.

use crate::command::{Command, CommandSocket};
use crate::error::Result;
use crate::event;
use crate::queue::BoundedQueue;
use crate::stats::ConfSnapshot;
use nix::poll::{PollFd, PollFlags};
use rand::Rng;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pending connections per receive server
pub const HANDOFF_CAPACITY: usize = 256;

pub type Handoff = BoundedQueue<(TcpStream, SocketAddr)>;

/// Where the listener delivers connections for one server
#[derive(Debug, Clone)]
pub struct ServerInbox {
    pub handoff: Arc<Handoff>,
    pub socket: PathBuf,
}

pub struct Listener {
    listener: TcpListener,
    cmd: CommandSocket,
    servers: Vec<ServerInbox>,
    conf: Arc<ConfSnapshot>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(
        listener: TcpListener,
        cmd: CommandSocket,
        servers: Vec<ServerInbox>,
        conf: Arc<ConfSnapshot>,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            cmd,
            servers,
            conf,
            poll_timeout,
            shutdown,
        })
    }

    pub fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, servers = self.servers.len(), "Listening"),
            Err(e) => warn!(error = %e, "Listener has no local address"),
        }

        while !self.shutdown.load(Ordering::Acquire) {
            let (cmd_ready, accept_ready) = {
                let mut fds = [
                    PollFd::new(self.cmd.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                ];
                match event::wait(&mut fds, self.poll_timeout) {
                    Ok(_) => (event::is_readable(&fds[0]), event::is_readable(&fds[1])),
                    Err(e) => {
                        warn!(error = %e, "Listener wait failed");
                        std::thread::sleep(self.poll_timeout);
                        continue;
                    }
                }
            };

            if cmd_ready {
                self.drain_commands();
            }
            if accept_ready {
                self.accept_pending();
            }
        }
        debug!("Listener stopped");
    }

    fn drain_commands(&self) {
        while let Ok(Some(cmd)) = self.cmd.try_recv() {
            match cmd {
                Command::QueryConf { reply_to } => self
                    .cmd
                    .reply(&reply_to, &Command::ConfReply(self.conf.as_ref().clone())),
                Command::Shutdown => {}
                other => debug!(command = ?other, "Listener ignoring command"),
            }
        }
    }

    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.hand_off(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    fn hand_off(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream
            .set_nonblocking(true)
            .and_then(|_| stream.set_nodelay(true))
        {
            warn!(peer = %peer, error = %e, "Failed to configure accepted socket");
            return;
        }

        let index = rand::thread_rng().gen_range(0..self.servers.len());
        let inbox = &self.servers[index];
        if inbox.handoff.push((stream, peer)).is_err() {
            warn!(peer = %peer, server = index, "Hand-off queue full, dropping connection");
            return;
        }
        match self.cmd.send(&inbox.socket, &Command::AddConnection) {
            Ok(true) => debug!(peer = %peer, server = index, "Connection handed off"),
            Ok(false) => debug!(server = index, "Server command socket busy, relying on sweep"),
            Err(e) => warn!(server = index, error = %e, "Failed to signal server"),
        }
    }
}
