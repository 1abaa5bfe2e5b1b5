//! Command channel
//!
//! Every long-running thread owns a Unix datagram socket. Other threads (or the
//! `linkd query` tool) wake it on demand with small bincode-encoded commands:
//! "process queue N", "flush the send queue", hand-off notifications and
//! configuration/statistics queries. Data never travels on this channel.
//!
//! Sends are non-blocking: if the receiver's socket buffer is full the
//! notification is dropped and the receiver's periodic sweep picks up the work.

use crate::error::{Result, TransportError};
use crate::event;
use crate::stats::{ConfSnapshot, ProcStatSnapshot, RecvStatSnapshot};
use nix::poll::{PollFd, PollFlags};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Largest encoded command accepted
pub const MAX_COMMAND_SIZE: usize = 4096;

/// Command carried over the local datagram channel
///
/// Queries carry the path replies are sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Drain `queue_index`; `num` frames were just pushed by thread `origin`
    ProcessQueue {
        origin: usize,
        queue_index: usize,
        num: usize,
    },
    /// Data is waiting in the send queue
    SendAll,
    /// A connection is waiting in the hand-off queue
    AddConnection,
    QueryConf { reply_to: PathBuf },
    QueryRecvStat { reply_to: PathBuf },
    QueryProcStat { reply_to: PathBuf },
    ConfReply(ConfSnapshot),
    RecvStatReply(RecvStatSnapshot),
    ProcStatReply(ProcStatSnapshot),
    Shutdown,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Thread kinds that own a command socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    SendSession,
    SendWorker,
    RecvServer,
    RecvWorker,
    Listener,
}

impl SocketRole {
    pub fn tag(&self) -> &'static str {
        match self {
            SocketRole::SendSession => "ssvr",
            SocketRole::SendWorker => "swrk",
            SocketRole::RecvServer => "rsvr",
            SocketRole::RecvWorker => "rwrk",
            SocketRole::Listener => "rlsn",
        }
    }
}

/// `{work_dir}/{name}.{role}.{index}.usck`
pub fn socket_path(work_dir: &Path, name: &str, role: SocketRole, index: usize) -> PathBuf {
    work_dir.join(format!("{}.{}.{}.usck", name, role.tag(), index))
}

/// Datagram socket for sending and receiving commands
#[derive(Debug)]
pub struct CommandSocket {
    socket: UnixDatagram,
    path: Option<PathBuf>,
}

impl CommandSocket {
    /// Bind at `path`, replacing a stale socket file and creating the directory
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::network_with_source("Failed to create socket directory", e)
            })?;
        }
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                TransportError::network_with_source("Failed to remove existing socket", e)
            })?;
        }

        let socket = UnixDatagram::bind(path).map_err(|e| {
            TransportError::network_with_source(format!("Failed to bind {:?}", path), e)
        })?;
        socket.set_nonblocking(true)?;
        debug!("Bound command socket {:?}", path);

        Ok(Self {
            socket,
            path: Some(path.to_path_buf()),
        })
    }

    /// Send-only socket
    pub fn unbound() -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Send `command` to the socket bound at `to`
    ///
    /// Returns `Ok(false)` when the peer's buffer is full and the command was
    /// dropped.
    pub fn send(&self, to: &Path, command: &Command) -> Result<bool> {
        let bytes = command.encode()?;
        match self.socket.send_to(&bytes, to) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(TransportError::network_with_source(
                format!("Failed to send command to {:?}", to),
                e,
            )),
        }
    }

    /// Receive one pending command without waiting
    pub fn try_recv(&self) -> Result<Option<Command>> {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => match Command::decode(&buf[..n]) {
                    Ok(cmd) => return Ok(Some(cmd)),
                    Err(e) => {
                        warn!(bytes = n, error = %e, "Discarding undecodable command");
                        continue;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait up to `timeout` for a command
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Command>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(cmd) = self.try_recv()? {
                return Ok(Some(cmd));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut fds = [PollFd::new(self.as_fd(), PollFlags::POLLIN)];
            if event::wait(&mut fds, remaining)? == 0 && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Send a reply, logging instead of failing when the asker is gone
    pub fn reply(&self, to: &Path, command: &Command) {
        if let Err(e) = self.send(to, command) {
            warn!(error = %e, "Failed to deliver command reply to {:?}", to);
        }
    }
}

impl AsFd for CommandSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl Drop for CommandSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Send a query to `target` and wait for its reply
///
/// `build` receives the temporary reply path and returns the query command.
pub fn query<F>(target: &Path, timeout: Duration, build: F) -> Result<Command>
where
    F: FnOnce(PathBuf) -> Command,
{
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let reply_path = dir.join(format!(
        "query.{}.{}.usck",
        std::process::id(),
        QUERY_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let socket = CommandSocket::bind(&reply_path)?;
    if !socket.send(target, &build(reply_path.clone()))? {
        return Err(TransportError::resource_exhausted(
            "command socket",
            format!("{:?} is not accepting commands", target),
        ));
    }

    socket
        .recv_timeout(timeout)?
        .ok_or_else(|| TransportError::timeout("command query", timeout.as_millis() as u64))
}
