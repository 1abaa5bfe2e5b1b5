//! Sending daemon: sender sessions, their send queues and the worker pool
//! that handles frames the peer sends back.

use super::session::{LinkState, SenderSession, SessionSettings, SharedLinkState};
use crate::command::{socket_path, Command, CommandSocket, SocketRole};
use crate::error::{Result, TransportError};
use crate::queue::{FrameQueue, ReceiveQueues};
use crate::registry::{HandlerRegistry, MessageHandler};
use crate::stats::{ConfSnapshot, LinkStats, ProcStatSnapshot, RecvStatSnapshot};
use crate::worker::WorkerPool;
use bytes::Bytes;
use linkmq_codec::{Frame, TYPE_MAX};
use linkmq_config::defaults::sizing::SEND_SIDE_QUEUES_PER_WORKER;
use linkmq_config::SendConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

struct SessionHandle {
    state: Arc<SharedLinkState>,
    thread: Option<JoinHandle<()>>,
}

/// Producer-facing handle of the sending side
///
/// ```no_run
/// # use linkmq_config::SendConfig;
/// # use linkmq_network::SendDaemon;
/// # fn main() -> linkmq_network::Result<()> {
/// let mut daemon = SendDaemon::new(SendConfig::default())?;
/// daemon.start()?;
/// daemon.submit(7, b"hello".to_vec())?;
/// daemon.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct SendDaemon {
    config: SendConfig,
    registry: Option<HandlerRegistry>,
    queues: Vec<Arc<FrameQueue>>,
    stats: Vec<Arc<LinkStats>>,
    sessions: Vec<SessionHandle>,
    workers: Option<WorkerPool>,
    next_queue: AtomicUsize,
    notifier: CommandSocket,
    shutdown: Arc<AtomicBool>,
    started: bool,
}

impl SendDaemon {
    pub fn new(config: SendConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;

        let queues = (0..config.send_threads)
            .map(|_| FrameQueue::new(&config.send_queue).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let stats = (0..config.send_threads)
            .map(|_| Arc::new(LinkStats::default()))
            .collect();

        Ok(Self {
            config,
            registry: Some(HandlerRegistry::new()),
            queues,
            stats,
            sessions: Vec::new(),
            workers: None,
            next_queue: AtomicUsize::new(0),
            notifier: CommandSocket::unbound()?,
            shutdown: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    pub fn config(&self) -> &SendConfig {
        &self.config
    }

    /// Handle frames of `msg_type` sent back by the peer
    pub fn register<H>(&mut self, msg_type: u16, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.registry_mut(msg_type)?.register(msg_type, handler)
    }

    pub fn register_default<H>(&mut self, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.registry_mut(TYPE_MAX)?.register_default(handler)
    }

    fn registry_mut(&mut self, msg_type: u16) -> Result<&mut HandlerRegistry> {
        self.registry
            .as_mut()
            .ok_or_else(|| TransportError::registry(msg_type, "registration closed after start"))
    }

    /// Spawn the worker pool and one session per send queue
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(TransportError::system("send daemon already started"));
        }
        let config = &self.config;
        let remote = config
            .remote_socket_addr()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), Some("remote_addr")))?;
        let registry = self
            .registry
            .take()
            .ok_or_else(|| TransportError::system("handler registry already consumed"))?;

        let worker_paths: Vec<PathBuf> = (0..config.work_threads)
            .map(|i| socket_path(&config.work_dir, &config.name, SocketRole::SendWorker, i))
            .collect();
        let worker_sockets = worker_paths
            .iter()
            .map(|p| CommandSocket::bind(p))
            .collect::<Result<Vec<_>>>()?;
        let recv_queues = Arc::new(ReceiveQueues::new(
            &config.recv_queue,
            SEND_SIDE_QUEUES_PER_WORKER,
            worker_paths,
        )?);

        let conf = Arc::new(ConfSnapshot {
            name: config.name.clone(),
            node_id: config.node_id,
            port: config.remote_port,
            link_threads: config.send_threads,
            work_threads: config.work_threads,
            recv_queue_count: recv_queues.len(),
            queue_capacity: config.send_queue.capacity,
            slot_size: config.send_queue.slot_size,
        });

        self.workers = Some(WorkerPool::spawn(
            &config.name,
            worker_sockets,
            recv_queues.clone(),
            Arc::new(registry),
            config.timing.poll_timeout(),
            self.shutdown.clone(),
        )?);

        for (index, queue) in self.queues.iter().enumerate() {
            let path = socket_path(&config.work_dir, &config.name, SocketRole::SendSession, index);
            let settings = SessionSettings {
                index,
                node_id: config.node_id,
                remote,
                auth: config.auth.clone(),
                timing: config.timing,
                send_buffer_size: config.send_buffer_size,
                recv_buffer_size: config.recv_buffer_size,
            };
            let session = SenderSession::new(
                settings,
                CommandSocket::bind(&path)?,
                queue.clone(),
                recv_queues.clone(),
                self.stats[index].clone(),
                conf.clone(),
                self.shutdown.clone(),
            );
            let state = session.shared_state();
            let thread = thread::Builder::new()
                .name(format!("{}-ssn-{}", config.name, index))
                .spawn(move || session.run())?;
            self.sessions.push(SessionHandle {
                state,
                thread: Some(thread),
            });
        }

        self.started = true;
        info!(
            name = %config.name,
            remote = %remote,
            sessions = self.sessions.len(),
            workers = config.work_threads,
            "Send daemon started"
        );
        Ok(())
    }

    /// Frame `payload` and queue it on the next session, round-robin
    ///
    /// A full queue or a payload larger than a slot is reported and the
    /// message dropped; nothing blocks.
    pub fn submit(&self, msg_type: u16, payload: impl Into<Bytes>) -> Result<()> {
        if msg_type >= TYPE_MAX {
            return Err(TransportError::protocol(format!(
                "message type {} must be below {}",
                msg_type, TYPE_MAX
            )));
        }
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let frame = Frame::application(msg_type, self.config.node_id, payload);

        if let Err(e) = self.queues[index].push(frame) {
            self.stats[index].record_drop();
            return Err(e);
        }

        if self.started {
            let path = self.session_socket(index);
            match self.notifier.send(&path, &Command::SendAll) {
                Ok(true) => {}
                Ok(false) => debug!(session = index, "Session command socket busy"),
                Err(e) => debug!(session = index, error = %e, "Failed to signal session"),
            }
        }
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.queues.len()
    }

    pub fn link_state(&self, index: usize) -> Option<LinkState> {
        self.sessions.get(index).map(|s| s.state.load())
    }

    pub fn established_links(&self) -> usize {
        (0..self.sessions.len())
            .filter(|&i| self.link_state(i) == Some(LinkState::Established))
            .count()
    }

    /// Session counters summed over all links
    pub fn link_stats(&self) -> RecvStatSnapshot {
        self.stats
            .iter()
            .fold(RecvStatSnapshot::default(), |acc, s| acc.merge(&s.snapshot()))
    }

    pub fn session_stats(&self, index: usize) -> Option<RecvStatSnapshot> {
        self.stats.get(index).map(|s| s.snapshot())
    }

    pub fn proc_stats(&self) -> ProcStatSnapshot {
        self.workers
            .as_ref()
            .map(WorkerPool::snapshot)
            .unwrap_or_default()
    }

    pub fn session_socket(&self, index: usize) -> PathBuf {
        socket_path(
            &self.config.work_dir,
            &self.config.name,
            SocketRole::SendSession,
            index,
        )
    }

    pub fn worker_socket(&self, index: usize) -> PathBuf {
        socket_path(
            &self.config.work_dir,
            &self.config.name,
            SocketRole::SendWorker,
            index,
        )
    }

    /// Stop every thread and remove the command sockets
    pub fn shutdown(&mut self) {
        if !self.started || self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.config.name, "Shutting down send daemon");

        for index in 0..self.sessions.len() {
            let _ = self.notifier.send(&self.session_socket(index), &Command::Shutdown);
        }
        if let Some(workers) = &self.workers {
            for index in 0..workers.len() {
                let _ = self.notifier.send(&self.worker_socket(index), &Command::Shutdown);
            }
        }

        for session in &mut self.sessions {
            if let Some(thread) = session.thread.take() {
                if thread.join().is_err() {
                    warn!("Sender session thread panicked");
                }
            }
        }
        if let Some(workers) = &mut self.workers {
            workers.join();
        }
    }
}

impl Drop for SendDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
