//! Receiving daemon: listener, receive servers and the worker pool

use super::listener::{Handoff, Listener, ServerInbox, HANDOFF_CAPACITY};
use super::routes::RouteTable;
use super::server::{ReceiveServer, ServerSettings};
use crate::command::{socket_path, Command, CommandSocket, SocketRole};
use crate::error::{Result, TransportError};
use crate::queue::{FrameQueue, ReceiveQueues};
use crate::registry::{HandlerRegistry, MessageHandler};
use crate::stats::{ConfSnapshot, LinkStats, ProcStatSnapshot, RecvStatSnapshot};
use crate::worker::WorkerPool;
use bytes::Bytes;
use linkmq_codec::{Frame, TYPE_MAX};
use linkmq_config::RecvConfig;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub struct RecvDaemon {
    config: RecvConfig,
    registry: Option<HandlerRegistry>,
    routes: Arc<RouteTable>,
    reply_queues: Vec<Arc<FrameQueue>>,
    stats: Vec<Arc<LinkStats>>,
    threads: Vec<JoinHandle<()>>,
    workers: Option<WorkerPool>,
    local_addr: Option<SocketAddr>,
    notifier: CommandSocket,
    shutdown: Arc<AtomicBool>,
    started: bool,
}

impl RecvDaemon {
    pub fn new(config: RecvConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;

        let reply_queues = (0..config.recv_threads)
            .map(|_| FrameQueue::new(&config.reply_queue).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let stats = (0..config.recv_threads)
            .map(|_| Arc::new(LinkStats::default()))
            .collect();

        Ok(Self {
            config,
            registry: Some(HandlerRegistry::new()),
            routes: Arc::new(RouteTable::new()),
            reply_queues,
            stats,
            threads: Vec::new(),
            workers: None,
            local_addr: None,
            notifier: CommandSocket::unbound()?,
            shutdown: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    pub fn config(&self) -> &RecvConfig {
        &self.config
    }

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

    /// Bind the listen port and spawn every thread
    ///
    /// Port 0 picks a free port; see [`RecvDaemon::local_addr`].
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(TransportError::system("receive daemon already started"));
        }
        let config = &self.config;
        let addr = config
            .listen_socket_addr()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), Some("bind_addr")))?;
        let listener = TcpListener::bind(addr).map_err(|e| {
            TransportError::network_with_source(format!("Failed to bind {}", addr), e)
        })?;
        let local_addr = listener.local_addr()?;
        let registry = self
            .registry
            .take()
            .ok_or_else(|| TransportError::system("handler registry already consumed"))?;

        let worker_paths: Vec<PathBuf> = (0..config.work_threads)
            .map(|i| socket_path(&config.work_dir, &config.name, SocketRole::RecvWorker, i))
            .collect();
        let worker_sockets = worker_paths
            .iter()
            .map(|p| CommandSocket::bind(p))
            .collect::<Result<Vec<_>>>()?;
        let recv_queues = Arc::new(ReceiveQueues::new(
            &config.recv_queue,
            config.queues_per_worker,
            worker_paths,
        )?);

        let conf = Arc::new(ConfSnapshot {
            name: config.name.clone(),
            node_id: config.node_id,
            port: local_addr.port(),
            link_threads: config.recv_threads,
            work_threads: config.work_threads,
            recv_queue_count: recv_queues.len(),
            queue_capacity: config.recv_queue.capacity,
            slot_size: config.recv_queue.slot_size,
        });

        self.workers = Some(WorkerPool::spawn(
            &config.name,
            worker_sockets,
            recv_queues.clone(),
            Arc::new(registry),
            config.timing.poll_timeout(),
            self.shutdown.clone(),
        )?);

        let mut inboxes = Vec::with_capacity(config.recv_threads);
        for (index, reply_queue) in self.reply_queues.iter().enumerate() {
            let path = socket_path(&config.work_dir, &config.name, SocketRole::RecvServer, index);
            let handoff = Arc::new(Handoff::new(HANDOFF_CAPACITY)?);
            let settings = ServerSettings {
                index,
                node_id: config.node_id,
                auth: config.auth.clone(),
                timing: config.timing,
                send_buffer_size: config.send_buffer_size,
                recv_buffer_size: config.recv_buffer_size,
            };
            let server = ReceiveServer::new(
                settings,
                CommandSocket::bind(&path)?,
                handoff.clone(),
                reply_queue.clone(),
                recv_queues.clone(),
                self.routes.clone(),
                self.stats[index].clone(),
                conf.clone(),
                self.shutdown.clone(),
            );
            let thread = thread::Builder::new()
                .name(format!("{}-svr-{}", config.name, index))
                .spawn(move || server.run())?;
            self.threads.push(thread);
            inboxes.push(ServerInbox {
                handoff,
                socket: path,
            });
        }

        let listener_path = socket_path(&config.work_dir, &config.name, SocketRole::Listener, 0);
        let listener = Listener::new(
            listener,
            CommandSocket::bind(&listener_path)?,
            inboxes,
            conf,
            config.timing.poll_timeout(),
            self.shutdown.clone(),
        )?;
        let thread = thread::Builder::new()
            .name(format!("{}-lsn", config.name))
            .spawn(move || listener.run())?;
        self.threads.push(thread);

        self.local_addr = Some(local_addr);
        self.started = true;
        info!(
            name = %config.name,
            addr = %local_addr,
            servers = config.recv_threads,
            workers = config.work_threads,
            queues = recv_queues.len(),
            "Receive daemon started"
        );
        Ok(())
    }

    /// Bound listen address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Send an application frame back to an authenticated node
    pub fn reply(&self, node_id: u32, msg_type: u16, payload: impl Into<Bytes>) -> Result<()> {
        if msg_type >= TYPE_MAX {
            return Err(TransportError::protocol(format!(
                "message type {} must be below {}",
                msg_type, TYPE_MAX
            )));
        }
        let server = self.routes.server_for(node_id).ok_or_else(|| {
            TransportError::connection(format!("node {} has no authenticated link", node_id), None)
        })?;

        // Header carries the destination until the server re-stamps it
        let frame = Frame::application(msg_type, node_id, payload);
        if let Err(e) = self.reply_queues[server].push(frame) {
            self.stats[server].record_drop();
            return Err(e);
        }
        match self.notifier.send(&self.server_socket(server), &Command::SendAll) {
            Ok(true) => {}
            Ok(false) => debug!(server, "Server command socket busy"),
            Err(e) => debug!(server, error = %e, "Failed to signal server"),
        }
        Ok(())
    }

    /// Whether `node_id` currently has an authenticated link
    pub fn is_connected(&self, node_id: u32) -> bool {
        self.routes.contains(node_id)
    }

    /// Authenticated links currently held for `node_id`
    pub fn link_count(&self, node_id: u32) -> usize {
        self.routes.link_count(node_id)
    }

    /// Open connections across all servers, authenticated or not
    pub fn connection_count(&self) -> u64 {
        self.stats.iter().map(|s| s.connections()).sum()
    }

    pub fn link_stats(&self) -> RecvStatSnapshot {
        self.stats
            .iter()
            .fold(RecvStatSnapshot::default(), |acc, s| acc.merge(&s.snapshot()))
    }

    pub fn proc_stats(&self) -> ProcStatSnapshot {
        self.workers
            .as_ref()
            .map(WorkerPool::snapshot)
            .unwrap_or_default()
    }

    pub fn server_socket(&self, index: usize) -> PathBuf {
        socket_path(
            &self.config.work_dir,
            &self.config.name,
            SocketRole::RecvServer,
            index,
        )
    }

    pub fn worker_socket(&self, index: usize) -> PathBuf {
        socket_path(
            &self.config.work_dir,
            &self.config.name,
            SocketRole::RecvWorker,
            index,
        )
    }

    pub fn listener_socket(&self) -> PathBuf {
        socket_path(&self.config.work_dir, &self.config.name, SocketRole::Listener, 0)
    }

    pub fn shutdown(&mut self) {
        if !self.started || self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.config.name, "Shutting down receive daemon");

        let mut targets: Vec<PathBuf> = (0..self.reply_queues.len())
            .map(|i| self.server_socket(i))
            .collect();
        targets.push(self.listener_socket());
        if let Some(workers) = &self.workers {
            targets.extend((0..workers.len()).map(|i| self.worker_socket(i)));
        }
        for target in &targets {
            let _ = self.notifier.send(target, &Command::Shutdown);
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("Receive thread panicked");
            }
        }
        if let Some(workers) = &mut self.workers {
            workers.join();
        }
    }
}

impl Drop for RecvDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
