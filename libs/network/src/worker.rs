//! Worker pool
//!
//! Workers are stateless threads that drain receive queues and call the
//! registered handler for each frame. A worker sleeps on its command socket;
//! `ProcessQueue` wakes it for one queue, and a quiet poll interval makes it
//! sweep every queue it owns so a lost notification only delays a frame.

use crate::command::{Command, CommandSocket};
use crate::error::Result;
use crate::queue::ReceiveQueues;
use crate::registry::{Dispatch, HandlerRegistry};
use crate::stats::{ProcStatSnapshot, WorkerStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Frames popped per batch
pub const WORKER_CHUNK: usize = 32;

/// One worker thread's state
pub struct Worker {
    index: usize,
    socket: CommandSocket,
    queues: Arc<ReceiveQueues>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<WorkerStats>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        index: usize,
        socket: CommandSocket,
        queues: Arc<ReceiveQueues>,
        registry: Arc<HandlerRegistry>,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            socket,
            queues,
            registry,
            stats: Arc::new(WorkerStats::default()),
            poll_timeout,
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn run(self) {
        debug!(worker = self.index, "Worker started");
        while !self.shutdown.load(Ordering::Acquire) {
            match self.socket.recv_timeout(self.poll_timeout) {
                Ok(Some(cmd)) => self.handle_command(cmd),
                Ok(None) => self.sweep(),
                Err(e) => {
                    warn!(worker = self.index, error = %e, "Command socket error");
                    thread::sleep(self.poll_timeout);
                }
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::ProcessQueue { queue_index, .. } => {
                self.process_queue(queue_index);
            }
            Command::QueryProcStat { reply_to } => {
                self.socket
                    .reply(&reply_to, &Command::ProcStatReply(self.stats.snapshot()));
            }
            Command::Shutdown => {}
            other => debug!(worker = self.index, command = ?other, "Ignoring command"),
        }
    }

    /// Process every queue this worker owns
    fn sweep(&self) {
        for queue_index in self.queues.owned_by(self.index) {
            self.process_queue(queue_index);
        }
    }

    /// Drain `queue_index`, returning the number of frames taken
    pub fn process_queue(&self, queue_index: usize) -> usize {
        let Some(queue) = self.queues.queue(queue_index) else {
            warn!(worker = self.index, queue = queue_index, "No such receive queue");
            return 0;
        };

        let mut taken = 0;
        loop {
            let batch = queue.mpop(WORKER_CHUNK);
            if batch.is_empty() {
                break;
            }
            taken += batch.len();
            for frame in batch {
                match self.registry.dispatch(&frame) {
                    Dispatch::Handled => self.stats.record_processed(),
                    Dispatch::Unregistered => {
                        self.stats.record_drop();
                        trace!(
                            worker = self.index,
                            msg_type = frame.msg_type(),
                            "No handler registered, dropping"
                        );
                    }
                    Dispatch::Failed(e) => {
                        self.stats.record_error();
                        warn!(
                            worker = self.index,
                            msg_type = frame.msg_type(),
                            node_id = frame.node_id(),
                            "Handler failed: {:#}",
                            e
                        );
                    }
                }
            }
        }
        taken
    }
}

/// Running worker threads with their shared counters
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
}

impl WorkerPool {
    /// Start one worker per socket; socket `i` belongs to worker `i`
    pub fn spawn(
        thread_prefix: &str,
        sockets: Vec<CommandSocket>,
        queues: Arc<ReceiveQueues>,
        registry: Arc<HandlerRegistry>,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(sockets.len());
        let mut stats = Vec::with_capacity(sockets.len());

        for (index, socket) in sockets.into_iter().enumerate() {
            let worker = Worker::new(
                index,
                socket,
                queues.clone(),
                registry.clone(),
                poll_timeout,
                shutdown.clone(),
            );
            stats.push(worker.stats());
            let handle = thread::Builder::new()
                .name(format!("{}-wrk-{}", thread_prefix, index))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }

        info!(workers = handles.len(), queues = queues.len(), "Worker pool started");
        Ok(Self { handles, stats })
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Counters summed over all workers
    pub fn snapshot(&self) -> ProcStatSnapshot {
        self.stats
            .iter()
            .fold(ProcStatSnapshot::default(), |acc, s| acc.merge(&s.snapshot()))
    }

    /// Wait for all workers; the shutdown flag must already be set
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}
