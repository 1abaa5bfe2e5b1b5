//! Frame queues and the receive-queue set shared with the worker pool

use super::ring::BoundedQueue;
use crate::command::{Command, CommandSocket};
use crate::error::{Result, TransportError};
use linkmq_codec::{Frame, HEADER_SIZE};
use linkmq_config::QueueConfig;
use rand::Rng;
use std::ops::Range;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Bounded queue of frames with a per-slot size limit
#[derive(Debug)]
pub struct FrameQueue {
    ring: BoundedQueue<Frame>,
    slot_size: usize,
}

impl FrameQueue {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        if config.slot_size <= HEADER_SIZE {
            return Err(TransportError::configuration(
                format!(
                    "slot size {} cannot hold a {}-byte header",
                    config.slot_size, HEADER_SIZE
                ),
                Some("slot_size"),
            ));
        }
        Ok(Self {
            ring: BoundedQueue::new(config.capacity)?,
            slot_size: config.slot_size,
        })
    }

    /// Largest encoded frame accepted
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Largest payload accepted
    pub fn max_payload(&self) -> usize {
        self.slot_size - HEADER_SIZE
    }

    /// Push a frame; oversized frames and full queues are rejected
    pub fn push(&self, frame: Frame) -> Result<()> {
        let len = frame.encoded_len();
        if len > self.slot_size {
            return Err(TransportError::resource_exhausted(
                "queue slot",
                format!("frame of {} bytes exceeds slot size {}", len, self.slot_size),
            ));
        }
        self.ring.push(frame).map_err(|_| {
            TransportError::resource_exhausted(
                "queue capacity",
                format!("all {} slots in use", self.ring.capacity()),
            )
        })
    }

    pub fn pop(&self) -> Option<Frame> {
        self.ring.pop()
    }

    pub fn mpop(&self, max_n: usize) -> Vec<Frame> {
        self.ring.mpop(max_n)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Receive queues partitioned across workers
///
/// Queue `i` belongs to worker `i / queues_per_worker`; the owner is told
/// about new frames through its command socket.
#[derive(Debug)]
pub struct ReceiveQueues {
    queues: Vec<FrameQueue>,
    queues_per_worker: usize,
    worker_sockets: Vec<PathBuf>,
}

impl ReceiveQueues {
    pub fn new(
        config: &QueueConfig,
        queues_per_worker: usize,
        worker_sockets: Vec<PathBuf>,
    ) -> Result<Self> {
        if worker_sockets.is_empty() || queues_per_worker == 0 {
            return Err(TransportError::configuration(
                "receive queues need at least one worker and one queue per worker",
                Some("work_threads"),
            ));
        }
        let count = worker_sockets.len() * queues_per_worker;
        let queues = (0..count)
            .map(|_| FrameQueue::new(config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            queues,
            queues_per_worker,
            worker_sockets,
        })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queue(&self, index: usize) -> Option<&FrameQueue> {
        self.queues.get(index)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_sockets.len()
    }

    pub fn owner_of(&self, queue_index: usize) -> usize {
        queue_index / self.queues_per_worker
    }

    /// Queue indices owned by `worker`
    pub fn owned_by(&self, worker: usize) -> Range<usize> {
        let start = worker * self.queues_per_worker;
        start..(start + self.queues_per_worker).min(self.queues.len())
    }

    /// Push an application frame onto a random queue and wake its worker
    ///
    /// Returns the queue index used. A rejected frame is dropped and the
    /// error returned for accounting.
    pub fn dispatch(&self, frame: Frame, notifier: &CommandSocket, origin: usize) -> Result<usize> {
        let index = rand::thread_rng().gen_range(0..self.queues.len());
        self.queues[index].push(frame)?;

        let worker = self.owner_of(index);
        let command = Command::ProcessQueue {
            origin,
            queue_index: index,
            num: 1,
        };
        match notifier.send(&self.worker_sockets[worker], &command) {
            Ok(true) => trace!(queue = index, worker, "Signalled worker"),
            Ok(false) => debug!(
                queue = index,
                worker,
                "Worker command socket busy, relying on sweep"
            ),
            Err(e) => debug!(queue = index, worker, error = %e, "Failed to signal worker"),
        }
        Ok(index)
    }
}
