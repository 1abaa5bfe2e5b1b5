//! Link and worker statistics
//!
//! Counters are lock-free atomics shared through `Arc` between the owning
//! thread and the daemon handle. Snapshots are plain serde structs so they can
//! travel over the command channel.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by sender sessions and receive servers
#[derive(Debug, Default)]
pub struct LinkStats {
    connections: AtomicU64,
    recv_total: AtomicU64,
    drop_total: AtomicU64,
    err_total: AtomicU64,
    send_total: AtomicU64,
    reconnects: AtomicU64,
}

impl LinkStats {
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    pub fn record_recv(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drop_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.err_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, frames: u64) {
        self.send_total.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RecvStatSnapshot {
        RecvStatSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            recv_total: self.recv_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
            send_total: self.send_total.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Counters kept by workers
#[derive(Debug, Default)]
pub struct WorkerStats {
    proc_total: AtomicU64,
    drop_total: AtomicU64,
    err_total: AtomicU64,
}

impl WorkerStats {
    pub fn record_processed(&self) {
        self.proc_total.fetch_add(1, Ordering::Relaxed);
    }

    /// No handler registered for the type
    pub fn record_drop(&self) {
        self.drop_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler returned an error
    pub fn record_error(&self) {
        self.err_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcStatSnapshot {
        ProcStatSnapshot {
            proc_total: self.proc_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvStatSnapshot {
    pub connections: u64,
    pub recv_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
    pub send_total: u64,
    pub reconnects: u64,
}

impl RecvStatSnapshot {
    pub fn merge(mut self, other: &RecvStatSnapshot) -> Self {
        self.connections += other.connections;
        self.recv_total += other.recv_total;
        self.drop_total += other.drop_total;
        self.err_total += other.err_total;
        self.send_total += other.send_total;
        self.reconnects += other.reconnects;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStatSnapshot {
    pub proc_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
}

impl ProcStatSnapshot {
    pub fn merge(mut self, other: &ProcStatSnapshot) -> Self {
        self.proc_total += other.proc_total;
        self.drop_total += other.drop_total;
        self.err_total += other.err_total;
        self
    }
}

/// Static view of a daemon's configuration, answered to `QueryConf`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfSnapshot {
    pub name: String,
    pub node_id: u32,
    /// Remote port on the sending side, listen port on the receiving side
    pub port: u16,
    /// Sender sessions or receive servers
    pub link_threads: usize,
    pub work_threads: usize,
    pub recv_queue_count: usize,
    pub queue_capacity: usize,
    pub slot_size: usize,
}
