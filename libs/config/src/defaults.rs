//! Default values shared by sender and receiver configurations
//!
//! Values mirror the long-standing deployment defaults for the link layer.

/// Link timing defaults
pub mod timing {
    /// Delay between failed connect attempts (milliseconds)
    pub const RECONNECT_INTERVAL_MS: u64 = 2_000;

    /// Idle time before a keepalive request is sent (milliseconds)
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;

    /// Upper bound on one event-loop wait (milliseconds)
    pub const POLL_TIMEOUT_MS: u64 = 1_000;

    /// Synchronous TCP connect timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Receiver closes connections silent for this long (milliseconds)
    pub const IDLE_TIMEOUT_MS: u64 = 60_000;
}

/// Queue and buffer sizing defaults
pub mod sizing {
    /// Slots per queue; must stay a power of two
    pub const QUEUE_CAPACITY: usize = 4096;

    /// Largest encoded frame a queue slot accepts
    pub const SLOT_SIZE: usize = 4096;

    /// Socket snapshot buffer size
    pub const BUFFER_SIZE: usize = 5 * 1024 * 1024;

    /// Receive queues owned by each worker on the receiving side
    pub const RECV_QUEUES_PER_WORKER: usize = 2;

    /// Receive queues owned by each worker on the sending side
    pub const SEND_SIDE_QUEUES_PER_WORKER: usize = 1;
}

/// Addressing defaults
pub mod endpoint {
    pub const REMOTE_ADDR: &str = "127.0.0.1";
    pub const BIND_ADDR: &str = "0.0.0.0";
    pub const PORT: u16 = 28888;
    pub const WORK_DIR: &str = "/tmp/linkmq";
}

/// Environment variable prefix for overrides (`LINKMQ_SEND_THREADS=4`)
pub const ENV_PREFIX: &str = "LINKMQ";
