//! Link Transport Infrastructure
//!
//! Threads, queues and sockets that move framed messages between a sending
//! daemon and a receiving daemon over plain TCP.
//!
//! ```text
//! submit() → send queue → sender session ══TCP══ receive server → receive queue → worker → handler
//!                               ▲                      │
//!                               └──── reply path ◄─────┘
//! ```
//!
//! Every thread owns a Unix datagram command socket used for wake-ups and
//! statistics queries. Data only ever moves through [`queue::BoundedQueue`].

pub mod command;
pub mod error;
pub mod event;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use command::{query, socket_path, Command, CommandSocket, SocketRole};
pub use error::{Result, TransportError};
pub use queue::{BoundedQueue, FrameQueue, ReceiveQueues};
pub use receiver::RecvDaemon;
pub use registry::{Dispatch, HandlerRegistry, MessageHandler};
pub use sender::{KeepaliveState, LinkState, SendDaemon};
pub use stats::{ConfSnapshot, LinkStats, ProcStatSnapshot, RecvStatSnapshot, WorkerStats};
pub use worker::WorkerPool;
