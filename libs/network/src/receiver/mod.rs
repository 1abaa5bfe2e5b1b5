//! Receiving side: one listener, many connections per server thread

pub mod daemon;
pub mod listener;
pub mod routes;
pub mod server;

pub use daemon::RecvDaemon;
pub use listener::{Listener, ServerInbox};
pub use routes::RouteTable;
pub use server::{ReceiveServer, ServerSettings};
