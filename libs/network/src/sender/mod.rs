//! Sending side: one TCP link per session thread

pub mod daemon;
pub mod session;

pub use daemon::SendDaemon;
pub use session::{KeepaliveState, LinkState, SenderSession, SessionSettings, SharedLinkState};
