//! # linkmq Configuration
//!
//! Configuration for the link daemons: the sending side (`SendConfig`) and the
//! receiving side (`RecvConfig`), plus the defaults both fall back to.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use linkmq_config::SendConfig;
//! use std::path::Path;
//!
//! let config = SendConfig::load(Path::new("config/send.toml"))?;
//! let remote = config.remote_socket_addr()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod link_config;

pub use link_config::{AuthConfig, QueueConfig, RecvConfig, SendConfig, TimingConfig};
