//! Link Configuration Module
//!
//! Configuration for the sending and receiving daemons. Values come from a
//! TOML file layered with `LINKMQ_`-prefixed environment variables
//! (`LINKMQ_SEND_THREADS=4`, `LINKMQ_TIMING__KEEPALIVE_INTERVAL_MS=500`).

use crate::defaults::{endpoint, sizing, timing, ENV_PREFIX};
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use linkmq_codec::{HEADER_SIZE, PASSWORD_LEN, USERNAME_LEN};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Link credentials checked during authentication
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "linkmq".to_string(),
            password: "linkmq".to_string(),
        }
    }
}

/// Queue sizing
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Slot count, power of two
    pub capacity: usize,
    /// Largest encoded frame (header + payload) one slot accepts
    pub slot_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: sizing::QUEUE_CAPACITY,
            slot_size: sizing::SLOT_SIZE,
        }
    }
}

impl QueueConfig {
    /// Largest payload that fits a slot
    pub fn max_payload(&self) -> usize {
        self.slot_size.saturating_sub(HEADER_SIZE)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            bail!(
                "{}.capacity must be a non-zero power of two, got {}",
                section,
                self.capacity
            );
        }
        if self.slot_size <= HEADER_SIZE {
            bail!(
                "{}.slot_size must exceed the {}-byte frame header, got {}",
                section,
                HEADER_SIZE,
                self.slot_size
            );
        }
        Ok(())
    }
}

/// Timers, all in milliseconds
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub reconnect_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: timing::RECONNECT_INTERVAL_MS,
            keepalive_interval_ms: timing::KEEPALIVE_INTERVAL_MS,
            poll_timeout_ms: timing::POLL_TIMEOUT_MS,
            connect_timeout_ms: timing::CONNECT_TIMEOUT_MS,
            idle_timeout_ms: timing::IDLE_TIMEOUT_MS,
        }
    }
}

impl TimingConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                bail!("timing.{} must be greater than zero", name);
            }
        }
        if self.poll_timeout_ms > u64::from(u16::MAX) {
            bail!(
                "timing.poll_timeout_ms must not exceed {}, got {}",
                u16::MAX,
                self.poll_timeout_ms
            );
        }
        Ok(())
    }
}

/// Sending daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SendConfig {
    /// Local node id stamped on every outbound frame
    pub node_id: u32,
    /// Daemon name, used in command socket paths
    pub name: String,
    /// Directory holding the command sockets
    pub work_dir: PathBuf,
    pub remote_addr: String,
    pub remote_port: u16,
    pub auth: AuthConfig,
    /// Sender sessions, one TCP link each
    pub send_threads: usize,
    /// Workers handling frames the peer sends back
    pub work_threads: usize,
    pub send_queue: QueueConfig,
    pub recv_queue: QueueConfig,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub timing: TimingConfig,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            name: "linkmq-send".to_string(),
            work_dir: PathBuf::from(endpoint::WORK_DIR),
            remote_addr: endpoint::REMOTE_ADDR.to_string(),
            remote_port: endpoint::PORT,
            auth: AuthConfig::default(),
            send_threads: 1,
            work_threads: 1,
            send_queue: QueueConfig::default(),
            recv_queue: QueueConfig::default(),
            send_buffer_size: sizing::BUFFER_SIZE,
            recv_buffer_size: sizing::BUFFER_SIZE,
            timing: TimingConfig::default(),
        }
    }
}

impl SendConfig {
    /// Load from a TOML file with environment overrides, expand, validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_layered(path)?;
        config.work_dir = expand_path(&config.work_dir)?;
        config.validate()?;
        info!(
            name = %config.name,
            node_id = config.node_id,
            remote = %format!("{}:{}", config.remote_addr, config.remote_port),
            "Loaded send configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = parse_toml(contents)?;
        config.work_dir = expand_path(&config.work_dir)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the remote endpoint
    pub fn remote_socket_addr(&self) -> Result<SocketAddr> {
        resolve(&self.remote_addr, self.remote_port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_auth(&self.auth)?;
        if self.send_threads == 0 {
            bail!("send_threads must be at least 1");
        }
        if self.work_threads == 0 {
            bail!("work_threads must be at least 1");
        }
        self.send_queue.validate("send_queue")?;
        self.recv_queue.validate("recv_queue")?;
        validate_buffer("send_buffer_size", self.send_buffer_size, &self.send_queue)?;
        validate_buffer("recv_buffer_size", self.recv_buffer_size, &self.recv_queue)?;
        self.timing.validate()
    }
}

/// Receiving daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RecvConfig {
    /// Local node id carried in keepalive and auth responses
    pub node_id: u32,
    pub name: String,
    pub work_dir: PathBuf,
    pub bind_addr: String,
    pub port: u16,
    /// Credentials every peer must present
    pub auth: AuthConfig,
    /// Receive servers, each multiplexing many connections
    pub recv_threads: usize,
    pub work_threads: usize,
    /// Receive queues owned by each worker
    pub queues_per_worker: usize,
    pub recv_queue: QueueConfig,
    /// Frames waiting to be sent back to connected peers
    pub reply_queue: QueueConfig,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub timing: TimingConfig,
}

impl Default for RecvConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            name: "linkmq-recv".to_string(),
            work_dir: PathBuf::from(endpoint::WORK_DIR),
            bind_addr: endpoint::BIND_ADDR.to_string(),
            port: endpoint::PORT,
            auth: AuthConfig::default(),
            recv_threads: 1,
            work_threads: 1,
            queues_per_worker: sizing::RECV_QUEUES_PER_WORKER,
            recv_queue: QueueConfig::default(),
            reply_queue: QueueConfig::default(),
            send_buffer_size: sizing::BUFFER_SIZE,
            recv_buffer_size: sizing::BUFFER_SIZE,
            timing: TimingConfig::default(),
        }
    }
}

impl RecvConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_layered(path)?;
        config.work_dir = expand_path(&config.work_dir)?;
        config.validate()?;
        info!(
            name = %config.name,
            node_id = config.node_id,
            listen = %format!("{}:{}", config.bind_addr, config.port),
            "Loaded receive configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = parse_toml(contents)?;
        config.work_dir = expand_path(&config.work_dir)?;
        config.validate()?;
        Ok(config)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        resolve(&self.bind_addr, self.port)
    }

    /// Total receive queues across all workers
    pub fn recv_queue_count(&self) -> usize {
        self.work_threads * self.queues_per_worker
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_auth(&self.auth)?;
        if self.recv_threads == 0 {
            bail!("recv_threads must be at least 1");
        }
        if self.work_threads == 0 {
            bail!("work_threads must be at least 1");
        }
        if self.queues_per_worker == 0 {
            bail!("queues_per_worker must be at least 1");
        }
        self.recv_queue.validate("recv_queue")?;
        self.reply_queue.validate("reply_queue")?;
        validate_buffer("send_buffer_size", self.send_buffer_size, &self.reply_queue)?;
        validate_buffer("recv_buffer_size", self.recv_buffer_size, &self.recv_queue)?;
        self.timing.validate()
    }
}

fn load_layered<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Loading link configuration from {:?}", path);

    let config = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build configuration from {:?}", path))?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

fn parse_toml<T: DeserializeOwned>(contents: &str) -> Result<T> {
    toml::from_str(contents).context("Failed to parse TOML configuration")
}

/// Expand `$VAR` and `~` in a configured path
fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw).context("Failed to expand work_dir")?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", host, port))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.contains('/') {
        bail!("name must not contain '/', got {:?}", name);
    }
    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<()> {
    if auth.username.is_empty() || auth.password.is_empty() {
        bail!("auth.username and auth.password must both be set");
    }
    if auth.username.len() > USERNAME_LEN {
        bail!("auth.username exceeds {} bytes", USERNAME_LEN);
    }
    if auth.password.len() > PASSWORD_LEN {
        bail!("auth.password exceeds {} bytes", PASSWORD_LEN);
    }
    Ok(())
}

fn validate_buffer(field: &str, size: usize, queue: &QueueConfig) -> Result<()> {
    if size < queue.slot_size {
        bail!(
            "{} ({}) must hold at least one slot ({} bytes)",
            field,
            size,
            queue.slot_size
        );
    }
    Ok(())
}
