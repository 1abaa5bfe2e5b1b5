//! # linkmq Wire Codec
//!
//! ## Purpose
//!
//! Byte-level rules shared by both ends of a link:
//! - the fixed 15-byte big-endian frame header and its sentinel check
//! - system sub-messages (link authentication, keepalive)
//! - `Frame` values that move through queues without copying payloads
//! - `SnapBuffer`, the cursor-based arena used for partial socket I/O
//!
//! ## Architecture Role
//!
//! ```text
//! producer bytes → [Frame] → send queue → [SnapBuffer] → socket
//!                                                          ↓
//! handler ← receive queue ← [Frame] ← [SnapBuffer] ← socket
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management, threads or queues (belongs in linkmq-network)
//! - Configuration loading (belongs in linkmq-config)
//!
//! ## Integrity
//!
//! The header `checksum` is a fixed sentinel, not a digest. It detects stream
//! desynchronization; payload integrity relies on TCP.

pub mod buffers;
pub mod constants;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;

pub use buffers::{BufferError, SnapBuffer};
pub use constants::*;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{decode_frame, Frame};
pub use header::{parse_header, MessageClass, WireHeader};
pub use message::{LinkAuthRequest, LinkAuthResponse, SysMessageType};
