//! Protocol-level errors for frame processing
//!
//! Every variant carries enough context to explain which header field was
//! rejected and what the decoder expected instead. Any error raised while
//! decoding a header means the byte stream can no longer be trusted to be
//! aligned on a frame boundary, so callers tear the link down.

use thiserror::Error;

/// Frame parsing and construction errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Header checksum field does not carry the frame sentinel
    #[error("Sentinel mismatch: expected {expected:#010x}, got {actual:#010x} (type {msg_type}, node {node_id}, indicates: {diagnosis})")]
    SentinelMismatch {
        expected: u32,
        actual: u32,
        msg_type: u16,
        node_id: u32,
        diagnosis: String,
    },

    /// Flag byte is neither system nor application
    #[error("Unknown message class flag {flag} (type {msg_type})")]
    UnknownMessageClass { flag: u8, msg_type: u16 },

    /// Message type outside the registry range
    #[error("Message type {msg_type} out of range: must be below {max}")]
    TypeOutOfRange { msg_type: u16, max: u16 },

    /// Declared payload length exceeds what the receiver accepts
    #[error("Payload too large: {size} bytes exceeds limit {limit} (type {msg_type})")]
    PayloadTooLarge {
        size: usize,
        limit: usize,
        msg_type: u16,
    },

    /// A fixed-width text field cannot hold the given value
    #[error("Field '{field}' too long: {len} bytes, maximum {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// System frame with a type this side does not understand
    #[error("Unknown system message type {msg_type}")]
    UnknownSystemMessage { msg_type: u16 },
}

impl ProtocolError {
    /// Create MessageTooSmall error with diagnostic context
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create SentinelMismatch error, guessing at the likely cause
    pub fn sentinel_mismatch(expected: u32, actual: u32, msg_type: u16, node_id: u32) -> Self {
        let diagnosis = match actual {
            0x0000_0000 => "uninitialized buffer",
            0xFFFF_FFFF => "corrupted buffer",
            _ if actual.swap_bytes() == expected => "byte order mismatch",
            _ => "stream desynchronized or peer speaks another protocol",
        };

        Self::SentinelMismatch {
            expected,
            actual,
            msg_type,
            node_id,
            diagnosis: diagnosis.to_string(),
        }
    }

    pub fn unknown_class(flag: u8, msg_type: u16) -> Self {
        Self::UnknownMessageClass { flag, msg_type }
    }

    pub fn type_out_of_range(msg_type: u16, max: u16) -> Self {
        Self::TypeOutOfRange { msg_type, max }
    }

    pub fn payload_too_large(size: usize, limit: usize, msg_type: u16) -> Self {
        Self::PayloadTooLarge {
            size,
            limit,
            msg_type,
        }
    }

    pub fn field_too_long(field: &'static str, len: usize, max: usize) -> Self {
        Self::FieldTooLong { field, len, max }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
