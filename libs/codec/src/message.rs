//! System sub-messages
//!
//! Link control rides inside ordinary frames with `flag = SYS`. The header
//! `type` selects one of the messages below; keepalives carry no payload.

use crate::constants::{PASSWORD_LEN, USERNAME_LEN};
use crate::error::{ProtocolError, ProtocolResult};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Message types valid inside system frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum SysMessageType {
    Unknown = 0,
    LinkAuthRequest = 1,
    LinkAuthResponse = 2,
    KeepaliveRequest = 3,
    KeepaliveResponse = 4,
}

impl SysMessageType {
    pub fn from_wire(msg_type: u16) -> ProtocolResult<Self> {
        Self::try_from(msg_type).map_err(|_| ProtocolError::UnknownSystemMessage { msg_type })
    }
}

/// Link authentication request (52 bytes)
///
/// Text fields are NUL padded; a value filling the whole field has no
/// terminator.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct LinkAuthRequest {
    node_id: U32<BigEndian>,
    username: [u8; USERNAME_LEN],
    password: [u8; PASSWORD_LEN],
}

impl LinkAuthRequest {
    pub const SIZE: usize = 4 + USERNAME_LEN + PASSWORD_LEN;

    pub fn new(node_id: u32, username: &str, password: &str) -> ProtocolResult<Self> {
        Ok(Self {
            node_id: U32::new(node_id),
            username: pad_field::<USERNAME_LEN>("username", username)?,
            password: pad_field::<PASSWORD_LEN>("password", password)?,
        })
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        Self::read_from_prefix(payload).ok_or_else(|| {
            ProtocolError::message_too_small(Self::SIZE, payload.len(), "LinkAuthRequest")
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.get()
    }

    pub fn username(&self) -> &[u8] {
        trim_field(&self.username)
    }

    pub fn password(&self) -> &[u8] {
        trim_field(&self.password)
    }

    /// Compare the carried credentials against the expected pair
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username() == username.as_bytes() && self.password() == password.as_bytes()
    }
}

/// Link authentication response (5 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct LinkAuthResponse {
    node_id: U32<BigEndian>,
    success: u8,
}

impl LinkAuthResponse {
    pub const SIZE: usize = 5;

    pub fn new(node_id: u32, success: bool) -> Self {
        Self {
            node_id: U32::new(node_id),
            success: success as u8,
        }
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        Self::read_from_prefix(payload).ok_or_else(|| {
            ProtocolError::message_too_small(Self::SIZE, payload.len(), "LinkAuthResponse")
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Node id of the responding side
    pub fn node_id(&self) -> u32 {
        self.node_id.get()
    }

    pub fn is_success(&self) -> bool {
        self.success != 0
    }
}

fn pad_field<const N: usize>(field: &'static str, value: &str) -> ProtocolResult<[u8; N]> {
    let bytes = value.as_bytes();
    if bytes.len() > N {
        return Err(ProtocolError::field_too_long(field, bytes.len(), N));
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn trim_field(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}
