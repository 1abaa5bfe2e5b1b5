//! Frame Header
//!
//! Every frame on a link starts with the same 15-byte header, all multi-byte
//! fields big endian:
//!
//! ```text
//! ┌──────────┬────────────┬────────────┬────────┬──────────────┬──────────────┐
//! │ type:16  │ node_id:32 │ length:32  │ flag:8 │ checksum:32  │ payload ...  │
//! └──────────┴────────────┴────────────┴────────┴──────────────┴──────────────┘
//!   bytes 0-1   bytes 2-5    bytes 6-9    byte 10  bytes 11-14    `length` bytes
//! ```
//!
//! The struct is built from unaligned big-endian zerocopy fields, so it has
//! alignment 1, no padding, and its in-memory image is the wire image.

use crate::constants::{FLAG_SYSTEM, FRAME_SENTINEL, HEADER_SIZE, TYPE_MAX};
use crate::error::{ProtocolError, ProtocolResult};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Message class carried in the header flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageClass {
    /// Link control traffic, consumed by the session itself
    System = 0,
    /// Payload for a registered type handler
    Application = 1,
}

/// Wire header (15 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct WireHeader {
    msg_type: U16<BigEndian>,
    node_id: U32<BigEndian>,
    length: U32<BigEndian>,
    flag: u8,
    checksum: U32<BigEndian>,
}

const _: () = assert!(std::mem::size_of::<WireHeader>() == HEADER_SIZE);

impl WireHeader {
    /// Header size in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Build a header stamped with the frame sentinel
    pub fn new(msg_type: u16, node_id: u32, length: u32, class: MessageClass) -> Self {
        Self {
            msg_type: U16::new(msg_type),
            node_id: U32::new(node_id),
            length: U32::new(length),
            flag: class.into(),
            checksum: U32::new(FRAME_SENTINEL),
        }
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type.get()
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.get()
    }

    /// Payload byte count following the header
    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn checksum(&self) -> u32 {
        self.checksum.get()
    }

    /// Total encoded size: header plus payload
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.length() as usize
    }

    /// Message class, rejecting unknown flag values
    pub fn class(&self) -> ProtocolResult<MessageClass> {
        MessageClass::try_from(self.flag)
            .map_err(|_| ProtocolError::unknown_class(self.flag, self.msg_type()))
    }

    pub fn is_system(&self) -> bool {
        self.flag == FLAG_SYSTEM
    }

    /// Check every field the receiver can verify without the payload
    ///
    /// `max_payload` bounds the declared length; a frame the destination
    /// cannot hold is rejected before its payload is awaited.
    pub fn validate(&self, max_payload: usize) -> ProtocolResult<MessageClass> {
        if self.checksum() != FRAME_SENTINEL {
            return Err(ProtocolError::sentinel_mismatch(
                FRAME_SENTINEL,
                self.checksum(),
                self.msg_type(),
                self.node_id(),
            ));
        }

        let class = self.class()?;

        if self.msg_type() >= TYPE_MAX {
            return Err(ProtocolError::type_out_of_range(self.msg_type(), TYPE_MAX));
        }

        let length = self.length() as usize;
        if length > max_payload {
            return Err(ProtocolError::payload_too_large(
                length,
                max_payload,
                self.msg_type(),
            ));
        }

        Ok(class)
    }

    /// Decode a header from the front of `data` without validating it
    pub fn read_from(data: &[u8]) -> ProtocolResult<Self> {
        Self::read_from_prefix(data)
            .ok_or_else(|| ProtocolError::message_too_small(Self::SIZE, data.len(), "WireHeader"))
    }

    /// Encoded header bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Parse and validate the header at the front of `data`
pub fn parse_header(data: &[u8], max_payload: usize) -> ProtocolResult<WireHeader> {
    let header = WireHeader::read_from(data)?;
    header.validate(max_payload)?;
    Ok(header)
}
