//! Frames: a header plus its owned payload

use crate::constants::HEADER_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{parse_header, MessageClass, WireHeader};
use crate::message::{LinkAuthRequest, LinkAuthResponse, SysMessageType};
use bytes::{BufMut, Bytes, BytesMut};

/// One header + payload unit
///
/// The payload is reference counted, so frames move through queues
/// without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: WireHeader,
    payload: Bytes,
}

impl Frame {
    /// Pair a payload with a header, fixing up the declared length
    pub fn new(msg_type: u16, node_id: u32, class: MessageClass, payload: Bytes) -> Self {
        let header = WireHeader::new(msg_type, node_id, payload.len() as u32, class);
        Self { header, payload }
    }

    pub fn application(msg_type: u16, node_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(msg_type, node_id, MessageClass::Application, payload.into())
    }

    pub fn system(kind: SysMessageType, node_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(kind.into(), node_id, MessageClass::System, payload.into())
    }

    pub fn auth_request(
        node_id: u32,
        username: &str,
        password: &str,
    ) -> ProtocolResult<Self> {
        let body = LinkAuthRequest::new(node_id, username, password)?;
        Ok(Self::system(
            SysMessageType::LinkAuthRequest,
            node_id,
            body.encode(),
        ))
    }

    pub fn auth_response(node_id: u32, success: bool) -> Self {
        Self::system(
            SysMessageType::LinkAuthResponse,
            node_id,
            LinkAuthResponse::new(node_id, success).encode(),
        )
    }

    pub fn keepalive_request(node_id: u32) -> Self {
        Self::system(SysMessageType::KeepaliveRequest, node_id, Bytes::new())
    }

    pub fn keepalive_response(node_id: u32) -> Self {
        Self::system(SysMessageType::KeepaliveResponse, node_id, Bytes::new())
    }

    pub(crate) fn from_parts(header: WireHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &WireHeader {
        &self.header
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type()
    }

    pub fn node_id(&self) -> u32 {
        self.header.node_id()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_system(&self) -> bool {
        self.header.is_system()
    }

    /// Encoded size on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Write header and payload into `out`, which must hold `encoded_len()` bytes
    pub fn write_to(&self, out: &mut [u8]) -> ProtocolResult<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(ProtocolError::message_too_small(len, out.len(), "Frame::write_to"));
        }
        out[..HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        out[HEADER_SIZE..len].copy_from_slice(&self.payload);
        Ok(len)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Decode the first complete frame in `data`
///
/// Returns `Ok(None)` while the header or payload is still incomplete, and the
/// decoded frame with the number of bytes it consumed otherwise.
pub fn decode_frame(data: &[u8], max_payload: usize) -> ProtocolResult<Option<(Frame, usize)>> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = parse_header(data, max_payload)?;
    let total = header.frame_len();
    if data.len() < total {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..total]);
    Ok(Some((Frame::from_parts(header, payload), total)))
}
