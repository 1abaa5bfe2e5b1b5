//! Stream decoding tests
//!
//! Frames are pushed through a `SnapBuffer` the way a session reads them off a
//! socket: arbitrary read boundaries, a small arena that must compact, and
//! corrupted headers that must be rejected.

use linkmq_codec::{
    BufferError, Frame, MessageClass, ProtocolError, SnapBuffer, HEADER_SIZE, TYPE_MAX,
};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::io::{self, Read};

const MAX_PAYLOAD: usize = 64;

/// Reader that hands out pre-split chunks, one chunk boundary per read at most
struct ChunkedReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ChunkedReader {
    fn split(bytes: &[u8], cuts: &[usize]) -> Self {
        let mut chunks = VecDeque::new();
        let mut start = 0;
        for &cut in cuts {
            let cut = cut.min(bytes.len()).max(start);
            chunks.push_back(bytes[start..cut].to_vec());
            start = cut;
        }
        chunks.push_back(bytes[start..].to_vec());
        chunks.retain(|c| !c.is_empty());
        Self { chunks }
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self.chunks.front_mut() else {
            return Ok(0);
        };
        let n = buf.len().min(front.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            self.chunks.pop_front();
        }
        Ok(n)
    }
}

fn drain_stream(reader: &mut ChunkedReader, arena: usize) -> Result<Vec<Frame>, ProtocolError> {
    let mut buf = SnapBuffer::new(arena);
    let mut frames = Vec::new();
    loop {
        match buf.fill_from(reader) {
            Ok(_) => {}
            Err(BufferError::Closed) => break,
            Err(e) => panic!("unexpected buffer error: {e}"),
        }
        while let Some(frame) = buf.next_frame(MAX_PAYLOAD)? {
            frames.push(frame);
        }
        assert!(buf.optr() <= buf.iptr() && buf.iptr() <= buf.capacity());
    }
    Ok(frames)
}

fn frame_strategy() -> impl Strategy<Value = Frame> {
    (
        0u16..TYPE_MAX,
        any::<u32>(),
        prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
    )
        .prop_map(|(t, node, payload)| Frame::application(t, node, payload))
}

proptest! {
    #[test]
    fn frames_survive_two_arbitrary_read_boundaries(
        frames in prop::collection::vec(frame_strategy(), 1..12),
        a in 0usize..2048,
        b in 0usize..2048,
    ) {
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode().to_vec()).collect();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut reader = ChunkedReader::split(&wire, &[lo, hi]);

        // Arena holds one maximal frame plus a little, forcing compaction
        let decoded = drain_stream(&mut reader, HEADER_SIZE + MAX_PAYLOAD + 8).unwrap();

        prop_assert_eq!(decoded.len(), frames.len());
        for (got, want) in decoded.iter().zip(frames.iter()) {
            prop_assert_eq!(got.msg_type(), want.msg_type());
            prop_assert_eq!(got.node_id(), want.node_id());
            prop_assert_eq!(got.header().length() as usize, want.payload().len());
            prop_assert_eq!(got.payload(), want.payload());
        }
    }

    #[test]
    fn corrupted_sentinel_or_high_bytes_rejected(
        idx in prop::sample::select(vec![0usize, 6, 7, 11, 12, 13, 14]),
        mask in 1u8..=255,
    ) {
        let mut wire = Frame::application(7, 3, vec![1, 2, 3, 4]).encode().to_vec();
        wire[idx] ^= mask;

        let mut reader = ChunkedReader::split(&wire, &[]);
        prop_assert!(drain_stream(&mut reader, 128).is_err());
    }

    #[test]
    fn unknown_flag_rejected(flag in 2u8..=255) {
        let mut wire = Frame::application(7, 3, vec![9; 4]).encode().to_vec();
        wire[10] = flag;

        let mut reader = ChunkedReader::split(&wire, &[]);
        let err = drain_stream(&mut reader, 128).unwrap_err();
        prop_assert_eq!(err, ProtocolError::unknown_class(flag, 7));
    }
}

#[test]
fn frame_after_corruption_is_never_returned() {
    let good = Frame::application(7, 1, b"good".to_vec()).encode();
    let mut bad = Frame::application(7, 1, b"bad!".to_vec()).encode().to_vec();
    bad[11] = 0;

    let mut wire = good.to_vec();
    wire.extend_from_slice(&bad);
    wire.extend_from_slice(&good);

    let mut buf = SnapBuffer::new(256);
    assert!(buf.append(&wire));

    let first = buf.next_frame(MAX_PAYLOAD).unwrap().unwrap();
    assert_eq!(first.payload().as_ref(), b"good");
    assert!(matches!(
        buf.next_frame(MAX_PAYLOAD),
        Err(ProtocolError::SentinelMismatch { .. })
    ));
}

#[test]
fn system_and_application_frames_interleave() {
    let frames = vec![
        Frame::auth_request(4, "node", "pw").unwrap(),
        Frame::application(10, 4, b"x".to_vec()),
        Frame::keepalive_response(4),
    ];
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode().to_vec()).collect();

    let mut reader = ChunkedReader::split(&wire, &[HEADER_SIZE + 1, HEADER_SIZE + 60]);
    let decoded = drain_stream(&mut reader, 256).unwrap();

    let classes: Vec<MessageClass> = decoded
        .iter()
        .map(|f| f.header().class().unwrap())
        .collect();
    assert_eq!(
        classes,
        vec![
            MessageClass::System,
            MessageClass::Application,
            MessageClass::System
        ]
    );
    assert_eq!(decoded, frames);
}
