//! Snapshot Buffers for Partial Socket I/O
//!
//! ## Purpose
//!
//! A `SnapBuffer` is a fixed arena with two cursors that absorbs partial reads
//! and writes on a non-blocking socket. Bytes between `optr` and `iptr` are
//! pending: on the receive side they are unparsed input, on the send side they
//! are encoded frames not yet accepted by the kernel.
//!
//! ```text
//! 0 (addr)          optr               iptr                 capacity (end)
//! ├─────────────────┼──────────────────┼─────────────────────┤
//! │ consumed        │ pending          │ free tail           │
//! └─────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - `0 <= optr <= iptr <= capacity` after every operation
//! - Fully draining the pending span resets both cursors to 0
//! - When the tail runs out while bytes are pending, the pending span is moved
//!   to offset 0 (compaction) so the arena is reused without ever growing
//!
//! Cursors are plain offsets into an owned slice and every advance is bounds
//! checked against the arena.

use crate::error::ProtocolResult;
use crate::frame::{decode_frame, Frame};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Errors raised while moving bytes between a socket and a buffer
#[derive(Debug, Error)]
pub enum BufferError {
    /// No room to read: the pending span already fills the arena
    #[error("Snapshot buffer full: {pending} pending bytes fill all {capacity} bytes")]
    Full { capacity: usize, pending: usize },

    /// Peer closed the stream (read returned 0)
    #[error("Stream closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BufferError {
    /// True when the socket simply has nothing more right now
    pub fn is_would_block(&self) -> bool {
        matches!(self, BufferError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Fixed-size byte arena with read/write cursors
#[derive(Debug)]
pub struct SnapBuffer {
    data: Box<[u8]>,
    optr: usize,
    iptr: usize,
}

impl SnapBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            optr: 0,
            iptr: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Next byte to consume
    pub fn optr(&self) -> usize {
        self.optr
    }

    /// Next byte to fill
    pub fn iptr(&self) -> usize {
        self.iptr
    }

    /// Pending byte count
    pub fn len(&self) -> usize {
        self.iptr - self.optr
    }

    pub fn is_empty(&self) -> bool {
        self.optr == self.iptr
    }

    /// Bytes that can still be appended, counting space reclaimable by compaction
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn reset(&mut self) {
        self.optr = 0;
        self.iptr = 0;
    }

    /// Move the pending span to the start of the arena
    pub fn compact(&mut self) {
        if self.optr == 0 {
            return;
        }
        let pending = self.len();
        self.data.copy_within(self.optr..self.iptr, 0);
        self.optr = 0;
        self.iptr = pending;
    }

    /// Pending bytes
    pub fn readable(&self) -> &[u8] {
        &self.data[self.optr..self.iptr]
    }

    /// Mark up to `n` pending bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.optr += n.min(self.len());
        if self.optr == self.iptr {
            self.reset();
        }
    }

    /// Append raw bytes, compacting first if the tail is too short
    ///
    /// Returns false and leaves the buffer untouched when the bytes do not fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_space() {
            return false;
        }
        if self.iptr + bytes.len() > self.capacity() {
            self.compact();
        }
        self.data[self.iptr..self.iptr + bytes.len()].copy_from_slice(bytes);
        self.iptr += bytes.len();
        true
    }

    /// Append an encoded frame; false when it does not fit
    pub fn append_frame(&mut self, frame: &Frame) -> bool {
        let len = frame.encoded_len();
        if len > self.free_space() {
            return false;
        }
        if self.iptr + len > self.capacity() {
            self.compact();
        }
        match frame.write_to(&mut self.data[self.iptr..]) {
            Ok(written) => {
                self.iptr += written;
                true
            }
            Err(_) => false,
        }
    }

    /// Read once from `reader` into the free tail
    ///
    /// Compacts when the tail is exhausted but consumed bytes can be
    /// reclaimed. A zero-byte read is reported as [`BufferError::Closed`].
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, BufferError> {
        if self.iptr == self.capacity() {
            if self.optr == 0 {
                return Err(BufferError::Full {
                    capacity: self.capacity(),
                    pending: self.len(),
                });
            }
            self.compact();
        }

        loop {
            match reader.read(&mut self.data[self.iptr..]) {
                Ok(0) => return Err(BufferError::Closed),
                Ok(n) => {
                    self.iptr += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BufferError::Io(e)),
            }
        }
    }

    /// Write pending bytes to `writer` until drained or it would block
    ///
    /// A short write advances only `optr`; the remainder stays pending for the
    /// next writable event. Returns the number of bytes written.
    pub fn drain_to<W: Write>(&mut self, writer: &mut W) -> Result<usize, BufferError> {
        let mut written = 0;
        while self.optr < self.iptr {
            match writer.write(&self.data[self.optr..self.iptr]) {
                Ok(0) => {
                    return Err(BufferError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )))
                }
                Ok(n) => {
                    self.optr += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(BufferError::Io(e)),
            }
        }
        if self.optr == self.iptr {
            self.reset();
        }
        Ok(written)
    }

    /// Decode and consume the next complete frame from the pending span
    ///
    /// `Ok(None)` means more bytes are needed. Errors come from header
    /// validation and leave the cursors where they were.
    pub fn next_frame(&mut self, max_payload: usize) -> ProtocolResult<Option<Frame>> {
        match decode_frame(self.readable(), max_payload)? {
            Some((frame, used)) => {
                self.consume(used);
                Ok(Some(frame))
            }
            None => {
                if self.iptr == self.capacity() {
                    self.compact();
                }
                Ok(None)
            }
        }
    }
}
