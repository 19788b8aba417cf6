//! Delimiter framing.
//!
//! On the wire every message is its payload followed by one [`TERMINATOR`]
//! byte; there is no length prefix.
//!
//! - [`OutboundFrame`] walks an encoded message in chunks of at most `B`
//!   bytes, tolerating partial writes.
//! - [`Reassembler`] receives into a [`BufferChain`] and cuts a message every
//!   time a terminator arrives. Bytes following a terminator in the same
//!   transfer start the next message.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::buffer::{BufferChain, BufferPool};
use crate::error::{Result, WeftError};

/// End-of-message marker.
pub const TERMINATOR: u8 = 0x00;

/// Messages produced by one receive. Usually zero or one.
pub type Messages = SmallVec<[Bytes; 2]>;

/// Fail if `payload` contains the terminator.
pub fn validate(payload: &[u8]) -> Result<()> {
    match payload.iter().position(|&b| b == TERMINATOR) {
        Some(offset) => Err(WeftError::EmbeddedTerminator(offset)),
        None => Ok(()),
    }
}

/// Wire form of `payload`: the payload plus a trailing terminator.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    validate(payload)?;
    let mut wire = BytesMut::with_capacity(payload.len() + 1);
    wire.put_slice(payload);
    wire.put_u8(TERMINATOR);
    Ok(wire.freeze())
}

/// Send cursor over one encoded message.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    wire: Bytes,
    offset: usize,
    chunk_size: usize,
}

impl OutboundFrame {
    /// `wire` must already carry its terminator (see [`encode`]).
    #[must_use]
    pub fn new(wire: Bytes, chunk_size: usize) -> Self {
        Self {
            wire,
            offset: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Next bytes to transmit: at most one chunk.
    #[inline]
    #[must_use]
    pub fn chunk(&self) -> &[u8] {
        let end = (self.offset + self.chunk_size).min(self.wire.len());
        &self.wire[self.offset..end]
    }

    /// Record `n` transmitted bytes. Returns `true` once the frame is done.
    pub fn advance(&mut self, n: usize) -> bool {
        self.offset = (self.offset + n).min(self.wire.len());
        self.is_complete()
    }

    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.offset == self.wire.len()
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.wire.len() - self.offset
    }

    /// Payload length, excluding the terminator.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.wire.len().saturating_sub(1)
    }
}

/// Inbound message reassembly over pooled buffers.
///
/// Every receive targets the free tail of the chain; a new buffer is only
/// appended once the current one is full.
pub struct Reassembler {
    chain: BufferChain,
    max_message_size: Option<usize>,
}

impl Reassembler {
    #[must_use]
    pub fn new(pool: &BufferPool) -> Self {
        Self {
            chain: pool.chain(),
            max_message_size: None,
        }
    }

    /// Reject messages longer than `max` bytes.
    #[must_use]
    pub fn with_max_message_size(mut self, max: Option<usize>) -> Self {
        self.max_message_size = max;
        self
    }

    /// Receive through `recv` into the chain tail.
    ///
    /// Call [`complete`](Self::complete) with the returned count afterwards.
    pub fn receive_with<F>(&mut self, recv: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.chain.fill_tail(recv)
    }

    /// Destination for a receive that completes later.
    ///
    /// The region stays valid until [`complete`](Self::complete) or
    /// [`reset`](Self::reset) is called.
    pub(crate) fn receive_target(&mut self) -> (*mut u8, usize) {
        self.chain.tail_region()
    }

    /// Account for `received` new bytes and push every finished message onto
    /// `messages`.
    ///
    /// Messages cut before an oversized one stay in `messages` even when this
    /// returns [`WeftError::MessageTooLarge`].
    pub fn complete(&mut self, received: usize, messages: &mut Messages) -> Result<()> {
        if received == 0 {
            return Ok(());
        }

        self.chain.commit(received);
        for end in self.chain.terminators_in_tail(received) {
            let message = self.chain.split_message(end);
            self.check_size(message.len())?;
            messages.push(message);
        }
        self.check_size(self.chain.pending_len())
    }

    /// Copy `data` through the reassembler as if it had been received.
    pub fn feed(&mut self, mut data: &[u8], messages: &mut Messages) -> Result<()> {
        while !data.is_empty() {
            let n = self.chain.fill_tail(|buf| {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            })?;
            data = &data[n..];
            self.complete(n, messages)?;
        }
        Ok(())
    }

    /// Bytes of the partially received message.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.chain.pending_len()
    }

    #[must_use]
    pub fn chain(&self) -> &BufferChain {
        &self.chain
    }

    /// Drop any partial message and return its buffers.
    pub fn reset(&mut self) {
        self.chain.return_all_buffers();
    }

    fn check_size(&mut self, size: usize) -> Result<()> {
        match self.max_message_size {
            Some(max) if size > max => {
                self.chain.return_all_buffers();
                Err(WeftError::MessageTooLarge { size, max })
            }
            _ => Ok(()),
        }
    }
}
