//! Fixed-size buffer pool and scoped buffer chains.
//!
//! The pool is an arena of `B`-byte buffers addressed by [`BufferId`]. Ids are
//! move-only tokens, so a buffer cannot be handed back twice. A
//! [`BufferChain`] owns the ids backing one in-flight message and returns them
//! to the pool when it is dropped, including on early-return paths.
//!
//! Buffers are boxed slices that never move once allocated and are never
//! freed before the pool itself, which lets the completion backend hand raw
//! pointers into them to the kernel.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::framing::TERMINATOR;

/// Default buffer size (1KB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Buffers allocated up front by [`BufferPool::with_defaults`].
pub const DEFAULT_INITIAL_BUFFERS: usize = 8;

/// Handle to one pool buffer.
///
/// Not `Clone`: returning it to the pool consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferId(u32);

impl BufferId {
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

struct PoolState {
    buffer_size: usize,
    buffers: Vec<Box<[u8]>>,
    free: VecDeque<u32>,
}

impl PoolState {
    fn grow(&mut self) -> u32 {
        let index = self.buffers.len() as u32;
        self.buffers
            .push(vec![0u8; self.buffer_size].into_boxed_slice());
        index
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        let outstanding = self.buffers.len() - self.free.len();
        if outstanding != 0 {
            warn!("[Pool] dropped with {} buffers outstanding", outstanding);
        }
    }
}

/// Growable pool of fixed-size buffers.
///
/// Cloning yields another handle to the same pool. Each event manager owns
/// one pool; buffers never move between managers.
#[derive(Clone)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers with `initial` preallocated.
    ///
    /// A zero `buffer_size` is bumped to one byte.
    #[must_use]
    pub fn new(buffer_size: usize, initial: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let mut state = PoolState {
            buffer_size,
            buffers: Vec::with_capacity(initial),
            free: VecDeque::with_capacity(initial),
        };
        for _ in 0..initial {
            let index = state.grow();
            state.free.push_back(index);
        }

        Self {
            state: Arc::new(Mutex::new(state)),
            buffer_size,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_INITIAL_BUFFERS)
    }

    #[inline]
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Borrow a buffer, allocating a new one when none are free.
    pub fn take_buffer(&self) -> BufferId {
        let mut state = self.state.lock();
        let index = match state.free.pop_front() {
            Some(index) => index,
            None => state.grow(),
        };
        trace!("[Pool] take {}/{}", state.free.len(), state.buffers.len());
        BufferId(index)
    }

    pub fn return_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        debug_assert!(id.index() < state.buffers.len(), "foreign buffer id");
        state.free.push_back(id.0);
        trace!("[Pool] return {}/{}", state.free.len(), state.buffers.len());
    }

    pub fn return_buffers<I>(&self, ids: I)
    where
        I: IntoIterator<Item = BufferId>,
    {
        let mut state = self.state.lock();
        let before = state.free.len();
        state.free.extend(ids.into_iter().map(|id| id.0));
        if state.free.len() != before {
            trace!(
                "[Pool] return {} -> {}/{}",
                state.free.len() - before,
                state.free.len(),
                state.buffers.len()
            );
        }
    }

    /// Total buffers ever allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().buffers.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Buffers currently borrowed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len() - state.free.len()
    }

    /// Run `f` over the contents of a borrowed buffer.
    pub fn with_buffer<R>(&self, id: &BufferId, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state.lock();
        f(&state.buffers[id.index()])
    }

    /// Run `f` over the writable contents of a borrowed buffer.
    pub fn with_buffer_mut<R>(&self, id: &BufferId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.buffers[id.index()])
    }

    /// Rebuild a logical message from `ids`.
    ///
    /// Every buffer but the last contributes exactly `B` bytes. The last one
    /// contributes the bytes before its first terminator, or all `B` bytes if
    /// it has none.
    #[must_use]
    pub fn concat_buffers(&self, ids: &[BufferId]) -> Bytes {
        let Some((last, full)) = ids.split_last() else {
            return Bytes::new();
        };

        let state = self.state.lock();
        let mut out = BytesMut::with_capacity(ids.len() * self.buffer_size);
        for id in full {
            out.extend_from_slice(&state.buffers[id.index()]);
        }
        let tail = &state.buffers[last.index()];
        let len = tail
            .iter()
            .position(|&b| b == TERMINATOR)
            .unwrap_or(tail.len());
        out.extend_from_slice(&tail[..len]);
        out.freeze()
    }

    /// Start an empty chain over this pool.
    #[must_use]
    pub fn chain(&self) -> BufferChain {
        BufferChain::new(self)
    }

    /// Address of a buffer's first byte.
    ///
    /// Valid for as long as the pool is alive; buffers never move.
    pub(crate) fn buffer_ptr(&self, id: &BufferId) -> *mut u8 {
        let mut state = self.state.lock();
        state.buffers[id.index()].as_mut_ptr()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &state.buffers.len())
            .field("free", &state.free.len())
            .finish()
    }
}

/// Ordered buffers backing one message in flight.
///
/// Every buffer except the last is full. The first buffer may start with
/// bytes that belonged to an already extracted message (`head`).
pub struct BufferChain {
    pool: BufferPool,
    buffers: SmallVec<[BufferId; 4]>,
    head: usize,
    tail_len: usize,
}

impl BufferChain {
    #[must_use]
    pub fn new(pool: &BufferPool) -> Self {
        Self {
            pool: pool.clone(),
            buffers: SmallVec::new(),
            head: 0,
            tail_len: 0,
        }
    }

    /// Append a fresh buffer from the pool.
    pub fn take_buffer(&mut self) -> &BufferId {
        let id = self.pool.take_buffer();
        self.buffers.push(id);
        self.tail_len = 0;
        &self.buffers[self.buffers.len() - 1]
    }

    /// Hand every held buffer back to the pool and reset.
    pub fn return_all_buffers(&mut self) {
        self.pool.return_buffers(self.buffers.drain(..));
        self.head = 0;
        self.tail_len = 0;
    }

    /// Number of buffers held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Bytes held that do not yet belong to a complete message.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        match self.buffers.len() {
            0 => 0,
            n => (n - 1) * self.pool.buffer_size() + self.tail_len - self.head,
        }
    }

    /// Pending bytes up to the first terminator.
    #[must_use]
    pub fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.pending_len());
        let last = self.buffers.len().saturating_sub(1);
        for (i, id) in self.buffers.iter().enumerate() {
            let start = if i == 0 { self.head } else { 0 };
            let stop = if i == last {
                self.tail_len
            } else {
                self.pool.buffer_size()
            };
            let done = self.pool.with_buffer(id, |buf| {
                let region = &buf[start..stop];
                match region.iter().position(|&b| b == TERMINATOR) {
                    Some(end) => {
                        out.extend_from_slice(&region[..end]);
                        true
                    }
                    None => {
                        out.extend_from_slice(region);
                        false
                    }
                }
            });
            if done {
                break;
            }
        }
        out.freeze()
    }

    /// Make sure the last buffer has free space and return how much.
    fn reserve_tail(&mut self) -> usize {
        if self.buffers.is_empty() || self.tail_len == self.pool.buffer_size() {
            self.take_buffer();
        }
        self.pool.buffer_size() - self.tail_len
    }

    /// Let `f` write into the free tail of the chain.
    ///
    /// The bytes are not considered received until [`commit`](Self::commit).
    pub fn fill_tail<F>(&mut self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.reserve_tail();
        let start = self.tail_len;
        let last = &self.buffers[self.buffers.len() - 1];
        self.pool.with_buffer_mut(last, |buf| f(&mut buf[start..]))
    }

    /// Pointer and length of the free tail, for operations completed later.
    pub(crate) fn tail_region(&mut self) -> (*mut u8, usize) {
        let spare = self.reserve_tail();
        let last = &self.buffers[self.buffers.len() - 1];
        let base = self.pool.buffer_ptr(last);
        (base.wrapping_add(self.tail_len), spare)
    }

    /// Mark `n` bytes of the tail as received.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.tail_len + n <= self.pool.buffer_size());
        self.tail_len = (self.tail_len + n).min(self.pool.buffer_size());
    }

    /// Terminator offsets within the last `n` committed bytes of the tail.
    pub(crate) fn terminators_in_tail(&self, n: usize) -> SmallVec<[usize; 4]> {
        let Some(last) = self.buffers.last() else {
            return SmallVec::new();
        };
        let from = self.tail_len.saturating_sub(n).max(self.head_in_tail());
        let to = self.tail_len;
        self.pool.with_buffer(last, |buf| {
            buf[from..to]
                .iter()
                .enumerate()
                .filter(|&(_, &b)| b == TERMINATOR)
                .map(|(i, _)| from + i)
                .collect()
        })
    }

    fn head_in_tail(&self) -> usize {
        if self.buffers.len() == 1 {
            self.head
        } else {
            0
        }
    }

    /// Cut the message ending at offset `end` of the last buffer.
    ///
    /// The terminator at `end` is consumed. Leading buffers go back to the
    /// pool; if nothing is left pending, the whole chain does.
    pub(crate) fn split_message(&mut self, end: usize) -> Bytes {
        let size = self.pool.buffer_size();
        let last = self.buffers.len() - 1;
        let mut out = BytesMut::with_capacity(last * size + end);
        for (i, id) in self.buffers.iter().enumerate() {
            let start = if i == 0 { self.head } else { 0 };
            let stop = if i == last { end } else { size };
            if start < stop {
                self.pool
                    .with_buffer(id, |buf| out.extend_from_slice(&buf[start..stop]));
            }
        }

        if last > 0 {
            self.pool.return_buffers(self.buffers.drain(..last));
        }
        self.head = end + 1;
        if self.head >= self.tail_len {
            self.return_all_buffers();
        }
        out.freeze()
    }
}

impl Drop for BufferChain {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            self.return_all_buffers();
        }
    }
}

impl fmt::Debug for BufferChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferChain")
            .field("buffers", &self.buffers.len())
            .field("head", &self.head)
            .field("tail_len", &self.tail_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(chain: &mut BufferChain, data: &[u8]) -> usize {
        let n = chain
            .fill_tail(|buf| {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            })
            .unwrap();
        chain.commit(n);
        n
    }

    #[test]
    fn take_grows_when_free_list_is_empty() {
        let pool = BufferPool::new(8, 2);
        let a = pool.take_buffer();
        let b = pool.take_buffer();
        assert_eq!(pool.free_count(), 0);

        let c = pool.take_buffer();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.outstanding(), 3);

        pool.return_buffers([a, b, c]);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn chain_returns_buffers_on_drop() {
        let pool = BufferPool::new(8, 1);
        {
            let mut chain = pool.chain();
            chain.take_buffer();
            chain.take_buffer();
            chain.take_buffer();
            assert_eq!(pool.outstanding(), 3);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn chain_returns_buffers_on_early_error() {
        fn reassemble(pool: &BufferPool) -> io::Result<()> {
            let mut chain = pool.chain();
            chain.take_buffer();
            chain.fill_tail(|_| Err(io::Error::from(io::ErrorKind::ConnectionReset)))?;
            Ok(())
        }

        let pool = BufferPool::new(16, 0);
        assert!(reassemble(&pool).is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn return_all_then_drop_returns_once() {
        let pool = BufferPool::new(8, 0);
        let mut chain = pool.chain();
        chain.take_buffer();
        chain.take_buffer();
        chain.return_all_buffers();
        assert!(chain.is_empty());
        drop(chain);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn concat_treats_leading_buffers_as_full() {
        let pool = BufferPool::new(4, 0);
        let a = pool.take_buffer();
        let b = pool.take_buffer();
        pool.with_buffer_mut(&a, |buf| buf.copy_from_slice(b"ABCD"));
        pool.with_buffer_mut(&b, |buf| buf.copy_from_slice(b"EF\0\0"));

        let ids = [a, b];
        assert_eq!(&pool.concat_buffers(&ids)[..], b"ABCDEF");
        pool.return_buffers(ids);
    }

    #[test]
    fn concat_without_terminator_takes_full_tail() {
        let pool = BufferPool::new(3, 0);
        let a = pool.take_buffer();
        pool.with_buffer_mut(&a, |buf| buf.copy_from_slice(b"xyz"));
        let ids = [a];
        assert_eq!(&pool.concat_buffers(&ids)[..], b"xyz");
        pool.return_buffers(ids);
        assert!(pool.concat_buffers(&[]).is_empty());
    }

    #[test]
    fn fill_tail_appends_buffer_only_when_full() {
        let pool = BufferPool::new(4, 0);
        let mut chain = pool.chain();
        assert_eq!(write(&mut chain, b"ab"), 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(write(&mut chain, b"cdef"), 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(write(&mut chain, b"ef"), 2);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.pending_len(), 6);
        assert_eq!(&chain.concat()[..], b"abcdef");
    }

    #[test]
    fn split_message_keeps_leftover_bytes() {
        let pool = BufferPool::new(8, 0);
        let mut chain = pool.chain();
        write(&mut chain, b"A\0BB");

        let ends = chain.terminators_in_tail(4);
        assert_eq!(ends.as_slice(), &[1]);
        assert_eq!(&chain.split_message(1)[..], b"A");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.pending_len(), 2);

        write(&mut chain, b"\0");
        let ends = chain.terminators_in_tail(1);
        assert_eq!(ends.as_slice(), &[4]);
        assert_eq!(&chain.split_message(4)[..], b"BB");
        assert!(chain.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }
}
