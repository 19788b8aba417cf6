//! Completion backend over Linux io_uring.
//!
//! Unlike the readiness backends there is no "can I read now" step. Receives
//! and sends are submitted straight away, and [`CompletionPort::wait`] hands
//! back one finished operation at a time, tagged with the opaque key of the
//! context that issued it.
//!
//! # Safety
//!
//! The kernel reads from and writes to the submitted buffers asynchronously.
//! Callers of [`CompletionPort::submit_receive`] and
//! [`CompletionPort::submit_send`] must keep those buffers alive and unmoved
//! until the matching completion is dequeued.

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{opcode, squeue, IoUring, Probe};
use tracing::trace;

const TAG_BITS: u64 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const TAG_RECEIVE: u64 = 0;
const TAG_SEND: u64 = 1;
const TAG_CANCEL: u64 = 2;
const TAG_CLOSE: u64 = 3;

/// Largest key that fits next to the operation tag.
pub const MAX_KEY: u64 = u64::MAX >> TAG_BITS;

/// Kind of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Receive,
    Send,
}

impl Operation {
    const fn tag(self) -> u64 {
        match self {
            Self::Receive => TAG_RECEIVE,
            Self::Send => TAG_SEND,
        }
    }
}

/// One finished receive or send.
#[derive(Debug)]
pub struct Completion {
    pub key: u64,
    pub operation: Operation,
    /// Bytes transferred, or the OS error.
    pub result: io::Result<usize>,
}

/// Outcome of a single dequeue.
#[derive(Debug)]
pub enum Event {
    Completed(Completion),
    /// The sentinel queued by [`CompletionPort::post_close`].
    Closed,
    TimedOut,
}

/// Whether this kernel offers everything the completion backend uses.
#[must_use]
pub fn is_supported() -> bool {
    match IoUring::new(4) {
        Ok(ring) => {
            if !ring.params().is_feature_ext_arg() {
                return false;
            }
            let mut probe = Probe::new();
            if ring.submitter().register_probe(&mut probe).is_err() {
                return false;
            }
            [
                opcode::Recv::CODE,
                opcode::Send::CODE,
                opcode::AsyncCancel::CODE,
                opcode::Nop::CODE,
            ]
            .iter()
            .all(|&code| probe.is_supported(code))
        }
        Err(_) => false,
    }
}

const fn user_data(key: u64, tag: u64) -> u64 {
    (key << TAG_BITS) | tag
}

/// Kernel completion queue.
pub struct CompletionPort {
    ring: IoUring,
    ready: VecDeque<Event>,
    in_flight: usize,
}

impl CompletionPort {
    /// Create a ring with `entries` submission slots.
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries.max(2))?;
        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring without timed waits (needs Linux 5.11+)",
            ));
        }
        trace!("[Uring] ring with {} entries", entries);
        Ok(Self {
            ring,
            ready: VecDeque::new(),
            in_flight: 0,
        })
    }

    /// Receives and sends not yet dequeued.
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Start a receive of up to `len` bytes into `buf`.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must stay valid for writes until the completion for
    /// `key` and [`Operation::Receive`] is dequeued.
    pub unsafe fn submit_receive(
        &mut self,
        key: u64,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()> {
        let entry = opcode::Recv::new(Fd(fd), buf, len as u32)
            .build()
            .user_data(user_data(key, TAG_RECEIVE));
        self.push(&entry)?;
        self.in_flight += 1;
        trace!("[Uring] receive key {} fd {} len {}", key, fd, len);
        Ok(())
    }

    /// Start a send of `len` bytes from `buf`.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must stay valid for reads until the completion for
    /// `key` and [`Operation::Send`] is dequeued.
    pub unsafe fn submit_send(
        &mut self,
        key: u64,
        fd: RawFd,
        buf: *const u8,
        len: usize,
    ) -> io::Result<()> {
        let entry = opcode::Send::new(Fd(fd), buf, len as u32)
            .flags(libc::MSG_NOSIGNAL)
            .build()
            .user_data(user_data(key, TAG_SEND));
        self.push(&entry)?;
        self.in_flight += 1;
        trace!("[Uring] send key {} fd {} len {}", key, fd, len);
        Ok(())
    }

    /// Ask the kernel to abort an in-flight operation.
    ///
    /// The operation still produces a completion (usually `ECANCELED`).
    pub fn cancel(&mut self, key: u64, operation: Operation) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(user_data(key, operation.tag()))
            .build()
            .user_data(user_data(key, TAG_CANCEL));
        // SAFETY: a cancel request references no caller memory.
        unsafe { self.push(&entry) }
    }

    /// Queue a sentinel that a later [`wait`](Self::wait) reports as
    /// [`Event::Closed`].
    pub fn post_close(&mut self) -> io::Result<()> {
        let entry = opcode::Nop::new().build().user_data(user_data(0, TAG_CLOSE));
        // SAFETY: a no-op references no caller memory.
        unsafe { self.push(&entry) }
    }

    /// Dequeue one event, blocking up to `timeout` (`None` waits forever).
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Event> {
        if let Some(event) = self.ready.pop_front() {
            return Ok(event);
        }

        let result = match timeout {
            Some(timeout) => {
                let ts = Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };

        match result {
            Ok(_) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR | libc::EBUSY)) => {}
            Err(e) => return Err(e),
        }

        self.reap();
        Ok(self.ready.pop_front().unwrap_or(Event::TimedOut))
    }

    /// Submit queued entries without waiting.
    pub fn flush(&mut self) -> io::Result<()> {
        self.ring.submit().map(|_| ())
    }

    unsafe fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        if self.ring.submission().push(entry).is_ok() {
            return self.flush();
        }
        // Queue full: hand what we have to the kernel and retry once.
        self.flush()?;
        self.ring
            .submission()
            .push(entry)
            .map_err(|_| io::Error::other("submission queue full"))?;
        self.flush()
    }

    fn reap(&mut self) {
        for cqe in self.ring.completion() {
            let data = cqe.user_data();
            let key = data >> TAG_BITS;
            let operation = match data & TAG_MASK {
                TAG_RECEIVE => Operation::Receive,
                TAG_SEND => Operation::Send,
                TAG_CLOSE => {
                    self.ready.push_back(Event::Closed);
                    continue;
                }
                _ => {
                    trace!("[Uring] cancel for key {} finished: {}", key, cqe.result());
                    continue;
                }
            };

            self.in_flight = self.in_flight.saturating_sub(1);
            let res = cqe.result();
            let result = if res < 0 {
                Err(io::Error::from_raw_os_error(-res))
            } else {
                Ok(res as usize)
            };
            self.ready.push_back(Event::Completed(Completion {
                key,
                operation,
                result,
            }));
        }
    }
}
