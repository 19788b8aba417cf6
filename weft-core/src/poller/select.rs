//! `select(2)` backend.
//!
//! Interest is kept in three `fd_set`s; each wait works on copies. Descriptors
//! at or above `FD_SETSIZE` cannot be registered. `select` has no hangup
//! condition, so a closed peer shows up as readable and the following receive
//! returns zero bytes.

#![allow(unsafe_code)]

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use tracing::trace;

use super::{EventFlags, ReadinessBackend};
use crate::error::{Result, WeftError};

/// Descriptors must be strictly below this value.
pub const MAX_SELECT_FD: usize = libc::FD_SETSIZE as usize;

#[derive(Clone, Copy)]
struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO initialises the whole set before it is read.
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self(raw.assume_init())
        }
    }

    fn clear(&mut self) {
        // SAFETY: the set is initialised and owned by `self`.
        unsafe { libc::FD_ZERO(&mut self.0) }
    }

    // Callers guarantee 0 <= fd < FD_SETSIZE for the three accessors below.
    fn insert(&mut self, fd: RawFd) {
        // SAFETY: fd is in range (checked on registration).
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    fn remove(&mut self, fd: RawFd) {
        // SAFETY: fd is in range (checked on registration).
        unsafe { libc::FD_CLR(fd, &mut self.0) }
    }

    fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: fd is in range (checked on registration).
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

/// Readiness backend over `select(2)`.
pub struct SelectBackend {
    fds: Vec<RawFd>,
    read_interest: FdSet,
    write_interest: FdSet,
    except_interest: FdSet,
    read_ready: FdSet,
    write_ready: FdSet,
    except_ready: FdSet,
    largest: RawFd,
}

impl SelectBackend {
    #[must_use]
    pub fn new() -> Self {
        let empty = FdSet::new();
        Self {
            fds: Vec::new(),
            read_interest: empty,
            write_interest: empty,
            except_interest: empty,
            read_ready: empty,
            write_ready: empty,
            except_ready: empty,
            largest: -1,
        }
    }

    fn clear_ready(&mut self) {
        self.read_ready.clear();
        self.write_ready.clear();
        self.except_ready.clear();
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessBackend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add(&mut self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= MAX_SELECT_FD {
            return Err(WeftError::SelectCapacity {
                fd,
                max: MAX_SELECT_FD,
            });
        }

        self.read_interest.insert(fd);
        self.except_interest.insert(fd);
        self.write_interest.remove(fd);
        self.read_ready.remove(fd);
        self.write_ready.remove(fd);
        self.except_ready.remove(fd);
        self.largest = self.largest.max(fd);
        self.fds.push(fd);
        trace!("[Select] add fd {} at {}", fd, self.fds.len() - 1);
        Ok(self.fds.len() - 1)
    }

    fn remove(&mut self, index: usize) {
        let fd = self.fds.remove(index);
        for set in [
            &mut self.read_interest,
            &mut self.write_interest,
            &mut self.except_interest,
            &mut self.read_ready,
            &mut self.write_ready,
            &mut self.except_ready,
        ] {
            set.remove(fd);
        }
        self.largest = self.fds.iter().copied().max().unwrap_or(-1);
        trace!("[Select] remove fd {} from {}", fd, index);
    }

    fn set_write_flag(&mut self, index: usize) {
        self.write_interest.insert(self.fds[index]);
    }

    fn reset_write_flag(&mut self, index: usize) {
        self.write_interest.remove(self.fds[index]);
    }

    fn wait_for_events(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.fds.is_empty() {
            return Ok(0);
        }

        self.read_ready = self.read_interest;
        self.write_ready = self.write_interest;
        self.except_ready = self.except_interest;

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let tv_ptr = match timeout {
            Some(timeout) => {
                tv.tv_sec = timeout.as_secs() as libc::time_t;
                tv.tv_usec = timeout.subsec_micros() as libc::suseconds_t;
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        // SAFETY: the three sets are initialised and outlive the call; every
        // registered descriptor is below FD_SETSIZE.
        let rc = unsafe {
            libc::select(
                self.largest + 1,
                &mut self.read_ready.0,
                &mut self.write_ready.0,
                &mut self.except_ready.0,
                tv_ptr,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            self.clear_ready();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            self.clear_ready();
            return Ok(0);
        }

        Ok((0..self.fds.len()).filter(|&i| self.at(i).changed()).count())
    }

    fn at(&self, index: usize) -> EventFlags {
        let fd = self.fds[index];
        EventFlags {
            read: self.read_ready.contains(fd),
            write: self.write_ready.contains(fd),
            except: self.except_ready.contains(fd),
            hangup: false,
        }
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn log_state(&self) {
        for (index, &fd) in self.fds.iter().enumerate() {
            let flags = self.at(index);
            if flags.changed() {
                trace!(
                    "[Select] fd {} want [R{}E] got {}",
                    fd,
                    if self.write_interest.contains(fd) { 'W' } else { '-' },
                    flags
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn rejects_descriptor_beyond_capacity() {
        let mut backend = SelectBackend::new();
        let err = backend.add(MAX_SELECT_FD as RawFd).unwrap_err();
        assert!(matches!(err, WeftError::SelectCapacity { .. }));
        assert!(backend.is_empty());
    }

    #[test]
    fn reports_readable_socket() {
        let (server, mut client) = pair();
        let mut backend = SelectBackend::new();
        let index = backend.add(server.as_raw_fd()).unwrap();

        assert_eq!(backend.wait_for_events(Some(Duration::from_millis(10))).unwrap(), 0);
        assert!(!backend.at(index).changed());

        client.write_all(b"x\0").unwrap();
        let ready = backend.wait_for_events(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, 1);
        let flags = backend.at(index);
        assert!(flags.read);
        assert!(!flags.hangup);
    }

    #[test]
    fn write_interest_follows_flag() {
        let (server, _client) = pair();
        let mut backend = SelectBackend::new();
        let index = backend.add(server.as_raw_fd()).unwrap();

        backend.set_write_flag(index);
        assert_eq!(backend.wait_for_events(Some(Duration::from_secs(5))).unwrap(), 1);
        assert!(backend.at(index).write);

        backend.reset_write_flag(index);
        assert_eq!(backend.wait_for_events(Some(Duration::from_millis(10))).unwrap(), 0);
    }

    #[test]
    fn remove_shifts_indices() {
        let (a, _ca) = pair();
        let (b, _cb) = pair();
        let mut backend = SelectBackend::new();
        backend.add(a.as_raw_fd()).unwrap();
        backend.add(b.as_raw_fd()).unwrap();
        backend.remove(0);
        assert_eq!(backend.len(), 1);
        backend.set_write_flag(0);
        assert_eq!(backend.wait_for_events(Some(Duration::from_secs(5))).unwrap(), 1);
        assert!(backend.at(0).write);
    }
}
