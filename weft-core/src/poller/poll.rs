//! `poll(2)` backend.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::trace;

use super::{EventFlags, ReadinessBackend};
use crate::error::Result;

const READ_EVENTS: libc::c_short = libc::POLLIN;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const ERROR_EVENTS: libc::c_short = libc::POLLERR | libc::POLLNVAL;

/// Readiness backend over an array of `pollfd`.
#[derive(Default)]
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // Round up so a sub-millisecond timeout still blocks briefly.
            let ms = timeout.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl ReadinessBackend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add(&mut self, fd: RawFd) -> Result<usize> {
        self.fds.push(libc::pollfd {
            fd,
            events: READ_EVENTS,
            revents: 0,
        });
        trace!("[Poll] add fd {} at {}", fd, self.fds.len() - 1);
        Ok(self.fds.len() - 1)
    }

    fn remove(&mut self, index: usize) {
        let entry = self.fds.remove(index);
        trace!("[Poll] remove fd {} from {}", entry.fd, index);
    }

    fn set_write_flag(&mut self, index: usize) {
        self.fds[index].events |= WRITE_EVENTS;
    }

    fn reset_write_flag(&mut self, index: usize) {
        self.fds[index].events &= !WRITE_EVENTS;
    }

    fn wait_for_events(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.fds.is_empty() {
            return Ok(0);
        }

        // SAFETY: the pointer and length describe `self.fds`, which is not
        // touched while the call runs.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            for entry in &mut self.fds {
                entry.revents = 0;
            }
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    fn at(&self, index: usize) -> EventFlags {
        let revents = self.fds[index].revents;
        EventFlags {
            read: revents & READ_EVENTS != 0,
            write: revents & WRITE_EVENTS != 0,
            except: revents & ERROR_EVENTS != 0,
            hangup: revents & libc::POLLHUP != 0,
        }
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn log_state(&self) {
        for entry in &self.fds {
            if entry.revents == 0 {
                continue;
            }
            let want = |mask: libc::c_short, c: char| if entry.events & mask != 0 { c } else { '-' };
            let got = |mask: libc::c_short, c: char| if entry.revents & mask != 0 { c } else { '-' };
            trace!(
                "[Poll] fd {} want [{}{}] got [{}{}{}{}]",
                entry.fd,
                want(READ_EVENTS, 'R'),
                want(WRITE_EVENTS, 'W'),
                got(READ_EVENTS, 'R'),
                got(WRITE_EVENTS, 'W'),
                got(ERROR_EVENTS, 'E'),
                got(libc::POLLHUP, 'H'),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn timeout_rounds_up_to_a_millisecond() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn reports_readable_and_writable() {
        let (server, mut client) = pair();
        let mut backend = PollBackend::new();
        let index = backend.add(server.as_raw_fd()).unwrap();

        assert_eq!(backend.wait_for_events(Some(Duration::from_millis(10))).unwrap(), 0);

        client.write_all(b"hello\0").unwrap();
        backend.set_write_flag(index);
        assert_eq!(backend.wait_for_events(Some(Duration::from_secs(5))).unwrap(), 1);
        let flags = backend.at(index);
        assert!(flags.read);
        assert!(flags.write);

        backend.reset_write_flag(index);
        backend.wait_for_events(Some(Duration::from_secs(5))).unwrap();
        assert!(!backend.at(index).write);
    }

    #[test]
    fn peer_close_is_readable() {
        let (server, client) = pair();
        let mut backend = PollBackend::new();
        let index = backend.add(server.as_raw_fd()).unwrap();

        client.shutdown(Shutdown::Both).unwrap();
        drop(client);
        assert_eq!(backend.wait_for_events(Some(Duration::from_secs(5))).unwrap(), 1);
        assert!(backend.at(index).read);
    }
}
