//! Readiness backends.
//!
//! A readiness backend keeps an ordered list of registered descriptors and
//! reports, after each wait, which of them can make progress. The manager
//! keeps its own context list parallel to the backend's: index `i` always
//! names the same socket in both.

pub mod poll;
pub mod select;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;

pub use poll::PollBackend;
pub use select::SelectBackend;

/// Per-socket result of the last wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    pub read: bool,
    pub write: bool,
    pub except: bool,
    pub hangup: bool,
}

impl EventFlags {
    /// Any condition reported.
    #[inline]
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.read || self.write || self.except || self.hangup
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "[{}{}{}{}]",
            flag(self.read, 'R'),
            flag(self.write, 'W'),
            flag(self.except, 'E'),
            flag(self.hangup, 'H')
        )
    }
}

/// Contract shared by the select and poll backends.
pub trait ReadinessBackend {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Register `fd` for read and exception interest. Returns its index.
    fn add(&mut self, fd: RawFd) -> Result<usize>;

    /// Unregister the socket at `index`; later indices shift down by one.
    fn remove(&mut self, index: usize);

    /// Also wait for writability of `index` from the next wait on.
    fn set_write_flag(&mut self, index: usize);

    fn reset_write_flag(&mut self, index: usize);

    /// Block up to `timeout` (`None` waits forever). Returns the number of
    /// sockets with at least one condition, 0 on timeout.
    fn wait_for_events(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Result of the last wait for `index`.
    fn at(&self, index: usize) -> EventFlags;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trace requested vs reported flags per socket.
    fn log_state(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_display() {
        let flags = EventFlags {
            read: true,
            hangup: true,
            ..EventFlags::default()
        };
        assert_eq!(flags.to_string(), "[R--H]");
        assert!(flags.changed());
        assert!(!EventFlags::default().changed());
    }
}
