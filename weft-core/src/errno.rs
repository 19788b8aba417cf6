//! Symbolic names for OS error codes.
//!
//! Only used on the failure-logging path. A code without a known name is
//! reported numerically; naming never fails.

use std::io;

macro_rules! errno_names {
    ($code:expr; $($name:ident),* $(,)?) => {
        match $code {
            $(libc::$name => Some(stringify!($name)),)*
            _ => None,
        }
    };
}

/// Map an errno value to its symbolic name, e.g. `104` → `"ECONNRESET"`.
#[must_use]
pub fn error_name(code: i32) -> Option<&'static str> {
    errno_names!(code;
        EPERM, ENOENT, EINTR, EIO, EBADF, EAGAIN, ENOMEM, EACCES, EFAULT,
        EBUSY, EEXIST, EINVAL, ENFILE, EMFILE, ENOSPC, EPIPE, ENOSYS,
        ENOTSOCK, EDESTADDRREQ, EMSGSIZE, EPROTOTYPE, ENOPROTOOPT,
        EPROTONOSUPPORT, EAFNOSUPPORT, EADDRINUSE, EADDRNOTAVAIL, ENETDOWN,
        ENETUNREACH, ENETRESET, ECONNABORTED, ECONNRESET, ENOBUFS, EISCONN,
        ENOTCONN, ESHUTDOWN, ETIMEDOUT, ECONNREFUSED, EHOSTDOWN, EHOSTUNREACH,
        EALREADY, EINPROGRESS, ECANCELED,
    )
}

/// Render an I/O error as `NAME (code): message`, falling back to the raw code.
#[must_use]
pub fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => match error_name(code) {
            Some(name) => format!("{name} ({code}): {err}"),
            None => format!("errno {code}: {err}"),
        },
        None => format!("{:?}: {err}", err.kind()),
    }
}
