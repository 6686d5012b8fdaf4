// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EIO = 5,     /* I/O error */
    EAGAIN = 11, /* Try again */
    ENOMEM = 12, /* Out of memory */
    EACCES = 13, /* Permission denied */
    EFAULT = 14, /* Bad address */
    EEXIST = 17, /* File exists */
    EINVAL = 22, /* Invalid argument */
}

/// The error type returned by the fault engine and its collaborators.
///
/// The errors that can reach the caller of [`resolve_fault`] are:
///
/// - `EFAULT`: no region maps the address, or the region has no backing;
/// - `EACCES`: the access exceeds the protection of the region;
/// - `ENOMEM`: memory is exhausted and nothing can be reclaimed;
/// - `EIO`: a backing store failed for good.
///
/// [`resolve_fault`]: crate::resolve_fault
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::Error::with_message($errno, $message))
    };
}
