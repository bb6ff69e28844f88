// SPDX-License-Identifier: MPL-2.0

use std::{fmt, io};

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// An on-disk invariant was violated.
    CorruptData,
    /// A version field is in a known-unsupported range.
    UnsupportedVersion,
    /// The storage holds no index at all.
    NoIndex,
    /// No save slot holds a clean shutdown.
    IndexNotSavedCleanly,
    /// A configured size is not a multiple of the block size.
    IncorrectAlignment,
    /// A save slot fails its validity predicate.
    BadState,
    /// Invalid arguments.
    InvalidArgs,
    /// The storage is too small for what was asked of it.
    NoSpace,
    /// An internal consistency check failed.
    UnexpectedResult,
    /// IO error.
    IoFailed,
}

/// The error with an error type and an error message used in this crate.
///
/// Device errors keep their `std::io::Error` as the source.
#[derive(Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
    source: Option<io::Error>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error {
            errno,
            msg: None,
            source: None,
        }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
            source: None,
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            errno: Errno::IoFailed,
            msg: None,
            source: Some(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.errno)?;
        if let Some(msg) = self.msg {
            write!(f, ": {msg}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|err| err as _)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
