//! Error types shared across the muxio crates.
//!
//! Only *recoverable* runtime conditions are represented here. Contract
//! violations (wrong-thread calls, double registration, removing a channel
//! that still has an interest mask) are caller bugs and stay assertions.

use std::fmt;

use nix::errno::Errno;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// OS error with errno.
    Os(Errno),
    /// Asked to consume more bytes than a buffer holds.
    BufferUnderflow { requested: usize, readable: usize },
    /// Connection is not in a state that allows the operation.
    InvalidState(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(errno) => write!(f, "OS error: {} ({})", errno.desc(), *errno as i32),
            Self::BufferUnderflow {
                requested,
                readable,
            } => write!(
                f,
                "buffer underflow: requested {} of {} readable bytes",
                requested, readable
            ),
            Self::InvalidState(what) => write!(f, "invalid state: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::Os(errno)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fetch the calling thread's current errno as an [`Errno`].
#[inline]
pub fn last_errno() -> Errno {
    Errno::last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_underflow() {
        let e = Error::BufferUnderflow {
            requested: 8,
            readable: 3,
        };
        assert_eq!(
            e.to_string(),
            "buffer underflow: requested 8 of 3 readable bytes"
        );
    }

    #[test]
    fn test_from_errno() {
        let e: Error = Errno::EAGAIN.into();
        assert_eq!(e, Error::Os(Errno::EAGAIN));
    }
}
