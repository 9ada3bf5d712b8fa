//! muxio-core - leaf utilities shared by the reactor and net crates
//!
//! Nothing in here knows about event loops or sockets beyond raw fds:
//! - [`Timestamp`] - microsecond wall-clock time
//! - [`Buffer`] - growable byte buffer with prependable/readable/writable regions
//! - [`Error`] / [`Result`] - error type for recoverable failures
//! - `klog` - kernel-style leveled logging macros

pub mod buffer;
pub mod error;
pub mod klog;
pub mod timestamp;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use timestamp::Timestamp;
