//! Error handling utils.
//!
//! Kernel-level failures keep their identity: hooked syscalls report
//! `io::Error` values built from the raw os error, and a timed-out
//! operation surfaces as `ETIMEDOUT` exactly like a kernel timeout would.
//! The crate error type only adds the non-syscall failure modes
//! (configuration, reactor registration).

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to decode config value: {0}")]
    ConfigDecode(#[from] serde_json::Error),

    /// A hooked call needed the reactor but the calling thread is not a
    /// reactor worker.
    #[error("no reactor is bound to the current thread")]
    NoReactor,
}

impl Error {
    /// Collapses the error into the `io::Error` a hooked-syscall caller
    /// expects, preserving the raw os error where one exists.
    pub fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
