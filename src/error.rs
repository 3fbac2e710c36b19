//! Error taxonomy for the jobserver engine.
//!
//! Only failures meant to reach a caller get a variant here: a
//! timer-interrupted read, a short write, and a broken grant pipe are all
//! recovered locally (retried on the next poll cycle, or treated as "the
//! child died, cleanup will reclaim") and never constructed as an
//! [`Error`].

use std::io;

/// Errors surfaced by the jobserver engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No jobserver was advertised when one was required, a descriptor
    /// number was `<= 2`, or `--jobserver-fds`/`--jobserver-auth` was
    /// malformed.
    #[error("jobserver configuration error: {0}")]
    Config(String),

    /// EOF from an upstream read, a child returning more bytes than it was
    /// granted, or a pool-ledger invariant was violated. The engine cannot
    /// continue with a corrupted ledger once this happens.
    #[error("jobserver protocol error: {0}")]
    Protocol(String),

    /// Any other I/O failure that isn't locally recoverable.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
