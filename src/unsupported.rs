//! Stand-in `Client` for non-unix targets.
//!
//! The jobserver protocol as implemented by this crate is POSIX-specific
//! (anonymous pipes, `SIGALRM`/`setitimer`, `epoll`). Rather than forcing
//! every downstream crate to gate its own code behind `cfg(unix)` just to
//! call [`Client::from_makeflags`], the type still exists off-unix and
//! simply reports the platform as unsupported.

use crate::error::{Error, Result};

/// Always-unavailable stand-in for [`crate::client::Client`] on non-unix
/// targets.
#[derive(Debug, Clone)]
pub struct Client {
    _private: (),
}

/// Uninhabited off-unix: [`Client::get_token`] never produces one.
#[derive(Debug)]
pub struct Acquired {
    _private: (),
}

impl Client {
    /// Always fails: this platform is not supported.
    pub fn from_makeflags(_flags: &str) -> Result<Self> {
        Err(unsupported())
    }

    /// Always fails: this platform is not supported.
    ///
    /// # Safety
    ///
    /// No-op on this platform; kept `unsafe` to match the unix signature.
    pub unsafe fn from_env() -> Result<Option<Self>> {
        Err(unsupported())
    }

    /// Always fails: this platform is not supported.
    pub fn get_token(&self) -> Result<Option<Acquired>> {
        Err(unsupported())
    }
}

fn unsupported() -> Error {
    Error::Config("the jobserver engine is only implemented for unix targets".into())
}
