//! A token-brokering engine implementing the GNU `make` jobserver protocol.
//!
//! `make`'s jobserver bounds parallelism across a tree of cooperating
//! processes with a pool of anonymous tokens, handed out over a pair of
//! pipes and advertised through `MAKEFLAGS`. This crate provides the three
//! roles a process can play in that protocol:
//!
//! - [`Client`] consumes tokens from an upstream jobserver (typically one
//!   set up by `make` itself).
//! - [`Server`] owns a pool of tokens and lends them to child processes over
//!   per-child pipe pairs.
//! - [`Proxy`] is both at once: a server to its own children, relaying
//!   tokens it borrows from an upstream client.
//!
//! The [`flags`] module exposes the pure string-parsing layer (`MAKEFLAGS`
//! suppression checks, jobserver endpoint extraction/rewriting) that the
//! other three are built on. [`Server`] and [`Proxy`] are driven internally
//! by an `epoll`-based readiness multiplexer ([`Poller`]).
//!
//! ## Example
//!
//! Connect to a jobserver advertised in this process's environment and try
//! to get a token:
//!
//! ```no_run
//! use jobserver_core::Client;
//!
//! let client = unsafe { Client::from_env() }
//!     .expect("failed to read MAKEFLAGS")
//!     .expect("no jobserver advertised");
//!
//! match client.get_token() {
//!     Ok(Some(_token)) => println!("got one"),
//!     Ok(None) => println!("none available right now"),
//!     Err(e) => eprintln!("jobserver error: {e}"),
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

use cfg_if::cfg_if;

pub mod error;
pub mod flags;

cfg_if! {
    if #[cfg(unix)] {
        mod client;
        mod pool;
        mod poller;
        mod proxy;
        mod server;
        mod signal;

        pub use client::{Acquired, Client};
        pub use pool::{ChildId, Token};
        pub use poller::{Interest, Poller, Readiness};
        pub use proxy::Proxy;
        pub use server::{PassFds, PoolSource, Server, WakeReason};
    } else {
        #[path = "unsupported.rs"]
        mod imp;

        pub use imp::{Acquired, Client};
    }
}

pub use error::{Error, Result};
