//! Server downstream, client upstream: relays tokens from an upstream
//! jobserver to a pool of local children, growing and shrinking the local
//! pool to track upstream demand.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::{Acquired, Client};
use crate::error::Result;
use crate::pool::{ChildId, Pool, Token};
use crate::server::{PassFds, PoolSource, Server, WakeReason};

/// A [`PoolSource`] backed by an upstream [`Client`]. Growing asks the
/// upstream for one token; the [`Acquired`] handle is kept alive exactly as
/// long as the minted local id is outstanding, so releasing it back upstream
/// reduces to dropping the handle — byte-faithful by construction, since
/// `Acquired::drop` already is.
#[derive(Debug)]
struct UpstreamPool {
    upstream: Client,
    next_id: Token,
    held: HashMap<Token, Acquired>,
}

impl PoolSource for UpstreamPool {
    fn grow(&mut self, pool: &mut Pool) -> Result<()> {
        if let Some(acquired) = self.upstream.get_token()? {
            let id = self.next_id;
            self.next_id += 1;
            self.held.insert(id, acquired);
            pool.admit_free(id);
        }
        Ok(())
    }

    fn shrink(&mut self, pool: &mut Pool) -> Result<()> {
        // Keep at most one spare free token locally, returning the rest
        // upstream.
        let spare = pool.free_len().saturating_sub(1);
        for token in pool.take_free(spare) {
            self.held.remove(&token);
        }
        Ok(())
    }

    fn drain_all(&mut self, pool: &mut Pool) -> Result<()> {
        let all = pool.free_len();
        for token in pool.take_free(all) {
            self.held.remove(&token);
        }
        Ok(())
    }
}

/// A jobserver that is simultaneously a [`Client`] of an upstream jobserver
/// and a [`Server`] to its own children, relaying tokens between the two.
#[derive(Debug)]
pub struct Proxy {
    server: Server,
}

impl Proxy {
    /// Wrap `upstream` in a proxy with an initially empty local pool.
    pub fn new(upstream: Client) -> Result<Self> {
        let source = Box::new(UpstreamPool {
            upstream,
            next_id: 0,
            held: HashMap::new(),
        });
        Ok(Self {
            server: Server::with_source(0, source)?,
        })
    }

    /// Register a new local child; see [`Server::create_client`].
    pub fn create_client(&mut self) -> Result<(ChildId, PassFds)> {
        self.server.create_client()
    }

    /// The literal flag fragment to hand to a spawned local child; see
    /// [`Server::flags`].
    pub fn flags(&self, pass_fds: PassFds) -> String {
        self.server.flags(pass_fds)
    }

    /// Run one dispatch cycle; see [`Server::poll`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<WakeReason> {
        self.server.poll(timeout)
    }

    /// Tear down a single child; see [`Server::cleanup_client`].
    pub fn cleanup_client(&mut self, child: ChildId, allow_held_tokens: bool) -> Result<()> {
        self.server.cleanup_client(child, allow_held_tokens)
    }

    /// Full teardown: reclaim every child's tokens unconditionally, return
    /// every locally-free token upstream, then drop the upstream client.
    pub fn cleanup(mut self) -> Result<()> {
        for child in self.server.child_ids() {
            self.server.cleanup_client(child, true)?;
        }
        self.server.drain_all_free()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd};

    fn make_pipe_pair() -> (std::fs::File, std::fs::File) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }

    fn upstream_client_and_server_end() -> (Client, std::fs::File, std::fs::File) {
        let (p2c_read, p2c_write) = make_pipe_pair(); // server -> client grants
        let (c2p_read, c2p_write) = make_pipe_pair(); // client -> server returns
        let flags = format!(
            "-j --jobserver-fds={},{}",
            p2c_read.as_raw_fd(),
            c2p_write.as_raw_fd()
        );
        std::mem::forget(p2c_read);
        std::mem::forget(c2p_write);
        let client = Client::from_makeflags(&flags).unwrap();
        (client, p2c_write, c2p_read)
    }

    fn set_nonblocking(fd: i32) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    fn poll_until_readable(proxy: &mut Proxy, child_read: &mut std::fs::File) -> bool {
        for _ in 0..20 {
            proxy.poll(Some(Duration::from_millis(50))).unwrap();
            let mut buf = [0u8; 1];
            match child_read.read(&mut buf) {
                Ok(1) => return true,
                Ok(_) => return false,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        false
    }

    #[test]
    fn grows_local_pool_from_upstream_on_demand() {
        let (upstream, mut upstream_grant, _upstream_return) = upstream_client_and_server_end();
        let mut proxy = Proxy::new(upstream).unwrap();
        let (_child, pass_fds) = proxy.create_client().unwrap();
        let mut child_read = unsafe { std::fs::File::from_raw_fd(pass_fds.p2c_rd) };
        set_nonblocking(child_read.as_raw_fd());

        // First cycle: the proxy grows using the upstream client's own
        // implicit token and relays it straight to the child.
        assert!(
            poll_until_readable(&mut proxy, &mut child_read),
            "proxy never relayed the implicit upstream token"
        );

        // Second cycle: the implicit token is exhausted, so a further grant
        // must come from an actual byte sent over the upstream pipe.
        upstream_grant.write_all(b"+").unwrap();
        assert!(
            poll_until_readable(&mut proxy, &mut child_read),
            "proxy never relayed a real upstream token"
        );
    }
}
