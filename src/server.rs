//! Lends tokens to children over per-child pipe pairs.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::poller::{Interest, Poller};
use crate::pool::{ChildId, Pool, Token};
use crate::signal::SignalChannel;

const GRANT_BYTE: u8 = b'+';

/// Descriptors a spawned child should inherit across `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassFds {
    /// Read end of the parent-to-child grant pipe.
    pub p2c_rd: RawFd,
    /// Write end of the child-to-parent return pipe.
    pub c2p_wr: RawFd,
}

/// Why [`Server::poll`] returned control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The timeout elapsed with nothing ready.
    Timeout,
    /// At least one fd became ready and was dispatched.
    Ready,
    /// `SIGCHLD` (or another signal feeding the self-pipe) arrived. The
    /// event loop does not act on this itself; it simply returns to its
    /// caller, which is expected to reap dead children and call
    /// [`Server::cleanup_client`].
    Signal,
}

struct ChildRegistration {
    grant: std::fs::File,
    return_pipe: std::fs::File,
    drain: std::fs::File,
}

/// Hook point for what happens when a grant is requested but the free pool
/// is empty. The base `Server` plugs in [`FixedPool`], which never grows;
/// [`crate::Proxy`] plugs in a source backed by its upstream `Client`.
pub trait PoolSource: fmt::Debug {
    /// Attempt to mint one more token and admit it into `pool`'s free list.
    /// A no-op (`Ok(())`, pool left unchanged) is a legitimate "couldn't
    /// grow right now" response.
    fn grow(&mut self, pool: &mut Pool) -> Result<()>;

    /// Called once per poll cycle (and during cleanup) to let the source
    /// give back anything it doesn't need to hold locally. Fixed pools
    /// never shrink.
    fn shrink(&mut self, _pool: &mut Pool) -> Result<()> {
        Ok(())
    }

    /// Give back every free token unconditionally. Only called during final
    /// teardown ([`Proxy::cleanup`](crate::proxy::Proxy::cleanup)); fixed
    /// pools have nowhere to give tokens back to, so this is a no-op.
    fn drain_all(&mut self, _pool: &mut Pool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FixedPool;

impl PoolSource for FixedPool {
    fn grow(&mut self, _pool: &mut Pool) -> Result<()> {
        Ok(())
    }
}

/// Owns a fixed (or, via a [`PoolSource`], growable) pool of tokens and lends
/// them out to registered children over anonymous pipes.
pub struct Server {
    pool: Pool,
    source: Box<dyn PoolSource>,
    children: HashMap<ChildId, ChildRegistration>,
    poller: Poller,
    signals: SignalChannel,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("free", &self.pool.free_len())
            .finish()
    }
}

impl Server {
    /// Create a server owning `num_tokens` tokens, defaulting to
    /// `std::thread::available_parallelism()` when `None`.
    pub fn new(num_tokens: Option<usize>) -> Result<Self> {
        let n = num_tokens.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        });
        Self::with_source(n as u32, Box::new(FixedPool))
    }

    /// Build a server backed by a custom [`PoolSource`]; used by
    /// [`crate::Proxy`] to wrap an upstream `Client`.
    pub(crate) fn with_source(num_tokens: u32, source: Box<dyn PoolSource>) -> Result<Self> {
        let mut poller = Poller::new()?;
        let signals = SignalChannel::new()?;
        poller.register(signals.as_raw_fd(), Interest::READABLE)?;
        Ok(Self {
            pool: Pool::with_capacity(num_tokens),
            source,
            children: HashMap::new(),
            poller,
            signals,
        })
    }

    pub(crate) fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    pub(crate) fn child_ids(&self) -> Vec<ChildId> {
        self.children.keys().copied().collect()
    }

    pub(crate) fn drain_all_free(&mut self) -> Result<()> {
        self.source.drain_all(&mut self.pool)
    }

    /// Register a new child, allocating its p2c/c2p pipe pair.
    ///
    /// Returns the stable [`ChildId`] (the return pipe's fd) and the
    /// [`PassFds`] the caller should expose to the spawned child, e.g. by
    /// embedding them in the string returned by [`Server::flags`].
    pub fn create_client(&mut self) -> Result<(ChildId, PassFds)> {
        let (p2c_rd, p2c_wr) = create_pipe()?;
        let (c2p_rd, c2p_wr) = create_pipe()?;

        set_cloexec(p2c_wr)?;
        set_cloexec(c2p_rd)?;
        set_nonblocking(p2c_wr)?;
        set_nonblocking(c2p_rd)?;

        let drain_fd = cvt(unsafe { libc::dup(p2c_rd) })?;
        set_cloexec(drain_fd)?;
        set_nonblocking(drain_fd)?;

        let grant = unsafe { std::fs::File::from_raw_fd(p2c_wr) };
        let return_pipe = unsafe { std::fs::File::from_raw_fd(c2p_rd) };
        let drain = unsafe { std::fs::File::from_raw_fd(drain_fd) };

        let child: ChildId = c2p_rd;
        self.pool.add_child(child);
        self.poller.register(c2p_rd, Interest::READABLE)?;
        self.poller.register(p2c_wr, Interest::WRITABLE)?;
        self.children.insert(
            child,
            ChildRegistration {
                grant,
                return_pipe,
                drain,
            },
        );

        debug!("server: registered child {child} (pass {p2c_rd},{c2p_wr})");
        Ok((child, PassFds { p2c_rd, c2p_wr }))
    }

    /// The literal `-j --jobserver-fds=R,W` flag fragment to hand to a
    /// spawned child.
    pub fn flags(&self, pass_fds: PassFds) -> String {
        format!("-j --jobserver-fds={},{}", pass_fds.p2c_rd, pass_fds.c2p_wr)
    }

    /// Block up to `timeout` (or indefinitely) for the next batch of ready
    /// descriptors and dispatch them: every readable return pipe before any
    /// writable grant pipe.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<WakeReason> {
        let events = self.poller.poll(timeout)?;
        if events.is_empty() {
            self.source.shrink(&mut self.pool)?;
            return Ok(WakeReason::Timeout);
        }

        let signal_fd = self.signals.as_raw_fd();
        let mut saw_signal = false;

        for &(fd, readiness) in &events {
            if fd == signal_fd {
                if readiness.readable {
                    self.signals.drain()?;
                    saw_signal = true;
                }
                continue;
            }
            if readiness.readable {
                self.dispatch_return(fd)?;
            }
        }

        for &(fd, readiness) in &events {
            if fd == signal_fd {
                continue;
            }
            if readiness.writable {
                self.dispatch_grant(fd)?;
            }
        }

        self.source.shrink(&mut self.pool)?;
        Ok(if saw_signal {
            WakeReason::Signal
        } else {
            WakeReason::Ready
        })
    }

    /// The self-pipe fd the caller should treat as internal plumbing — it is
    /// already registered with this server's poller, exposed only so a
    /// caller embedding several event sources can tell it apart from a
    /// child's fds.
    pub fn signal_fd(&self) -> RawFd {
        self.signals.as_raw_fd()
    }

    fn dispatch_return(&mut self, child: ChildId) -> Result<()> {
        let Some(reg) = self.children.get(&child) else {
            return Ok(());
        };

        let mut buf = [0u8; 1];
        let read_result = (&reg.return_pipe).read(&mut buf);
        match read_result {
            Ok(1) => {
                if self.pool.tokens_of(child).is_empty() {
                    return Err(Error::Protocol(format!(
                        "child {child} returned a token it was never assigned"
                    )));
                }
                let token = self.pool.unassign_oldest(child);
                trace!("server: reclaimed token {token} from child {child}");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch_grant(&mut self, child: ChildId) -> Result<()> {
        let Some(reg) = self.children.get(&child) else {
            return Ok(());
        };
        let grant_fd = reg.grant.as_raw_fd();

        if pending_bytes(grant_fd)? > 0 {
            // A grant is already sitting un-drained; don't pile another on.
            return Ok(());
        }

        let token = match self.pool.assign_next(child) {
            Some(token) => token,
            None => {
                self.source.grow(&mut self.pool)?;
                match self.pool.assign_next(child) {
                    Some(token) => token,
                    None => return Ok(()),
                }
            }
        };

        let reg = self
            .children
            .get(&child)
            .expect("child vanished mid-dispatch");
        match (&reg.grant).write(&[GRANT_BYTE]) {
            Ok(1) => {
                trace!("server: granted token {token} to child {child}");
                Ok(())
            }
            Ok(_) => {
                self.pool.rollback_assign(child, token);
                Ok(())
            }
            Err(e) if is_dead_pipe(&e) => {
                self.pool.rollback_assign(child, token);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted || e.kind() == io::ErrorKind::WouldBlock => {
                self.pool.rollback_assign(child, token);
                Ok(())
            }
            Err(e) => {
                self.pool.rollback_assign(child, token);
                Err(e.into())
            }
        }
    }

    /// Tear down a child's bookkeeping: drain its return pipe to EOF,
    /// reclaiming one token per byte read, then discard any un-drained
    /// grant. `allow_held_tokens` must be set if the child may legitimately
    /// still own tokens when this is called (e.g. [`crate::Proxy`]'s own
    /// cleanup, which reclaims unconditionally).
    pub fn cleanup_client(&mut self, child: ChildId, allow_held_tokens: bool) -> Result<()> {
        let reg = self
            .children
            .remove(&child)
            .ok_or_else(|| Error::Protocol(format!("cleanup of unknown child {child}")))?;

        self.poller.unregister(child)?;
        self.poller.unregister(reg.grant.as_raw_fd())?;

        let mut buf = [0u8; 128];
        loop {
            match (&reg.return_pipe).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for _ in 0..n {
                        if !self.pool.tokens_of(child).is_empty() {
                            self.pool.unassign_oldest(child);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let pending = pending_bytes(reg.drain.as_raw_fd())?;
        if pending > 0 {
            let mut discard = vec![0u8; pending];
            if let Ok(n) = (&reg.drain).read(&mut discard) {
                for _ in 0..n {
                    if !self.pool.tokens_of(child).is_empty() {
                        self.pool.unassign_oldest(child);
                    }
                }
            }
        }

        let remaining = self.pool.tokens_of(child).len();
        if remaining > 0 {
            if !allow_held_tokens {
                return Err(Error::Protocol(format!(
                    "child {child} exited holding {remaining} token(s)"
                )));
            }
            self.pool.force_reclaim_all(child);
        }

        self.pool.remove_child(child);
        debug!("server: cleaned up child {child}");
        Ok(())
    }
}

fn is_dead_pipe(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    ) || matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET))
}

fn pending_bytes(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    cvt(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) })?;
    Ok(n as usize)
}

fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok((fds[0], fds[1]))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
