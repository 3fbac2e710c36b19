//! Thin wrapper over `epoll`, the readiness multiplexer the [`crate::Server`]
//! event loop is built on.
//!
//! Level-triggered: `EPOLLET` is deliberately not set. A level-triggered
//! fd stays ready across polls until fully drained, which matches how the
//! event loop checks `FIONREAD` before issuing a grant rather than relying
//! on a single edge notification it could otherwise miss.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

/// Which direction(s) of readiness a caller wants notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };

    fn to_epoll_events(self) -> u32 {
        let mut events = 0;
        if self.readable {
            events |= libc::EPOLLIN as u32;
        }
        if self.writable {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// A single fd's readiness as reported by a `poll()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_epoll_events(events: u32) -> Self {
        Self {
            readable: events & (libc::EPOLLIN as u32) != 0,
            writable: events & (libc::EPOLLOUT as u32) != 0,
            hangup: events & (libc::EPOLLHUP as u32) != 0,
            error: events & (libc::EPOLLERR as u32) != 0,
        }
    }

    fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

/// Edge/level readiness surface over a set of file descriptors.
#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
    // Tracked purely so `unregister` can tell "already gone" apart from
    // "never registered" without erroring either way.
    registered: HashMap<RawFd, Interest>,
}

impl Poller {
    /// Create a new, empty poller.
    pub fn new() -> io::Result<Self> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epoll_fd,
            registered: HashMap::new(),
        })
    }

    /// Subscribe `fd` to the given interest set.
    ///
    /// Pre-condition: `fd` is not already registered with this poller.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        debug_assert!(!self.registered.contains_key(&fd), "fd {fd} registered twice");

        let mut event = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };
        cvt(unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        self.registered.insert(fd, interest);
        trace!("poller: registered fd {fd} for {interest:?}");
        Ok(())
    }

    /// Remove `fd`. Tolerates the descriptor having already been closed: the
    /// kernel drops an fd's epoll registration automatically when its last
    /// reference is closed, so a subsequent `epoll_ctl(EPOLL_CTL_DEL)` would
    /// fail with `ENOENT`. That is not an error from this method's point of
    /// view, it's the expected outcome of "closed-but-not-yet-unregistered".
    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Ok(());
        }

        let mut event = libc::epoll_event { events: 0, u64: 0 };
        match cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) }) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) || e.raw_os_error() == Some(libc::EBADF) => {
                trace!("poller: fd {fd} already gone at unregister time");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Block up to `timeout` (or indefinitely, if `None`) and return every
    /// descriptor that became ready along with its readiness.
    ///
    /// An empty readiness set for a yielded fd is an assertion failure: it
    /// would mean the kernel woke us up for nothing.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Readiness)>> {
        let timeout_ms: i32 = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered.len().max(16)];

        let n = loop {
            match cvt(unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            }) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        let mut out = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            let readiness = Readiness::from_epoll_events(event.events);
            debug_assert!(!readiness.is_empty(), "empty event set for fd {fd}");
            trace!("poller: fd {fd} ready: {readiness:?}");
            out.push((fd, readiness));
        }
        Ok(out)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn register_and_poll_pipe_readable() {
        let (read, mut write) = os_pipe();
        let mut poller = Poller::new().unwrap();
        poller.register(read.as_raw_fd(), Interest::READABLE).unwrap();

        use std::io::Write as _;
        write.write_all(b"x").unwrap();

        let events = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, read.as_raw_fd());
        assert!(events[0].1.readable);
    }

    #[test]
    fn poll_times_out_with_nothing_ready() {
        let (read, _write) = os_pipe();
        let mut poller = Poller::new().unwrap();
        poller.register(read.as_raw_fd(), Interest::READABLE).unwrap();

        let events = poller.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unregister_tolerates_closed_fd() {
        let (read, _write) = os_pipe();
        let fd = read.as_raw_fd();
        let mut poller = Poller::new().unwrap();
        poller.register(fd, Interest::READABLE).unwrap();
        drop(read);
        // fd is closed; epoll already dropped it. Must not error.
        poller.unregister(fd).unwrap();
    }

    fn os_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }
}
