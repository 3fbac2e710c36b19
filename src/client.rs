//! Consumer of tokens from an upstream jobserver.
//!
//! A `Client` keeps no central ledger of held tokens: the ledger *is* the
//! set of live [`Acquired`] values the caller is holding, and each one
//! releases itself (byte-faithfully) when dropped. There is therefore no
//! explicit "return everything" call to implement — there is nothing left
//! to return once every `Acquired` has been dropped.

use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flags;

/// How long a single bounded read is allowed to block before the client
/// gives up and reports no token available.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serializes access to `SIGALRM`/the interval timer, both of which are
/// process-global state.
static ALARM_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug)]
struct ClientInner {
    read: std::fs::File,
    write: std::fs::File,
    /// Whether the one implicit token is currently free to hand out. Starts
    /// `true`; flips to `false` while an [`Acquired`] representing it is
    /// outstanding.
    implicit_available: AtomicBool,
}

/// A consumer of an upstream jobserver's token pool.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// A token held by a [`Client`]. Releases it back (byte-faithfully, unless
/// it is the implicit token) when dropped.
#[derive(Debug)]
pub struct Acquired {
    client: Option<Arc<ClientInner>>,
    /// `None` for the implicit token (never travels the wire); `Some(byte)`
    /// for a real token, carrying the exact byte this client read so the
    /// eventual return is byte-faithful.
    byte: Option<u8>,
}

impl Acquired {
    /// Drop this token without releasing it back to the jobserver. Useful
    /// when ownership of the permission is being handed off to something
    /// that cannot hold an `Acquired` directly (e.g. a spawned child that
    /// will return the token itself over its own pipe).
    pub fn drop_without_releasing(mut self) {
        self.client = None;
    }

    /// `true` if this is the implicit token every process is born with.
    pub fn is_implicit(&self) -> bool {
        self.byte.is_none()
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else { return };
        match self.byte {
            None => client.implicit_available.store(true, Ordering::Release),
            Some(byte) => {
                let _ = write_all_retrying(&client.write, byte);
            }
        }
    }
}

impl Client {
    /// Parse `flags` (a `MAKEFLAGS`-shaped string) and open the jobserver it
    /// advertises. Fails with [`Error::Config`] if none is advertised.
    pub fn from_makeflags(flags: &str) -> Result<Self> {
        let (read_fd, write_fd) = flags::extract_fds(flags)?
            .ok_or_else(|| Error::Config("no jobserver advertised in flags".into()))?;

        // Safety: `extract_fds` already validated these are > 2; ownership
        // of the fds transfers to the File wrappers below.
        let read = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let write = unsafe { std::fs::File::from_raw_fd(write_fd) };

        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                read,
                write,
                implicit_available: AtomicBool::new(true),
            }),
        })
    }

    /// Attempt to connect to the jobserver advertised in this process's
    /// environment (`MAKEFLAGS`, falling back to `CARGO_MAKEFLAGS`/`MFLAGS`).
    /// `Ok(None)` if no environment variable names a jobserver at all.
    ///
    /// # Safety
    ///
    /// Transitively takes ownership of inherited file descriptors via
    /// `from_raw_fd`; see [`Client::from_makeflags`].
    pub unsafe fn from_env() -> Result<Option<Self>> {
        let var = std::env::var("MAKEFLAGS")
            .or_else(|_| std::env::var("CARGO_MAKEFLAGS"))
            .or_else(|_| std::env::var("MFLAGS"))
            .ok();

        match var {
            Some(flags) if flags::has_jobserver(&flags) => Self::from_makeflags(&flags).map(Some),
            _ => Ok(None),
        }
    }

    /// Attempt to obtain one token, waiting at most ~100ms.
    ///
    /// Returns `Ok(None)` if no token became available in that window
    /// (retryable: the caller should try again, typically on its own event
    /// loop's next cycle). Returns `Err(Error::Protocol(_))` if the upstream
    /// jobserver pipe has closed (EOF): that is fatal, not retryable.
    pub fn get_token(&self) -> Result<Option<Acquired>> {
        if self
            .inner
            .implicit_available
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(Some(Acquired {
                client: Some(self.inner.clone()),
                byte: None,
            }));
        }

        match self.read_with_timeout()? {
            Some(byte) => Ok(Some(Acquired {
                client: Some(self.inner.clone()),
                byte: Some(byte),
            })),
            None => Ok(None),
        }
    }

    fn read_with_timeout(&self) -> Result<Option<u8>> {
        let _guard = ALARM_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let old_handler = install_alarm_handler()?;
        let restore = scopeguard::guard(old_handler, |old| {
            // The handler must be reinstated on every exit path. Best-effort:
            // there is nothing sensible to do if restoring the old handler
            // itself fails.
            let _ = restore_alarm_handler(old);
        });

        arm_timer(READ_TIMEOUT)?;

        let mut buf = [0u8; 1];
        let outcome = (&self.inner.read).read(&mut buf);

        disarm_timer();
        drop(restore);

        match outcome {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Err(Error::Protocol(
                "EOF reading from upstream jobserver pipe".into(),
            )),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_all_retrying(mut write: &std::fs::File, byte: u8) -> io::Result<()> {
    loop {
        match write.write(&[byte]) {
            Ok(1) => return Ok(()),
            Ok(0) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
            Ok(_) => unreachable!("write of a 1-byte buffer returned > 1"),
        }
    }
}

extern "C" fn noop_signal_handler(_: c_int) {}

fn install_alarm_handler() -> io::Result<libc::sigaction> {
    unsafe {
        let mut new: libc::sigaction = std::mem::zeroed();
        new.sa_sigaction = noop_signal_handler as usize;
        libc::sigemptyset(&mut new.sa_mask);
        // Deliberately no SA_RESTART: the point of the alarm is to make the
        // blocking `read` return EINTR.
        new.sa_flags = 0;

        let mut old = MaybeUninit::<libc::sigaction>::uninit();
        cvt(libc::sigaction(libc::SIGALRM, &new, old.as_mut_ptr()))?;
        Ok(old.assume_init())
    }
}

fn restore_alarm_handler(old: libc::sigaction) -> io::Result<()> {
    cvt(unsafe { libc::sigaction(libc::SIGALRM, &old, ptr::null_mut()) })?;
    Ok(())
}

fn arm_timer(timeout: Duration) -> io::Result<()> {
    let it = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        },
    };
    cvt(unsafe { libc::setitimer(libc::ITIMER_REAL, &it, ptr::null_mut()) })?;
    Ok(())
}

/// Disarm the timer, retrying if doing so is itself interrupted.
fn disarm_timer() {
    let zero = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    loop {
        match cvt(unsafe { libc::setitimer(libc::ITIMER_REAL, &zero, ptr::null_mut()) }) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
