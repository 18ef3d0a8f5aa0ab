//! Blocking waits on OS socket readiness.
//!
//! Everything that retries a non-blocking socket operation parks here instead of
//! sleeping in a loop.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        // A hung-up or errored descriptor is reported readable so the next read observes
        // the close or the error instead of the caller waiting forever.
        let hangup = revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
        Self {
            readable: revents & libc::POLLIN != 0 || hangup,
            writable: revents & libc::POLLOUT != 0,
            hangup,
        }
    }
}

/// Waits until at least one descriptor is ready or the timeout elapses. `None` waits
/// indefinitely.
pub fn poll_many(
    targets: &[(RawFd, Interest)],
    timeout: Option<Duration>,
) -> io::Result<Vec<Readiness>> {
    let mut fds: Vec<libc::pollfd> = targets
        .iter()
        .map(|(fd, interest)| libc::pollfd {
            fd: *fd,
            events: interest.events(),
            revents: 0,
        })
        .collect();
    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(duration) => duration.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    loop {
        // SAFETY: `fds` is a live, correctly sized buffer of pollfd records for the
        // duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(fds
        .iter()
        .map(|entry| Readiness::from_revents(entry.revents))
        .collect())
}

pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let ready = poll_many(&[(fd, Interest::READABLE)], timeout)?;
    Ok(ready.first().map(|r| r.readable).unwrap_or(false))
}

pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let ready = poll_many(&[(fd, Interest::WRITABLE)], timeout)?;
    Ok(ready
        .first()
        .map(|r| r.writable || r.hangup)
        .unwrap_or(false))
}
