use color_eyre::{eyre, Result};
use nix::poll::{poll, PollFd, PollFlags};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Readiness mask an fd is registered with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub fn with_write(self, write: bool) -> Interest {
        Interest { write, ..self }
    }

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// What actually fired for a registered fd.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

struct Registration<T> {
    token: T,
    fd: RawFd,
    interest: Interest,
}

/// Single-threaded readiness dispatcher over poll(2).
///
/// The pollfd set is rebuilt from the registration table on every call to
/// [`wait`](EventLoop::wait), so handlers may change any fd's interest mask
/// between iterations and the change takes effect before the next wait.
pub struct EventLoop<T> {
    regs: Vec<Registration<T>>,
}

impl<T: Copy + PartialEq + std::fmt::Debug> EventLoop<T> {
    pub fn new() -> Self {
        Self { regs: Vec::new() }
    }

    pub fn register(&mut self, token: T, fd: RawFd, interest: Interest) {
        debug_assert!(self.regs.iter().all(|r| r.token != token));
        self.regs.push(Registration {
            token,
            fd,
            interest,
        });
    }

    pub fn set_interest(&mut self, token: T, interest: Interest) {
        if let Some(reg) = self.regs.iter_mut().find(|r| r.token == token) {
            reg.interest = interest;
        }
    }

    pub fn unregister(&mut self, token: T) {
        self.regs.retain(|r| r.token != token);
    }

    /// Block until at least one registered fd is ready, then fill `events`
    /// with the (token, readiness) pairs that fired. POLLHUP/POLLERR are
    /// reported as readable so the owner's read path observes the EOF or
    /// error itself.
    pub fn wait(&mut self, events: &mut Vec<(T, Readiness)>) -> Result<()> {
        events.clear();
        let mut fds: Vec<PollFd> = self
            .regs
            .iter()
            .map(|r| PollFd::new(r.fd, r.interest.poll_flags()))
            .collect();
        loop {
            match poll(&mut fds, -1) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(eyre::eyre!("poll: {e}")),
            }
        }
        for (reg, fd) in self.regs.iter().zip(fds.iter()) {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            let readiness = Readiness {
                readable: revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
                writable: revents.contains(PollFlags::POLLOUT),
            };
            if readiness.readable || readiness.writable {
                events.push((reg.token, readiness));
            }
        }
        Ok(())
    }
}

/// A periodic timer surfaced as a pollable fd, replacing the original
/// signal-driven beacon.
pub struct IntervalTimer {
    fd: RawFd,
}

impl IntervalTimer {
    pub fn every(interval: Duration) -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            eyre::bail!("timerfd_create: {}", io::Error::last_os_error());
        }
        let ts = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let timerspec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        let rc = unsafe { libc::timerfd_settime(fd, 0, &timerspec, std::ptr::null_mut()) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            eyre::bail!("timerfd_settime: {e}");
        }
        Ok(Self { fd })
    }

    /// Consume pending expirations; returns how many ticks have fired since
    /// the last drain.
    pub fn drain(&mut self) -> u64 {
        let mut count = [0u8; 8];
        let n = unsafe { libc::read(self.fd, count.as_mut_ptr() as *mut libc::c_void, 8) };
        if n == 8 {
            u64::from_ne_bytes(count)
        } else {
            0
        }
    }
}

impl AsRawFd for IntervalTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd as _;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Tok {
        A,
        B,
    }

    #[test]
    fn test_dispatches_readable_fd() {
        let (rx, tx) = std::os::unix::net::UnixStream::pair().unwrap();
        let (other_rx, _other_tx) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut evloop = EventLoop::new();
        evloop.register(Tok::A, rx.as_raw_fd(), Interest::READ);
        evloop.register(Tok::B, other_rx.as_raw_fd(), Interest::READ);

        use std::io::Write as _;
        (&tx).write_all(b"x").unwrap();

        let mut events = Vec::new();
        evloop.wait(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Tok::A);
        assert!(events[0].1.readable);
    }

    #[test]
    fn test_interval_timer_ticks() {
        let mut timer = IntervalTimer::every(Duration::from_millis(5)).unwrap();
        let mut evloop = EventLoop::new();
        evloop.register(Tok::A, timer.as_raw_fd(), Interest::READ);
        let mut events = Vec::new();
        evloop.wait(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(timer.drain() >= 1);
    }
}
