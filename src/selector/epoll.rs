//! Linux `epoll` backend for the selector.
//!
//! The poller runs in level-triggered mode: a descriptor that is still readable
//! (or writable) after a callback returns is reported again on the next wait.
//! An internal `eventfd` is registered permanently so other threads can
//! interrupt a blocking `epoll_wait`.

use super::Interest;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token for the wake-up eventfd. Never collides with a descriptor.
const WAKE_TOKEN: u64 = u64::MAX;

/// Maximum number of readiness events collected per wait.
const MAX_EVENTS: usize = 1024;

/// Waker wraps the eventfd used to interrupt `epoll_wait`
pub(crate) struct Waker(RawFd);

impl Waker {
    /// wake makes the next (or current) `epoll_wait` return immediately
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        let rc = unsafe { libc::write(self.0, &buf as *const u64 as *const _, 8) };

        // A saturated counter still leaves the eventfd readable
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    fn drain(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.0, &mut buf as *mut u64 as *mut _, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Readiness reported for one descriptor by a single wait
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// EpollPoller owns the epoll instance, the wake-up eventfd and the event buffer
pub(crate) struct EpollPoller {
    epoll: RawFd,
    events: Vec<epoll_event>,
    waker: Arc<Waker>,
}

impl EpollPoller {
    /// new creates the epoll instance and registers the wake-up eventfd
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        let waker = Arc::new(Waker(eventfd));
        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        Ok(Self {
            epoll,
            events: Vec::with_capacity(MAX_EVENTS),
            waker,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// add starts watching `fd` for `interest`
    pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    /// modify replaces the interest of an already watched `fd`
    pub(crate) fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    /// delete stops watching `fd`
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut flags = 0;
        if interest.contains(Interest::READ) {
            flags |= EPOLLIN | EPOLLRDHUP;
        }
        if interest.contains(Interest::WRITE) {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// poll blocks until a watched descriptor is ready, the waker fires, or
    /// `timeout` expires. Ready descriptors are appended to `ready`.
    ///
    /// An interrupted wait (EINTR) is reported as an empty round.
    pub(crate) fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            let token = ev.u64;
            let flags = ev.events;

            if token == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }

            // Errors and hang-ups surface through whichever callback is interested;
            // the handler discovers the failure from the syscall it issues
            let failed = flags & ((EPOLLERR | EPOLLHUP) as u32) != 0;
            ready.push(Readiness {
                fd: token as RawFd,
                readable: failed || flags & ((EPOLLIN | EPOLLRDHUP) as u32) != 0,
                writable: failed || flags & (EPOLLOUT as u32) != 0,
            });
        }

        unsafe {
            self.events.set_len(0);
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}
