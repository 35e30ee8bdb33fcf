use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

/// The readiness an fd is registered for.
///
/// Registrations are level-triggered; the fd lower layer toggles the
/// bits as callbacks are enabled and disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interests {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) except: bool,
}

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: a successful `epoll_create1(2)` hands us a descriptor
        // we now own.
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        // `epoll_wait(2)` only takes whole milliseconds. A non-zero
        // timeout below a millisecond must round up, not down to a busy
        // poll; a zero timeout stays zero so callers can probe.
        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => {
                let millis = timeout.as_millis().min(libc::c_int::MAX as u128 - 1) as libc::c_int;
                if Duration::from_millis(millis as u64) < timeout {
                    millis + 1
                } else {
                    millis
                }
            }
        };

        events.clear();
        let filled = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timeout_ms,
        ))?;
        // SAFETY: the kernel initialised the first `filled` entries.
        unsafe { events.set_len(filled as usize) };
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, interests: Interests) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, interests: Interests) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

fn interests_to_epoll(interests: Interests) -> u32 {
    let mut kind = 0;

    if interests.read {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interests.write {
        kind |= EPOLLOUT;
    }

    if interests.except {
        kind |= EPOLLPRI;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use std::os::fd::RawFd;

    use super::*;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        // Errors and hangups are delivered to the read path so the user
        // observes them through a failing `read`.
        (event.events as libc::c_int & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR)) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & (EPOLLOUT | EPOLLHUP | EPOLLERR)) != 0
    }

    pub(crate) fn is_priority(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLPRI) != 0
    }
}
