//! The OS-services layer the stream core runs on.
//!
//! The fd lower layer never talks to the operating system directly; it
//! consumes the [`OsFuncs`] contract: readiness registration for
//! descriptors, deferred runners and one-shot timers. This keeps the
//! state machines portable across event sources and lets tests supply
//! their own scheduling. [`unix::UnixOsFuncs`] is the epoll-backed
//! production implementation.
//!
//! Two rules shape the contract:
//!
//! - Callbacks on a [`FdHandler`] are serialised per descriptor, and
//!   `cleared` is only delivered once no other callback for that
//!   descriptor is in flight.
//! - Work handed to [`OsFuncs::run`] and [`OsFuncs::start_timer`] runs
//!   outside any callback stack and outside any lock the caller holds.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[cfg(unix)]
pub mod unix;

/// A unit of work queued to run outside any callback stack and any held
/// lock. The closure's captures are the references that keep its target
/// alive while it is queued.
pub type DeferredWork = Box<dyn FnOnce() + Send>;

/// Per-descriptor readiness receiver installed with
/// [`OsFuncs::set_fd_handlers`].
pub trait FdHandler: Send + Sync {
    /// The descriptor will not block for a read.
    fn read_ready(self: Arc<Self>, fd: RawFd);
    /// The descriptor will not block for a write.
    fn write_ready(self: Arc<Self>, fd: RawFd);
    /// Exceptional condition (urgent data) on the descriptor.
    fn except_ready(self: Arc<Self>, fd: RawFd);
    /// All handlers for `fd` are unregistered and no callback for it is
    /// in flight. Answers [`OsFuncs::clear_fd_handlers`].
    fn cleared(self: Arc<Self>, fd: RawFd);
}

/// The operations the stream core needs from the operating system.
pub trait OsFuncs: Send + Sync {
    /// Install `handler` as the readiness receiver for `fd`. All
    /// interests start disabled. The registration holds a reference on
    /// `handler` until [`FdHandler::cleared`] has been delivered.
    fn set_fd_handlers(&self, fd: RawFd, handler: Arc<dyn FdHandler>) -> io::Result<()>;

    /// Unregister `fd`. Asynchronous: the registration is torn down
    /// immediately, but the moment no callback is in flight is reported
    /// via [`FdHandler::cleared`].
    fn clear_fd_handlers(&self, fd: RawFd);

    /// Unregister `fd` without a `cleared` report. Only valid from
    /// within a callback for `fd` itself (the connect-retry path), where
    /// "no callback in flight" holds by construction.
    fn clear_fd_handlers_norpt(&self, fd: RawFd);

    /// Enable or disable read-readiness callbacks for `fd`.
    fn set_read_handler(&self, fd: RawFd, enable: bool);
    /// Enable or disable write-readiness callbacks for `fd`.
    fn set_write_handler(&self, fd: RawFd, enable: bool);
    /// Enable or disable exceptional-condition callbacks for `fd`.
    fn set_except_handler(&self, fd: RawFd, enable: bool);

    /// Queue `work` to run from the event loop, outside any callback.
    fn run(&self, work: DeferredWork);

    /// Queue `work` to run from the event loop once `after` has elapsed.
    fn start_timer(&self, after: Duration, work: DeferredWork);
}

/// A wake-counter for blocking façades: issue an asynchronous call whose
/// completion calls [`Waiter::wake`], then [`Waiter::wait`] for it.
#[derive(Debug, Default)]
pub struct Waiter {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter::default()
    }

    /// Post one wake-up. Never blocks; may be called from any context,
    /// including completion callbacks.
    pub fn wake(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until a wake-up is available and consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}
