//! The fd lower layer: a readiness-driven state machine around one OS
//! descriptor.
//!
//! [`FdStream`] is the uniform stream handle. A transport plugs in as a
//! [`FdOps`] strategy; the lower layer owns the lifecycle
//! (closed → opening → open → closing), the buffered read delivery and
//! the callback protocol:
//!
//! - no user callback is invoked with the stream's lock held;
//! - no callback recurses or runs twice concurrently for one stream;
//! - work that would otherwise run inside a user call or a callback is
//!   bounced through a deferred-op trampoline on the OS-services layer.

use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::os::{FdHandler, OsFuncs};
use crate::sys;

/// One-shot completion for [`FdStream::open`].
pub type OpenDone = Box<dyn FnOnce(io::Result<()>) + Send>;

/// One-shot completion for [`FdStream::close`].
pub type CloseDone = Box<dyn FnOnce() + Send>;

/// Outcome of a transport's attempt to produce a connected descriptor.
#[derive(Debug, Clone, Copy)]
pub enum OpenResult {
    /// The descriptor is connected and usable as-is.
    Ready(RawFd),
    /// The connect is in flight; write-readiness on the descriptor
    /// signals the outcome.
    InProgress(RawFd),
}

/// Close-progress notifications passed to [`FdOps::check_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    /// A close has been requested on the stream.
    Start,
    /// The readiness handlers are gone; asked until the strategy stops
    /// returning a poll timeout.
    Done,
}

fn not_supported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTSUP)
}

/// Strategy hooks a transport plugs into the fd lower layer.
///
/// Only `raddr_to_str` is required; every other hook defaults to "not
/// supported" (or, for [`check_close`](FdOps::check_close), "done
/// immediately"), so a transport implements exactly the capabilities it
/// has.
pub trait FdOps: Send + Sync {
    /// Produce a descriptor for an outbound open. Strategies without an
    /// active open (server-side connections) leave the default.
    fn sub_open(&self) -> io::Result<OpenResult> {
        Err(not_supported())
    }

    /// Determine the outcome of an in-progress open once the descriptor
    /// reports write-readiness.
    fn check_open(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    /// Produce the next candidate descriptor after a failed open
    /// attempt.
    fn retry_open(&self) -> io::Result<OpenResult> {
        Err(not_supported())
    }

    /// Format the remote end as a human-readable string.
    fn raddr_to_str(&self) -> io::Result<String>;

    /// The remote socket address.
    fn get_raddr(&self) -> io::Result<SocketAddr> {
        Err(not_supported())
    }

    /// A transport-specific identifier for the remote end.
    fn remote_id(&self) -> io::Result<i32> {
        Err(not_supported())
    }

    /// Observe close progress. Returning `Some(timeout)` from the
    /// [`CloseState::Done`] probe asks to be probed again after
    /// `timeout`; `None` lets the close finish.
    fn check_close(&self, _state: CloseState) -> Option<Duration> {
        None
    }
}

/// The upper layer's receiver for stream events. Callbacks are invoked
/// without any internal lock held and never overlap for one stream.
pub trait StreamCallbacks: Send + Sync {
    /// Deliver received bytes, or the error that ended the stream
    /// (`EPIPE` for an orderly remote close). Returns how many of the
    /// delivered bytes were consumed; the remainder is held and
    /// redelivered.
    fn read(&self, data: io::Result<&[u8]>) -> usize;

    /// The descriptor can accept another write.
    fn write_ready(&self);

    /// An urgent (out-of-band) byte arrived. In-band data is unaffected
    /// and arrives through [`read`](StreamCallbacks::read).
    fn urgent(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    InOpen,
    Open,
    InClose,
}

struct Locked {
    state: State,
    fd: RawFd,

    read_enabled: bool,
    write_enabled: bool,

    cbs: Option<Arc<dyn StreamCallbacks>>,

    open_done: Option<OpenDone>,
    open_err: Option<io::Error>,

    close_done: Option<CloseDone>,

    read_pos: usize,
    read_len: usize,
    in_read: bool,

    deferred_op_pending: bool,
    deferred_read: bool,
    deferred_close: bool,
}

struct FdInner {
    os: Arc<dyn OsFuncs>,
    ops: Box<dyn FdOps>,

    // The hold buffer lives outside the mutex so a delivery can borrow
    // it across the unlocked callback. See the SAFETY notes at the
    // access sites.
    read_data: UnsafeCell<Box<[u8]>>,

    st: Mutex<Locked>,
}

// SAFETY: `read_data` is only touched while holding `st` or from the
// single read cycle that set `in_read` under the lock; the state machine
// admits one read cycle at a time.
unsafe impl Sync for FdInner {}

/// The user-visible stream handle.
///
/// The handle shares the stream with any in-flight deferred operation
/// and with the OS-services registration; the stream is destroyed at the
/// last release, after it has reached the closed state.
pub struct FdStream {
    inner: Arc<FdInner>,
}

impl FdStream {
    /// Create a closed stream around `ops`. [`FdStream::open`] produces
    /// the descriptor.
    pub fn new(os: Arc<dyn OsFuncs>, ops: Box<dyn FdOps>, max_read_size: usize) -> FdStream {
        FdStream {
            inner: FdInner::alloc(os, ops, -1, max_read_size),
        }
    }

    /// Wrap an already-established descriptor, producing a stream in the
    /// open state. The caller keeps ownership of `fd` on error.
    pub fn from_open_fd(
        os: Arc<dyn OsFuncs>,
        ops: Box<dyn FdOps>,
        fd: RawFd,
        max_read_size: usize,
    ) -> io::Result<FdStream> {
        let inner = FdInner::alloc(os, ops, fd, max_read_size);
        setup_handlers(&inner, fd)?;
        Ok(FdStream { inner })
    }

    /// Install the upper-layer receiver. Must precede the first open.
    pub fn set_callbacks(&self, cbs: Arc<dyn StreamCallbacks>) {
        self.inner.lock().cbs = Some(cbs);
    }

    /// Attempt one non-blocking write. A full transmit queue counts as
    /// zero bytes written, not an error; a zero-length `buf` performs no
    /// system call.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let st = self.inner.lock();
        loop {
            match sys::unix::write(st.fd, buf) {
                Ok(0) => return Err(io::Error::from_raw_os_error(libc::EPIPE)),
                Ok(n) => return Ok(n),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }

    /// Start opening the stream. `done` is delivered exactly once —
    /// after the transport connected, or with the failure that ended the
    /// attempt — unless the open is cancelled by
    /// [`close`](FdStream::close) first. Never calls `done` from inside
    /// `open` itself.
    pub fn open(&self, done: OpenDone) -> io::Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();

        if st.cbs.is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if st.state != State::Closed {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let result = inner.ops.sub_open()?;
        let (fd, in_progress) = match result {
            OpenResult::Ready(fd) => (fd, false),
            OpenResult::InProgress(fd) => (fd, true),
        };

        st.fd = fd;
        if let Err(err) = setup_handlers(inner, fd) {
            sys::unix::close(fd);
            st.fd = -1;
            return Err(err);
        }

        st.open_done = Some(done);
        if in_progress {
            st.state = State::InOpen;
            inner.os.set_write_handler(fd, true);
        } else {
            // Completed on the spot; deliver the completion from the
            // trampoline so the caller never observes it re-entering.
            st.state = State::Open;
            let me = Arc::clone(inner);
            inner.os.run(Box::new(move || {
                let st = me.lock();
                if st.state == State::Open && st.open_done.is_some() {
                    drop(finish_open(&me, st, None));
                }
            }));
        }
        Ok(())
    }

    /// Start closing the stream. Legal while open or opening; `done`
    /// fires once the descriptor is gone and every in-flight callback
    /// has returned. Closing an opening stream cancels the open.
    pub fn close(&self, done: CloseDone) -> io::Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();
        match st.state {
            State::Open | State::InOpen => {
                st.close_done = Some(done);
                start_close(inner, &mut st);
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EBUSY)),
        }
    }

    /// Enable or disable delivery of read (and urgent) callbacks.
    /// Enabling with held data schedules a redelivery; the callback is
    /// never invoked from inside this call.
    pub fn set_read_callback_enable(&self, enabled: bool) {
        let inner = &self.inner;
        let mut st = inner.lock();
        st.read_enabled = enabled;

        if st.in_read || st.state != State::Open || (st.read_len > 0 && !enabled) {
            // Applied when the running cycle or the open path finishes.
        } else if st.read_len > 0 {
            // Deliver from the trampoline to avoid lock nesting in the
            // caller.
            st.in_read = true;
            st.deferred_read = true;
            sched_deferred_op(inner, &mut st);
        } else {
            let fd = st.fd;
            inner.os.set_read_handler(fd, enabled);
            inner.os.set_except_handler(fd, enabled);
        }
    }

    /// Enable or disable delivery of write-ready callbacks.
    pub fn set_write_callback_enable(&self, enabled: bool) {
        let inner = &self.inner;
        let mut st = inner.lock();
        st.write_enabled = enabled;
        if st.state == State::Open || st.state == State::InOpen {
            inner.os.set_write_handler(st.fd, enabled);
        }
    }

    /// Format the remote end as a string.
    pub fn raddr_to_str(&self) -> io::Result<String> {
        self.inner.ops.raddr_to_str()
    }

    /// The remote socket address, for transports that have one.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.inner.ops.get_raddr()
    }

    /// A transport-specific remote identifier, for transports that have
    /// one.
    pub fn remote_id(&self) -> io::Result<i32> {
        self.inner.ops.remote_id()
    }
}

impl fmt::Debug for FdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("FdStream")
            .field("fd", &st.fd)
            .field("state", &st.state)
            .finish()
    }
}

impl FdInner {
    fn alloc(
        os: Arc<dyn OsFuncs>,
        ops: Box<dyn FdOps>,
        fd: RawFd,
        max_read_size: usize,
    ) -> Arc<FdInner> {
        Arc::new(FdInner {
            os,
            ops,
            read_data: UnsafeCell::new(vec![0; max_read_size].into_boxed_slice()),
            st: Mutex::new(Locked {
                state: if fd < 0 { State::Closed } else { State::Open },
                fd,
                read_enabled: false,
                write_enabled: false,
                cbs: None,
                open_done: None,
                open_err: None,
                close_done: None,
                read_pos: 0,
                read_len: 0,
                in_read: false,
                deferred_op_pending: false,
                deferred_read: false,
                deferred_close: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Locked> {
        self.st.lock().unwrap()
    }
}

impl FdHandler for FdInner {
    fn read_ready(self: Arc<Self>, _fd: RawFd) {
        handle_incoming(&self, false);
    }

    fn write_ready(self: Arc<Self>, _fd: RawFd) {
        handle_write_ready(&self);
    }

    fn except_ready(self: Arc<Self>, _fd: RawFd) {
        handle_incoming(&self, true);
    }

    fn cleared(self: Arc<Self>, _fd: RawFd) {
        close_poll(&self);
    }
}

fn setup_handlers(inner: &Arc<FdInner>, fd: RawFd) -> io::Result<()> {
    let handler: Arc<dyn FdHandler> = inner.clone();
    inner.os.set_fd_handlers(fd, handler)
}

fn sched_deferred_op(inner: &Arc<FdInner>, st: &mut Locked) {
    if !st.deferred_op_pending {
        st.deferred_op_pending = true;
        let me = Arc::clone(inner);
        inner.os.run(Box::new(move || deferred_op(&me)));
    }
}

/// Hand the held bytes (or a read error) to the user, with the lock
/// released for the duration of the callback, and account for what was
/// consumed.
fn deliver_read_data<'a>(
    inner: &'a FdInner,
    mut st: MutexGuard<'a, Locked>,
    err: Option<io::Error>,
) -> MutexGuard<'a, Locked> {
    if err.is_none() && st.read_len == 0 {
        return st;
    }
    let cbs = match st.cbs.clone() {
        Some(cbs) => cbs,
        None => return st,
    };

    let failed = err.is_some();
    let pos = st.read_pos;
    let len = st.read_len;
    // SAFETY: `in_read` is set for this cycle; no other cycle can touch
    // the hold buffer until it ends, and the user only borrows the
    // slice for the duration of the callback.
    let data: &[u8] = unsafe { &(&*inner.read_data.get())[pos..pos + len] };

    drop(st);
    let count = match err {
        Some(err) => cbs.read(Err(err)),
        None => cbs.read(Ok(data)),
    };
    st = inner.lock();

    if failed || count >= st.read_len {
        st.read_pos = 0;
        st.read_len = 0;
    } else {
        st.read_pos += count;
        st.read_len -= count;
    }
    st
}

fn start_close(inner: &FdInner, st: &mut Locked) {
    let _ = inner.ops.check_close(CloseState::Start);
    st.state = State::InClose;
    inner.os.clear_fd_handlers(st.fd);
}

/// Leave the opening state. On success the stored completion fires and
/// the user's intents are applied to the descriptor. On failure with a
/// live descriptor the stream walks through the close path, which
/// delivers the completion once the descriptor is gone; with no
/// descriptor left (the retry walked off the address list) the failure
/// is reported directly.
fn finish_open<'a>(
    inner: &'a Arc<FdInner>,
    mut st: MutexGuard<'a, Locked>,
    err: Option<io::Error>,
) -> MutexGuard<'a, Locked> {
    if let Some(err) = err {
        if st.fd >= 0 {
            st.open_err = Some(err);
            start_close(inner, &mut st);
            return st;
        }
        st.state = State::Closed;
        if let Some(done) = st.open_done.take() {
            drop(st);
            done(Err(err));
            st = inner.lock();
        }
        return st;
    }

    st.state = State::Open;
    if let Some(done) = st.open_done.take() {
        drop(st);
        done(Ok(()));
        st = inner.lock();
    }

    if st.state == State::Open {
        let fd = st.fd;
        if st.read_enabled {
            inner.os.set_read_handler(fd, true);
            inner.os.set_except_handler(fd, true);
        }
        if st.write_enabled {
            inner.os.set_write_handler(fd, true);
        }
    }
    st
}

fn finish_close<'a>(inner: &'a FdInner, mut st: MutexGuard<'a, Locked>) -> MutexGuard<'a, Locked> {
    st.state = State::Closed;
    if let Some(done) = st.close_done.take() {
        drop(st);
        done();
        st = inner.lock();
    }
    st
}

/// The deferred-op trampoline. Runs queued close completion, then any
/// queued redelivery, then re-applies the user's intents.
fn deferred_op(inner: &Arc<FdInner>) {
    let mut st = inner.lock();

    if st.deferred_close {
        st.deferred_close = false;
        st = finish_close(inner, st);
    }

    if st.deferred_read {
        st.deferred_read = false;
        st = deliver_read_data(inner, st, None);
        st.in_read = false;
    }

    st.deferred_op_pending = false;

    if st.state == State::Open {
        let fd = st.fd;
        if st.read_enabled && st.read_len > 0 {
            // Still-held bytes go back through the trampoline, not the
            // readiness source.
            st.in_read = true;
            st.deferred_read = true;
            sched_deferred_op(inner, &mut st);
        } else {
            inner.os.set_read_handler(fd, st.read_enabled);
            inner.os.set_except_handler(fd, st.read_enabled);
        }
        inner.os.set_write_handler(fd, st.write_enabled);
    }
}

/// A read or urgent readiness event: run one read cycle.
fn handle_incoming(inner: &Arc<FdInner>, urgent: bool) {
    let mut st = inner.lock();

    let fd = st.fd;
    inner.os.set_read_handler(fd, false);
    inner.os.set_except_handler(fd, false);
    if st.in_read {
        // A cycle is running; it restores the interest when it ends.
        return;
    }
    st.in_read = true;

    if urgent {
        sys::unix::drain_oob(fd);
        if let Some(cbs) = st.cbs.clone() {
            drop(st);
            cbs.urgent();
            st = inner.lock();
        }
    }

    let mut err = None;
    if st.read_len == 0 {
        // SAFETY: `in_read` is ours; nothing else touches the hold
        // buffer until the cycle ends.
        let buf: &mut [u8] = unsafe { &mut *inner.read_data.get() };
        loop {
            match sys::unix::read(fd, buf) {
                Ok(0) => {
                    err = Some(io::Error::from_raw_os_error(libc::EPIPE));
                    break;
                }
                Ok(n) => {
                    st.read_pos = 0;
                    st.read_len = n;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
    }

    st = deliver_read_data(inner, st, err);
    st.in_read = false;

    if st.state == State::Open && st.read_enabled {
        if st.read_len == 0 {
            inner.os.set_read_handler(fd, true);
            inner.os.set_except_handler(fd, true);
        } else {
            // Consumable bytes remain; redeliver once the stack
            // unwinds rather than re-arming readiness.
            st.in_read = true;
            st.deferred_read = true;
            sched_deferred_op(inner, &mut st);
        }
    }
}

/// A write readiness event: either the completion signal for an
/// in-progress open, or a plain write-ready notification for the user.
fn handle_write_ready(inner: &Arc<FdInner>) {
    let mut st = inner.lock();
    if st.fd >= 0 {
        inner.os.set_write_handler(st.fd, false);
    }

    if st.state == State::InOpen {
        let check = inner.ops.check_open(st.fd);
        match check {
            Ok(()) => {
                drop(finish_open(inner, st, None));
            }
            Err(_) => {
                // Tear down the failed attempt and move to the next
                // candidate.
                inner.os.clear_fd_handlers_norpt(st.fd);
                sys::unix::close(st.fd);
                st.fd = -1;
                match inner.ops.retry_open() {
                    Err(err) => {
                        drop(finish_open(inner, st, Some(err)));
                    }
                    Ok(result) => {
                        let (fd, in_progress) = match result {
                            OpenResult::Ready(fd) => (fd, false),
                            OpenResult::InProgress(fd) => (fd, true),
                        };
                        st.fd = fd;
                        match setup_handlers(inner, fd) {
                            Err(err) => {
                                sys::unix::close(fd);
                                st.fd = -1;
                                drop(finish_open(inner, st, Some(err)));
                            }
                            Ok(()) => {
                                if in_progress {
                                    inner.os.set_write_handler(fd, true);
                                } else {
                                    drop(finish_open(inner, st, None));
                                }
                            }
                        }
                    }
                }
            }
        }
    } else {
        let cbs = st.cbs.clone();
        drop(st);
        if let Some(cbs) = cbs {
            cbs.write_ready();
        }
        let st = inner.lock();
        if st.state == State::Open && st.write_enabled {
            inner.os.set_write_handler(st.fd, true);
        }
    }
}

/// Probe the strategy's close progress, re-arming the close timer for as
/// long as it asks, then finish the teardown.
fn close_poll(inner: &Arc<FdInner>) {
    match inner.ops.check_close(CloseState::Done) {
        Some(timeout) => {
            let me = Arc::clone(inner);
            inner.os.start_timer(timeout, Box::new(move || close_poll(&me)));
        }
        None => finish_cleared(inner),
    }
}

/// The readiness handlers are gone: close the descriptor, report a
/// failed open if one was pending, and complete the close (behind the
/// trampoline if one is queued).
fn finish_cleared(inner: &Arc<FdInner>) {
    let mut st = inner.lock();

    if st.fd >= 0 {
        sys::unix::close(st.fd);
    }
    st.fd = -1;

    if let Some(done) = st.open_done.take() {
        match st.open_err.take() {
            Some(err) => {
                // An open that failed in flight completes here, after
                // the descriptor is gone.
                drop(st);
                done(Err(err));
                st = inner.lock();
            }
            // A clean user close cancelled the open; the completion is
            // dropped undelivered.
            None => drop(done),
        }
    }

    if st.deferred_op_pending {
        st.deferred_close = true;
    } else {
        drop(finish_close(inner, st));
    }
}
