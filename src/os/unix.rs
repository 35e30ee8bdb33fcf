//! Epoll-backed implementation of the OS-services contract.
//!
//! One dispatch thread owns all callback delivery: it waits on the
//! selector, fires readiness callbacks, runs deferred work and timers,
//! and acknowledges handler teardown. Because every callback runs on
//! that thread, a `cleared` acknowledgement queued behind the current
//! dispatch batch cannot race an in-flight callback for the same
//! descriptor.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use crate::os::{DeferredWork, FdHandler, OsFuncs};
use crate::sys::unix::{event, Event, Events, Interests, Selector, Waker};

const EVENTS_CAPACITY: usize = 1024;

/// The production OS-services layer: epoll readiness, an eventfd waker,
/// a timer heap and a deferred-work queue, all driven by one thread.
pub struct UnixOsFuncs {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    selector: Selector,
    waker: Waker,
    state: Mutex<LoopState>,
}

struct LoopState {
    fds: HashMap<RawFd, FdReg>,
    cleared: VecDeque<(RawFd, Arc<dyn FdHandler>)>,
    deferred: VecDeque<DeferredWork>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    shutdown: bool,
}

struct FdReg {
    handler: Arc<dyn FdHandler>,
    interests: Interests,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    work: DeferredWork,
}

// Earliest deadline pops first; `seq` keeps equal deadlines in arm order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl UnixOsFuncs {
    /// Create the event source and spawn its dispatch thread.
    pub fn new() -> io::Result<UnixOsFuncs> {
        let selector = Selector::new()?;
        let waker = Waker::new()?;
        selector.register(
            waker.as_raw_fd(),
            Interests {
                read: true,
                write: false,
                except: false,
            },
        )?;

        let shared = Arc::new(Shared {
            selector,
            waker,
            state: Mutex::new(LoopState {
                fds: HashMap::new(),
                cleared: VecDeque::new(),
                deferred: VecDeque::new(),
                timers: BinaryHeap::new(),
                timer_seq: 0,
                shutdown: false,
            }),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("sio-events".to_string())
            .spawn(move || event_loop(loop_shared))?;

        Ok(UnixOsFuncs {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn update_interests(&self, fd: RawFd, update: impl FnOnce(&mut Interests)) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(reg) = state.fds.get_mut(&fd) {
            let old = reg.interests;
            update(&mut reg.interests);
            if reg.interests != old {
                if let Err(err) = self.shared.selector.reregister(fd, reg.interests) {
                    warn!("unable to update interests for fd {}: {}", fd, err);
                }
            }
        }
    }
}

impl OsFuncs for UnixOsFuncs {
    fn set_fd_handlers(&self, fd: RawFd, handler: Arc<dyn FdHandler>) -> io::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.fds.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.shared.selector.register(fd, Interests::default())?;
        state.fds.insert(
            fd,
            FdReg {
                handler,
                interests: Interests::default(),
            },
        );
        Ok(())
    }

    fn clear_fd_handlers(&self, fd: RawFd) {
        let mut state = self.shared.state.lock().unwrap();
        match state.fds.remove(&fd) {
            Some(reg) => {
                // Tear the registration down right away; the
                // acknowledgement waits until the dispatch thread is
                // between callbacks.
                if let Err(err) = self.shared.selector.deregister(fd) {
                    warn!("unable to deregister fd {}: {}", fd, err);
                }
                state.cleared.push_back((fd, reg.handler));
                drop(state);
                if let Err(err) = self.shared.waker.wake() {
                    warn!("unable to wake event loop: {}", err);
                }
            }
            None => warn!("clear_fd_handlers: fd {} is not registered", fd),
        }
    }

    fn clear_fd_handlers_norpt(&self, fd: RawFd) {
        let mut state = self.shared.state.lock().unwrap();
        if state.fds.remove(&fd).is_some() {
            if let Err(err) = self.shared.selector.deregister(fd) {
                warn!("unable to deregister fd {}: {}", fd, err);
            }
        }
    }

    fn set_read_handler(&self, fd: RawFd, enable: bool) {
        self.update_interests(fd, |interests| interests.read = enable);
    }

    fn set_write_handler(&self, fd: RawFd, enable: bool) {
        self.update_interests(fd, |interests| interests.write = enable);
    }

    fn set_except_handler(&self, fd: RawFd, enable: bool) {
        self.update_interests(fd, |interests| interests.except = enable);
    }

    fn run(&self, work: DeferredWork) {
        let mut state = self.shared.state.lock().unwrap();
        state.deferred.push_back(work);
        drop(state);
        if let Err(err) = self.shared.waker.wake() {
            warn!("unable to wake event loop: {}", err);
        }
    }

    fn start_timer(&self, after: Duration, work: DeferredWork) {
        let mut state = self.shared.state.lock().unwrap();
        let seq = state.timer_seq;
        state.timer_seq += 1;
        state.timers.push(TimerEntry {
            deadline: Instant::now() + after,
            seq,
            work,
        });
        drop(state);
        if let Err(err) = self.shared.waker.wake() {
            warn!("unable to wake event loop: {}", err);
        }
    }
}

impl Drop for UnixOsFuncs {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for UnixOsFuncs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixOsFuncs").finish()
    }
}

enum Job {
    Cleared(RawFd, Arc<dyn FdHandler>),
    Work(DeferredWork),
}

/// Pop one unit of due work. Teardown acknowledgements drain first so a
/// close started from a callback completes before new deferred work for
/// the same stream runs.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.state.lock().unwrap();
    if let Some((fd, handler)) = state.cleared.pop_front() {
        return Some(Job::Cleared(fd, handler));
    }
    if let Some(work) = state.deferred.pop_front() {
        return Some(Job::Work(work));
    }
    let due = state
        .timers
        .peek()
        .map_or(false, |timer| timer.deadline <= Instant::now());
    if due {
        if let Some(timer) = state.timers.pop() {
            return Some(Job::Work(timer.work));
        }
    }
    None
}

fn run_job(job: Job) {
    match job {
        Job::Cleared(fd, handler) => handler.cleared(fd),
        Job::Work(work) => work(),
    }
}

fn event_loop(shared: Arc<Shared>) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        while let Some(job) = next_job(&shared) {
            run_job(job);
        }

        let timeout = {
            let state = shared.state.lock().unwrap();
            if state.shutdown {
                break;
            }
            state
                .timers
                .peek()
                .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
        };

        match shared.selector.select(&mut events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("selector failed: {}", err);
                break;
            }
        }

        for ev in events.iter() {
            let fd = event::fd(ev);
            if fd == shared.waker.as_raw_fd() {
                shared.waker.ack();
                continue;
            }
            dispatch(&shared, fd, ev);
        }
    }

    // Teardown started before the shutdown still gets acknowledged.
    while let Some(job) = next_job(&shared) {
        run_job(job);
    }
}

fn dispatch(shared: &Shared, fd: RawFd, ev: &Event) {
    // Snapshot under the lock, call with it released.
    let (handler, interests) = {
        let state = shared.state.lock().unwrap();
        match state.fds.get(&fd) {
            Some(reg) => (Arc::clone(&reg.handler), reg.interests),
            None => return,
        }
    };

    if interests.except && event::is_priority(ev) {
        Arc::clone(&handler).except_ready(fd);
    }
    if interests.read && event::is_readable(ev) {
        Arc::clone(&handler).read_ready(fd);
    }
    if interests.write && event::is_writable(ev) {
        handler.write_ready(fd);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;

    #[test]
    fn deferred_work_runs() {
        let os = UnixOsFuncs::new().unwrap();
        let (tx, rx) = channel();
        os.run(Box::new(move || tx.send("ran").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let os = UnixOsFuncs::new().unwrap();
        let (tx, rx) = channel();
        let tx2 = tx.clone();
        os.start_timer(Duration::from_millis(150), Box::new(move || tx.send("late").unwrap()));
        os.start_timer(Duration::from_millis(10), Box::new(move || tx2.send("early").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn waiter_counts_wakes() {
        let waiter = crate::os::Waiter::new();
        waiter.wake();
        waiter.wake();
        waiter.wait();
        waiter.wait();
    }
}
