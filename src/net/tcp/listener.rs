use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use log::error;

use crate::fd::{FdStream, OpenDone, StreamCallbacks};
use crate::net::tcp::TcpData;
use crate::os::{FdHandler, OsFuncs};
use crate::sys::unix::{self, net, tcp};

/// One-shot completion for [`TcpAcceptor::shutdown`].
pub type ShutdownDone = Box<dyn FnOnce() + Send>;

/// The acceptor's receiver for new connections.
pub trait AcceptorCallbacks: Send + Sync {
    /// An accepted connection, already established and in the open
    /// state. Install callbacks and enable reception to use it.
    fn new_connection(&self, stream: FdStream);

    /// Gate an accepted connection before it becomes a stream. On
    /// `Err` the message is written to the peer and the connection is
    /// closed; the upper layer never sees it.
    fn check_access(&self, _peer: &SocketAddr) -> Result<(), String> {
        Ok(())
    }
}

/// A listening acceptor: one listening socket per configured address,
/// manufacturing an open [`FdStream`] for every accepted connection.
pub struct TcpAcceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    os: Arc<dyn OsFuncs>,
    name: String,
    addrs: Box<[SocketAddr]>,
    max_read_size: usize,
    cbs: Arc<dyn AcceptorCallbacks>,
    st: Mutex<AccState>,
}

struct AccState {
    setup: bool,
    enabled: bool,
    in_shutdown: bool,

    acceptfds: Vec<RawFd>,
    bound_addrs: Vec<SocketAddr>,

    nr_accept_close_waiting: usize,
    shutdown_done: Option<ShutdownDone>,
}

impl TcpAcceptor {
    /// Create an idle acceptor for `addrs`. Nothing is bound until
    /// [`startup`](TcpAcceptor::startup).
    pub fn new(
        name: &str,
        os: Arc<dyn OsFuncs>,
        addrs: &[SocketAddr],
        max_read_size: usize,
        cbs: Arc<dyn AcceptorCallbacks>,
    ) -> io::Result<TcpAcceptor> {
        if addrs.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(TcpAcceptor {
            inner: Arc::new(AcceptorInner {
                os,
                name: name.to_string(),
                addrs: addrs.to_vec().into_boxed_slice(),
                max_read_size,
                cbs,
                st: Mutex::new(AccState {
                    setup: false,
                    enabled: false,
                    in_shutdown: false,
                    acceptfds: Vec::new(),
                    bound_addrs: Vec::new(),
                    nr_accept_close_waiting: 0,
                    shutdown_done: None,
                }),
            }),
        })
    }

    /// Bind and start listening on every configured address and enable
    /// accepts. `EBUSY` while already running or still shutting down.
    pub fn startup(&self) -> io::Result<()> {
        let inner = &self.inner;
        let mut st = inner.st.lock().unwrap();
        if st.in_shutdown || st.setup {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let mut fds = Vec::with_capacity(inner.addrs.len());
        let mut bound = Vec::with_capacity(inner.addrs.len());
        for addr in inner.addrs.iter() {
            let result = tcp::bind_listen(addr, tcp::LISTEN_BACKLOG_SIZE).and_then(|fd| {
                tcp::local_addr(fd)
                    .and_then(|bound_addr| {
                        let handler: Arc<dyn FdHandler> = inner.clone();
                        inner.os.set_fd_handlers(fd, handler).map(|()| bound_addr)
                    })
                    .map(|bound_addr| (fd, bound_addr))
                    .map_err(|err| {
                        unix::close(fd);
                        err
                    })
            });
            match result {
                Ok((fd, bound_addr)) => {
                    fds.push(fd);
                    bound.push(bound_addr);
                }
                Err(err) => {
                    // Unwind the listeners set up so far; none of them
                    // has delivered anything yet.
                    for fd in fds {
                        inner.os.clear_fd_handlers_norpt(fd);
                        unix::close(fd);
                    }
                    return Err(err);
                }
            }
        }

        for &fd in &fds {
            inner.os.set_read_handler(fd, true);
        }
        st.acceptfds = fds;
        st.bound_addrs = bound;
        st.setup = true;
        st.enabled = true;
        st.shutdown_done = None;
        Ok(())
    }

    /// Unregister every listener. `done` fires once the last listener
    /// acknowledged its teardown. `EBUSY` unless running.
    pub fn shutdown(&self, done: ShutdownDone) -> io::Result<()> {
        let inner = &self.inner;
        let mut st = inner.st.lock().unwrap();
        if !st.setup {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        shutdown_locked(inner, &mut st, Some(done));
        Ok(())
    }

    /// Pause or resume accepts on every listener without tearing the
    /// sockets down; paused connections queue in the kernel backlog.
    pub fn set_accept_callback_enable(&self, enabled: bool) {
        let inner = &self.inner;
        let mut st = inner.st.lock().unwrap();
        if st.enabled != enabled {
            for &fd in &st.acceptfds {
                inner.os.set_read_handler(fd, enabled);
            }
            st.enabled = enabled;
        }
    }

    /// The addresses actually bound (with kernel-assigned ports filled
    /// in). Empty while the acceptor is idle.
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.inner.st.lock().unwrap().bound_addrs.clone()
    }

    /// Build an outbound stream with this acceptor's event source and
    /// buffer size, and start opening it.
    pub fn connect(
        &self,
        addrs: &[SocketAddr],
        cbs: Arc<dyn StreamCallbacks>,
        done: OpenDone,
    ) -> io::Result<FdStream> {
        let stream = super::tcp_stream(
            addrs,
            Arc::clone(&self.inner.os),
            self.inner.max_read_size,
            cbs,
        )?;
        stream.open(done)?;
        Ok(stream)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        let mut st = self.inner.st.lock().unwrap();
        if st.setup {
            shutdown_locked(&self.inner, &mut st, None);
        }
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.st.lock().unwrap();
        f.debug_struct("TcpAcceptor")
            .field("name", &self.inner.name)
            .field("setup", &st.setup)
            .field("enabled", &st.enabled)
            .field("in_shutdown", &st.in_shutdown)
            .finish()
    }
}

fn shutdown_locked(inner: &AcceptorInner, st: &mut AccState, done: Option<ShutdownDone>) {
    st.in_shutdown = true;
    st.shutdown_done = done;
    st.nr_accept_close_waiting = st.acceptfds.len();
    for fd in st.acceptfds.drain(..) {
        inner.os.clear_fd_handlers(fd);
    }
    st.bound_addrs.clear();
    st.setup = false;
    st.enabled = false;
}

fn write_nofail(fd: RawFd, data: &[u8]) {
    let mut data = data;
    while !data.is_empty() {
        match unix::write(fd, data) {
            Ok(0) | Err(_) => break,
            Ok(n) => data = &data[n..],
        }
    }
}

impl FdHandler for AcceptorInner {
    fn read_ready(self: Arc<Self>, fd: RawFd) {
        let (new_fd, peer) = match tcp::accept(fd) {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                error!("could not accept on {}: {}", self.name, err);
                return;
            }
        };

        if let Err(reason) = self.cbs.check_access(&peer) {
            write_nofail(new_fd, reason.as_bytes());
            unix::close(new_fd);
            return;
        }

        if let Err(err) = net::prepare_socket(new_fd) {
            error!("error setting up tcp port {}: {}", self.name, err);
            unix::close(new_fd);
            return;
        }

        let data = TcpData::accepted(peer);
        match FdStream::from_open_fd(
            Arc::clone(&self.os),
            Box::new(data),
            new_fd,
            self.max_read_size,
        ) {
            Ok(stream) => self.cbs.new_connection(stream),
            Err(err) => {
                error!("error allocating tcp stream {}: {}", self.name, err);
                unix::close(new_fd);
            }
        }
    }

    fn write_ready(self: Arc<Self>, _fd: RawFd) {}

    fn except_ready(self: Arc<Self>, _fd: RawFd) {}

    fn cleared(self: Arc<Self>, fd: RawFd) {
        unix::close(fd);

        let num_left = {
            let mut st = self.st.lock().unwrap();
            st.nr_accept_close_waiting -= 1;
            st.nr_accept_close_waiting
        };

        if num_left == 0 {
            let done = self.st.lock().unwrap().shutdown_done.take();
            if let Some(done) = done {
                done();
            }
            self.st.lock().unwrap().in_shutdown = false;
        }
    }
}
