use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::fd::{FdOps, FdStream, OpenResult, StreamCallbacks};
use crate::os::OsFuncs;
use crate::sys::unix::{self, net, tcp};

/// The TCP transport strategy: walks a resolved address list with
/// non-blocking connects, remembering the peer it ended up talking to.
pub(crate) struct TcpData {
    addrs: Box<[SocketAddr]>,
    state: Mutex<TcpState>,
}

struct TcpState {
    curr: usize,
    remote: Option<SocketAddr>,
    // Kept as a raw errno so exhaustion can report the real refusal.
    last_err: Option<i32>,
}

impl TcpData {
    pub(crate) fn new(addrs: Vec<SocketAddr>) -> TcpData {
        TcpData {
            addrs: addrs.into_boxed_slice(),
            state: Mutex::new(TcpState {
                curr: 0,
                remote: None,
                last_err: None,
            }),
        }
    }

    /// Strategy state for a connection `accept` already established.
    pub(crate) fn accepted(peer: SocketAddr) -> TcpData {
        TcpData {
            addrs: Box::new([]),
            state: Mutex::new(TcpState {
                curr: 0,
                remote: Some(peer),
                last_err: None,
            }),
        }
    }

    /// Try the addresses from the cursor onwards, one fresh socket per
    /// attempt, until one connects or starts connecting.
    fn try_open(&self, state: &mut TcpState) -> io::Result<OpenResult> {
        while state.curr < self.addrs.len() {
            let addr = self.addrs[state.curr];

            let fd = match tcp::new_for_addr(&addr).and_then(|fd| {
                net::prepare_socket(fd).map(|()| fd).map_err(|err| {
                    unix::close(fd);
                    err
                })
            }) {
                Ok(fd) => fd,
                Err(err) => {
                    state.last_err = err.raw_os_error();
                    state.curr += 1;
                    continue;
                }
            };

            match tcp::connect(fd, &addr) {
                Ok(()) => {
                    state.remote = Some(addr);
                    return Ok(OpenResult::Ready(fd));
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                    return Ok(OpenResult::InProgress(fd));
                }
                Err(err) => {
                    unix::close(fd);
                    state.last_err = err.raw_os_error();
                    state.curr += 1;
                }
            }
        }

        Err(io::Error::from_raw_os_error(
            state.last_err.unwrap_or(libc::EINVAL),
        ))
    }
}

impl FdOps for TcpData {
    fn sub_open(&self) -> io::Result<OpenResult> {
        if self.addrs.is_empty() {
            // Server-side connections have no active open.
            return Err(io::Error::from_raw_os_error(libc::ENOTSUP));
        }
        let mut state = self.state.lock().unwrap();
        state.curr = 0;
        state.last_err = None;
        self.try_open(&mut state)
    }

    fn check_open(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        match tcp::take_error(fd)? {
            Some(err) => {
                state.last_err = err.raw_os_error();
                Err(err)
            }
            None => {
                state.remote = Some(self.addrs[state.curr]);
                Ok(())
            }
        }
    }

    fn retry_open(&self) -> io::Result<OpenResult> {
        let mut state = self.state.lock().unwrap();
        state.curr += 1;
        self.try_open(&mut state)
    }

    fn raddr_to_str(&self) -> io::Result<String> {
        match self.state.lock().unwrap().remote {
            Some(addr) => Ok(addr.to_string()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown: not connected",
            )),
        }
    }

    fn get_raddr(&self) -> io::Result<SocketAddr> {
        self.state
            .lock()
            .unwrap()
            .remote
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

/// Build a closed outbound stream around `addrs`. Opening it walks the
/// list in order until a connect succeeds, transparently to the caller.
pub fn tcp_stream(
    addrs: &[SocketAddr],
    os: Arc<dyn OsFuncs>,
    max_read_size: usize,
    cbs: Arc<dyn StreamCallbacks>,
) -> io::Result<FdStream> {
    if addrs.is_empty() {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let data = TcpData::new(addrs.to_vec());
    let stream = FdStream::new(os, Box::new(data), max_read_size);
    stream.set_callbacks(cbs);
    Ok(stream)
}
