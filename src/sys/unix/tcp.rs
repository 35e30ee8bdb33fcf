use std::io;
use std::mem::{size_of, zeroed};
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::sys::unix::net::{new_socket, socket_addr, to_socket_addr};

pub(crate) const LISTEN_BACKLOG_SIZE: libc::c_int = 1024;

pub(crate) fn new_for_addr(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    new_socket(domain)
}

/// Start a non-blocking connect. An `EINPROGRESS` result is the caller's
/// to deal with, everything else is an outright failure.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let addrlen = socket_addr(addr, &mut storage);
    syscall!(connect(
        fd,
        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        addrlen,
    ))
    .map(|_| ())
}

/// Create a listening socket for `addr`: socket, `SO_REUSEADDR`, bind,
/// listen, non-blocking.
pub(crate) fn bind_listen(addr: &SocketAddr, backlog: libc::c_int) -> io::Result<RawFd> {
    let fd = new_for_addr(addr)?;

    // On platforms with Berkeley-derived sockets this allows to quickly
    // rebind a socket, without needing to wait for the OS to clean up the
    // previous one.
    let optval: libc::c_int = 1;
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let addrlen = socket_addr(addr, &mut storage);
    let res = syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &optval as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .and_then(|_| {
        syscall!(bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            addrlen,
        ))
    })
    .and_then(|_| syscall!(listen(fd, backlog)))
    .and_then(|_| crate::sys::unix::net::set_nonblocking(fd).map(|()| 0));

    match res {
        Ok(_) => Ok(fd),
        Err(err) => {
            // Close the socket if we hit an error, ignoring the error from
            // closing since we can't pass back two errors.
            let _ = syscall!(close(fd));
            Err(err)
        }
    }
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let mut addrlen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let new_fd = syscall!(accept4(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut addrlen,
        libc::SOCK_CLOEXEC,
    ))?;

    // SAFETY: `accept4(2)` filled in the peer address for us.
    let addr = unsafe { to_socket_addr(&storage) };
    match addr {
        Ok(addr) => Ok((new_fd, addr)),
        Err(err) => {
            let _ = syscall!(close(new_fd));
            Err(err)
        }
    }
}

/// Read and clear the pending socket error, the outcome of a
/// non-blocking connect.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut optval: libc::c_int = 0;
    let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;

    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut optval as *mut libc::c_int as *mut libc::c_void,
        &mut optlen,
    ))?;

    if optval == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(optval)))
    }
}

/// Get the local address of a bound socket.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let mut addrlen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    syscall!(getsockname(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut addrlen,
    ))?;

    // SAFETY: `getsockname(2)` initialised `storage` for us.
    unsafe { to_socket_addr(&storage) }
}
