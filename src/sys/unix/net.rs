use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

pub(crate) fn new_socket(domain: libc::c_int) -> io::Result<RawFd> {
    syscall!(socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

/// Stream socket setup shared by the connect and accept paths:
/// non-blocking with keepalive probing on.
pub(crate) fn prepare_socket(fd: RawFd) -> io::Result<()> {
    set_nonblocking(fd)?;

    let optval: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        &optval as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Write `addr` into a caller-owned `sockaddr_storage` and return the
/// length the kernel should see. `storage` is assumed zeroed.
pub(crate) fn socket_addr(addr: &SocketAddr, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                // The octet array is already in network order; keep the
                // bytes exactly as they are.
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: `sockaddr_storage` is defined to be large enough
            // and aligned for every socket address type.
            unsafe {
                ptr::write(
                    storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                    sin,
                );
            }
            size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            // SAFETY: as above.
            unsafe {
                ptr::write(
                    storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                    sin6,
                );
            }
            size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Interpret a kernel-filled `sockaddr_storage` as a Rust address.
///
/// # Safety
///
/// `storage` must have been filled in by the kernel; families other
/// than `AF_INET`/`AF_INET6` are rejected.
pub(crate) unsafe fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
