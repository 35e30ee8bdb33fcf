use std::io;
use std::os::fd::RawFd;

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

/// Consume pending urgent data. The contents are irrelevant, the DATA
/// MARK in the stream is what matters.
pub(crate) fn drain_oob(fd: RawFd) {
    let mut byte = 0u8;
    loop {
        let rv = unsafe {
            libc::recv(
                fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_OOB,
            )
        };
        if rv == 0 {
            break;
        }
        if rv < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}

pub(crate) fn close(fd: RawFd) {
    // Ignoring errors from close, there is nothing sensible to do with
    // them at this point.
    let _ = syscall!(close(fd));
}
