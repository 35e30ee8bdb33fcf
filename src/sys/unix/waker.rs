use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Kicks the dispatch thread out of `epoll_wait` via an `eventfd`.
///
/// The eventfd is a kernel counter: any 8-byte write adds to it and
/// makes the descriptor readable, an 8-byte read drains it back to
/// zero. The dispatch loop keeps the descriptor registered for
/// read-readiness and drains it whenever it fires.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: a successful `eventfd(2)` hands us a descriptor we
        // now own.
        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        loop {
            match (&self.fd).write(&one) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // The counter is saturated, so a wake-up is already
                    // pending anyway. Drain and retry so this write
                    // still lands.
                    self.ack();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drain the counter after its readiness fired. Reading an already
    /// empty counter just reports `WouldBlock`, which is fine.
    pub(crate) fn ack(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
