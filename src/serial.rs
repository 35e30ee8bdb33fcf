//! Typed line-parameter control for serial-style transports.
//!
//! A serial transport (termios-driven hardware, telnet RFC 2217
//! negotiation) exposes its line controls through [`SerialOps`]: each
//! parameter is a non-blocking "request plus asynchronous confirmation"
//! pair carrying the negotiated integer value. [`SerialStream`] couples
//! a transport's control surface with its data stream and adds blocking
//! convenience wrappers built on [`Waiter`].

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use crate::fd::FdStream;
use crate::os::Waiter;

/// Completion for a serial control request, carrying the value the
/// other end actually agreed to.
pub type SerialDone = Box<dyn FnOnce(io::Result<u32>) + Send>;

/// The line-parameter controls a serial transport implements.
pub trait SerialOps: Send + Sync {
    /// Request a baud rate change.
    fn baud(&self, baud: u32, done: SerialDone) -> io::Result<()>;
    /// Request a character size change (bits per character).
    fn datasize(&self, datasize: u32, done: SerialDone) -> io::Result<()>;
    /// Request a parity change.
    fn parity(&self, parity: u32, done: SerialDone) -> io::Result<()>;
    /// Request a stop-bit count change.
    fn stopbits(&self, stopbits: u32, done: SerialDone) -> io::Result<()>;
    /// Request a flow-control change.
    fn flowcontrol(&self, flowcontrol: u32, done: SerialDone) -> io::Result<()>;
    /// Assert or clear break.
    fn sbreak(&self, sbreak: u32, done: SerialDone) -> io::Result<()>;
    /// Assert or clear DTR.
    fn dtr(&self, dtr: u32, done: SerialDone) -> io::Result<()>;
    /// Assert or clear RTS.
    fn rts(&self, rts: u32, done: SerialDone) -> io::Result<()>;
}

/// A stream with serial line control: the data half is a plain
/// [`FdStream`], the control half a [`SerialOps`].
pub struct SerialStream {
    io: FdStream,
    ops: Arc<dyn SerialOps>,
}

macro_rules! serial_param {
    ($(#[$doc: meta])* $name: ident, $name_b: ident) => {
        $(#[$doc])*
        pub fn $name(&self, value: u32, done: SerialDone) -> io::Result<()> {
            self.ops.$name(value, done)
        }

        /// Blocking variant: issues the request and waits for the
        /// confirmation, replacing `value` with the negotiated result.
        pub fn $name_b(&self, value: &mut u32) -> io::Result<()> {
            let requested = *value;
            call_blocking(|done| self.ops.$name(requested, done), value)
        }
    };
}

impl SerialStream {
    pub fn new(io: FdStream, ops: Arc<dyn SerialOps>) -> SerialStream {
        SerialStream { io, ops }
    }

    /// The data half of the stream.
    pub fn stream(&self) -> &FdStream {
        &self.io
    }

    serial_param!(
        /// Request a baud rate change.
        baud, baud_b
    );
    serial_param!(
        /// Request a character size change.
        datasize, datasize_b
    );
    serial_param!(
        /// Request a parity change.
        parity, parity_b
    );
    serial_param!(
        /// Request a stop-bit count change.
        stopbits, stopbits_b
    );
    serial_param!(
        /// Request a flow-control change.
        flowcontrol, flowcontrol_b
    );
    serial_param!(
        /// Assert or clear break.
        sbreak, sbreak_b
    );
    serial_param!(
        /// Assert or clear DTR.
        dtr, dtr_b
    );
    serial_param!(
        /// Assert or clear RTS.
        rts, rts_b
    );
}

impl fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialStream").field("io", &self.io).finish()
    }
}

/// The uniform blocking wrapper: allocate a waiter, issue the
/// asynchronous call, wait, read out the result.
fn call_blocking(
    start: impl FnOnce(SerialDone) -> io::Result<()>,
    value: &mut u32,
) -> io::Result<()> {
    let waiter = Arc::new(Waiter::new());
    let slot: Arc<Mutex<Option<io::Result<u32>>>> = Arc::new(Mutex::new(None));

    let done_waiter = Arc::clone(&waiter);
    let done_slot = Arc::clone(&slot);
    start(Box::new(move |result| {
        *done_slot.lock().unwrap() = Some(result);
        done_waiter.wake();
    }))?;

    waiter.wait();
    let taken = slot.lock().unwrap().take();
    match taken {
        Some(Ok(negotiated)) => {
            *value = negotiated;
            Ok(())
        }
        Some(Err(err)) => Err(err),
        // The waiter only wakes after the slot is filled.
        None => Err(io::Error::from_raw_os_error(libc::EIO)),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    // A control surface that negotiates every request down to the
    // nearest even value, confirming from another thread.
    struct EvenNegotiator;

    fn confirm(value: u32, done: SerialDone) -> io::Result<()> {
        thread::spawn(move || done(Ok(value & !1)));
        Ok(())
    }

    impl SerialOps for EvenNegotiator {
        fn baud(&self, baud: u32, done: SerialDone) -> io::Result<()> {
            confirm(baud, done)
        }
        fn datasize(&self, datasize: u32, done: SerialDone) -> io::Result<()> {
            confirm(datasize, done)
        }
        fn parity(&self, parity: u32, done: SerialDone) -> io::Result<()> {
            confirm(parity, done)
        }
        fn stopbits(&self, stopbits: u32, done: SerialDone) -> io::Result<()> {
            confirm(stopbits, done)
        }
        fn flowcontrol(&self, flowcontrol: u32, done: SerialDone) -> io::Result<()> {
            confirm(flowcontrol, done)
        }
        fn sbreak(&self, sbreak: u32, done: SerialDone) -> io::Result<()> {
            confirm(sbreak, done)
        }
        fn dtr(&self, dtr: u32, done: SerialDone) -> io::Result<()> {
            confirm(dtr, done)
        }
        fn rts(&self, rts: u32, done: SerialDone) -> io::Result<()> {
            confirm(rts, done)
        }
    }

    struct FailingNegotiator;

    impl SerialOps for FailingNegotiator {
        fn baud(&self, _baud: u32, done: SerialDone) -> io::Result<()> {
            thread::spawn(move || done(Err(io::Error::from_raw_os_error(libc::EINVAL))));
            Ok(())
        }
        fn datasize(&self, _datasize: u32, _done: SerialDone) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::ENOTSUP))
        }
        fn parity(&self, _parity: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
        fn stopbits(&self, _stopbits: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
        fn flowcontrol(&self, _flowcontrol: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
        fn sbreak(&self, _sbreak: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
        fn dtr(&self, _dtr: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
        fn rts(&self, _rts: u32, _done: SerialDone) -> io::Result<()> {
            unimplemented!()
        }
    }

    fn blocking_roundtrip(ops: Arc<dyn SerialOps>) -> io::Result<u32> {
        let mut value = 9601;
        let requested = value;
        call_blocking(|done| ops.baud(requested, done), &mut value)?;
        Ok(value)
    }

    #[test]
    fn blocking_wrapper_returns_negotiated_value() {
        let value = blocking_roundtrip(Arc::new(EvenNegotiator)).unwrap();
        assert_eq!(value, 9600);
    }

    #[test]
    fn blocking_wrapper_surfaces_async_error() {
        let err = blocking_roundtrip(Arc::new(FailingNegotiator)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn blocking_wrapper_surfaces_sync_error() {
        let ops = FailingNegotiator;
        let mut value = 8;
        let err = call_blocking(|done| ops.datasize(8, done), &mut value).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTSUP));
        assert_eq!(value, 8);
    }
}
