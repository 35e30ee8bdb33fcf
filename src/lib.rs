//! Transport-neutral non-blocking stream I/O.
//!
//! `sio` hides the concrete transport behind a uniform stream handle,
//! [`FdStream`], that supports asynchronous open/close and
//! readiness-driven reads and writes. Transports plug into the handle as
//! a strategy ([`FdOps`]); the crate ships a TCP client strategy
//! ([`net::tcp_stream`]) and a listening acceptor
//! ([`net::TcpAcceptor`]) that manufactures server-side streams on
//! accept. Serial-style transports additionally expose out-of-band line
//! control through [`serial::SerialStream`].
//!
//! Readiness, timers and deferred work come from an OS-services layer
//! ([`os::OsFuncs`]); [`UnixOsFuncs`] is the epoll-backed production
//! implementation. Any number of threads may hold stream handles; all
//! user callbacks are invoked without any internal lock held, and never
//! from inside the call that armed them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sio::{net, UnixOsFuncs};
//! # use std::io;
//! # struct Echo;
//! # impl sio::StreamCallbacks for Echo {
//! #     fn read(&self, _data: io::Result<&[u8]>) -> usize { 0 }
//! #     fn write_ready(&self) {}
//! # }
//! # fn main() -> io::Result<()> {
//! let os = Arc::new(UnixOsFuncs::new()?);
//! let addr = "127.0.0.1:4003".parse().unwrap();
//! let stream = net::tcp_stream(&[addr], os, 1024, Arc::new(Echo))?;
//! stream.open(Box::new(|res| println!("open: {:?}", res)))?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms, unused_imports, dead_code)]

mod fd;
pub mod net;
pub mod os;
pub mod serial;
mod sys;

pub use crate::fd::{
    CloseDone, CloseState, FdOps, FdStream, OpenDone, OpenResult, StreamCallbacks,
};
#[cfg(unix)]
pub use crate::os::unix::UnixOsFuncs;
pub use crate::os::{DeferredWork, FdHandler, OsFuncs, Waiter};
