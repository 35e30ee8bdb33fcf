//! Networking transports.
//!
//! The TCP transport comes in two halves: [`tcp_stream`] builds an
//! outbound stream around a resolved address list, and [`TcpAcceptor`]
//! owns listening sockets and manufactures server-side streams on
//! accept. Both produce the same uniform [`FdStream`](crate::FdStream)
//! handle.

mod tcp;

pub use self::tcp::{tcp_stream, AcceptorCallbacks, ShutdownDone, TcpAcceptor};
