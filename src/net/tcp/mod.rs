mod listener;
mod stream;

pub use self::listener::{AcceptorCallbacks, ShutdownDone, TcpAcceptor};
pub use self::stream::tcp_stream;

pub(crate) use self::stream::TcpData;
