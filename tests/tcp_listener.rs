use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sio::net::{AcceptorCallbacks, TcpAcceptor};
use sio::FdStream;

mod util;
use util::{close_done, init_with_os, open_done, Recorder, StreamEvent, TIMEOUT};

/// Acceptor callbacks that forward every accepted stream onto a
/// channel, optionally denying everyone with a fixed message.
struct AcceptRecorder {
    tx: Mutex<Sender<FdStream>>,
    deny: Option<String>,
}

impl AcceptRecorder {
    fn new() -> (Arc<AcceptRecorder>, Receiver<FdStream>) {
        AcceptRecorder::with_deny(None)
    }

    fn with_deny(deny: Option<String>) -> (Arc<AcceptRecorder>, Receiver<FdStream>) {
        let (tx, rx) = channel();
        (
            Arc::new(AcceptRecorder {
                tx: Mutex::new(tx),
                deny,
            }),
            rx,
        )
    }
}

impl AcceptorCallbacks for AcceptRecorder {
    fn new_connection(&self, stream: FdStream) {
        let _ = self.tx.lock().unwrap().send(stream);
    }

    fn check_access(&self, _peer: &SocketAddr) -> Result<(), String> {
        match &self.deny {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn accepted_streams_are_open_and_usable() {
    let os = init_with_os();
    let (cbs, accepted) = AcceptRecorder::new();
    let acceptor = TcpAcceptor::new("test", os, &[any_local_address()], 64, cbs).unwrap();
    acceptor.startup().unwrap();
    let addr = acceptor.bound_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    let stream = accepted.recv_timeout(TIMEOUT).unwrap();

    // The stream knows who connected.
    assert_eq!(stream.remote_addr().unwrap(), client.local_addr().unwrap());
    assert_eq!(
        stream.raddr_to_str().unwrap(),
        client.local_addr().unwrap().to_string()
    );

    // Born open: data flows both ways once callbacks are installed.
    let (scbs, events) = Recorder::new();
    stream.set_callbacks(scbs);
    stream.set_read_callback_enable(true);

    client.write_all(b"ping").unwrap();
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap(),
        StreamEvent::Data(b"ping".to_vec())
    );

    assert_eq!(stream.write(b"pong").unwrap(), 4);
    let mut buf = [0; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    let (done, closed) = close_done();
    stream.close(done).unwrap();
    closed.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn pausing_accepts_queues_connections_in_the_backlog() {
    let os = init_with_os();
    let (cbs, accepted) = AcceptRecorder::new();
    let acceptor = TcpAcceptor::new("pause", os, &[any_local_address()], 64, cbs).unwrap();
    acceptor.startup().unwrap();
    let addr = acceptor.bound_addrs()[0];

    let _c1 = TcpStream::connect(addr).unwrap();
    let _c2 = TcpStream::connect(addr).unwrap();
    let _s1 = accepted.recv_timeout(TIMEOUT).unwrap();
    let _s2 = accepted.recv_timeout(TIMEOUT).unwrap();

    acceptor.set_accept_callback_enable(false);

    // The third client connects fine (the kernel completes the
    // handshake into the backlog) but is not delivered.
    let _c3 = TcpStream::connect(addr).unwrap();
    assert!(accepted.recv_timeout(Duration::from_millis(300)).is_err());

    acceptor.set_accept_callback_enable(true);
    let _s3 = accepted.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn shutdown_completes_once_after_every_listener_cleared() {
    let os = init_with_os();
    let (cbs, _accepted) = AcceptRecorder::new();
    let acceptor = TcpAcceptor::new(
        "multi",
        os,
        &[any_local_address(), any_local_address()],
        64,
        cbs,
    )
    .unwrap();
    acceptor.startup().unwrap();
    assert_eq!(acceptor.bound_addrs().len(), 2);

    let (tx, shutdown_fired) = channel();
    acceptor
        .shutdown(Box::new(move || {
            let _ = tx.send(());
        }))
        .unwrap();

    shutdown_fired.recv_timeout(TIMEOUT).unwrap();
    assert!(shutdown_fired.recv_timeout(Duration::from_millis(200)).is_err());

    // The acceptor is reusable once the shutdown has fully settled.
    let mut started = false;
    for _ in 0..50 {
        match acceptor.startup() {
            Ok(()) => {
                started = true;
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    assert!(started, "acceptor never became idle after shutdown");
}

#[test]
fn startup_and_shutdown_misuse_are_busy() {
    let os = init_with_os();
    let (cbs, _accepted) = AcceptRecorder::new();
    let acceptor = TcpAcceptor::new("busy", os, &[any_local_address()], 64, cbs).unwrap();

    let err = acceptor.shutdown(Box::new(|| {})).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

    acceptor.startup().unwrap();
    let err = acceptor.startup().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
}

#[test]
fn denied_connections_get_the_reason_and_no_stream() {
    let os = init_with_os();
    let (cbs, accepted) = AcceptRecorder::with_deny(Some("access denied\r\n".to_string()));
    let acceptor = TcpAcceptor::new("deny", os, &[any_local_address()], 64, cbs).unwrap();
    acceptor.startup().unwrap();
    let addr = acceptor.bound_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(TIMEOUT))
        .unwrap();

    let mut rejection = String::new();
    client.read_to_string(&mut rejection).unwrap();
    assert_eq!(rejection, "access denied\r\n");

    assert!(accepted.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn acceptor_connect_builds_an_outbound_stream() {
    let os = init_with_os();
    let (cbs, accepted) = AcceptRecorder::new();
    let acceptor = TcpAcceptor::new("outbound", os, &[any_local_address()], 64, cbs).unwrap();
    acceptor.startup().unwrap();
    let addr = acceptor.bound_addrs()[0];

    let (scbs, _events) = Recorder::new();
    let (done, opened) = open_done();
    let stream = acceptor.connect(&[addr], scbs, done).unwrap();

    assert_eq!(opened.recv_timeout(TIMEOUT).unwrap(), Ok(()));
    let _server_side = accepted.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(stream.raddr_to_str().unwrap(), addr.to_string());

    let (done, closed) = close_done();
    stream.close(done).unwrap();
    closed.recv_timeout(TIMEOUT).unwrap();
}
