// Not all functions are used by all tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use sio::{CloseDone, OpenDone, OsFuncs, StreamCallbacks, UnixOsFuncs};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn init_with_os() -> Arc<dyn OsFuncs> {
    init();
    Arc::new(UnixOsFuncs::new().expect("unable to create event source"))
}

#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Vec<u8>),
    ReadError(i32),
    WriteReady,
    Urgent,
}

/// Stream callbacks that forward every event onto a channel. Deliveries
/// consume according to the preloaded plan; once the plan runs out,
/// everything is consumed.
pub struct Recorder {
    tx: Mutex<Sender<StreamEvent>>,
    consume_plan: Mutex<VecDeque<usize>>,
}

impl Recorder {
    pub fn new() -> (Arc<Recorder>, Receiver<StreamEvent>) {
        Recorder::with_consume_plan(&[])
    }

    pub fn with_consume_plan(plan: &[usize]) -> (Arc<Recorder>, Receiver<StreamEvent>) {
        let (tx, rx) = channel();
        let recorder = Arc::new(Recorder {
            tx: Mutex::new(tx),
            consume_plan: Mutex::new(plan.iter().copied().collect()),
        });
        (recorder, rx)
    }
}

impl StreamCallbacks for Recorder {
    fn read(&self, data: io::Result<&[u8]>) -> usize {
        match data {
            Ok(buf) => {
                let consume = self
                    .consume_plan
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(usize::MAX)
                    .min(buf.len());
                let _ = self
                    .tx
                    .lock()
                    .unwrap()
                    .send(StreamEvent::Data(buf.to_vec()));
                consume
            }
            Err(err) => {
                let _ = self
                    .tx
                    .lock()
                    .unwrap()
                    .send(StreamEvent::ReadError(err.raw_os_error().unwrap_or(0)));
                0
            }
        }
    }

    fn write_ready(&self) {
        let _ = self.tx.lock().unwrap().send(StreamEvent::WriteReady);
    }

    fn urgent(&self) {
        let _ = self.tx.lock().unwrap().send(StreamEvent::Urgent);
    }
}

/// An `open` completion wired to a channel, failures reduced to their
/// errno.
pub fn open_done() -> (OpenDone, Receiver<Result<(), i32>>) {
    let (tx, rx) = channel();
    let done: OpenDone = Box::new(move |res| {
        let _ = tx.send(res.map_err(|err| err.raw_os_error().unwrap_or(0)));
    });
    (done, rx)
}

/// A `close` completion wired to a channel.
pub fn close_done() -> (CloseDone, Receiver<()>) {
    let (tx, rx) = channel();
    let done: CloseDone = Box::new(move || {
        let _ = tx.send(());
    });
    (done, rx)
}

/// An address nothing is listening on: bind a listener, note its
/// address, drop it.
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn expect_no_event(rx: &Receiver<StreamEvent>, within: Duration) {
    if let Ok(event) = rx.recv_timeout(within) {
        panic!("unexpected event: {:?}", event);
    }
}
