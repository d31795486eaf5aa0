// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{Channel, Connection, EventLoop, LoopHandle, Socket};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// Owns a thread running an event loop. The setup closure runs on the
/// loop thread before the loop starts and its return value is handed
/// back to the test.
pub struct LoopRunner {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopRunner {
    pub fn spawn<R, F>(setup: F) -> (LoopRunner, R)
    where
        R: Send + 'static,
        F: FnOnce(&Rc<EventLoop>) -> R + Send + 'static,
    {
        init();

        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let event_loop = EventLoop::new().expect("unable to create event loop");
            let value = setup(&event_loop);
            tx.send((event_loop.handle(), value))
                .expect("unable to hand back the loop handle");
            event_loop.run();
        });
        let (handle, value) = rx.recv().expect("loop thread died during setup");

        (
            LoopRunner {
                handle,
                thread: Some(thread),
            },
            value,
        )
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn join(mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("loop thread panicked");
        }
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        // A failed assertion skips `join`; still stop the loop thread.
        if let Some(thread) = self.thread.take() {
            self.handle.quit();
            let _ = thread.join();
        }
    }
}

pub type ConnTable = Rc<RefCell<HashMap<u64, Rc<Connection>>>>;

/// Embed an acceptor on the loop: a listening socket wrapped in a channel
/// whose read callback accepts until the queue is empty and hands every
/// new socket to a `Connection`. Returns the bound port.
///
/// `configure` runs for each accepted connection before `established`;
/// it is responsible for the connection's callbacks, including removing
/// the table entry on close.
pub fn start_acceptor(
    event_loop: &Rc<EventLoop>,
    configure: impl Fn(&Rc<Connection>, &ConnTable) + 'static,
) -> u16 {
    let listener =
        Socket::make_server(0, true, Ipv4Addr::LOCALHOST, 1024).expect("unable to listen");
    let port = match listener.local_addr().expect("no local addr") {
        SocketAddr::V4(addr) => addr.port(),
        addr => panic!("unexpected listener address {}", addr),
    };

    let table: ConnTable = Rc::new(RefCell::new(HashMap::new()));
    let channel = Channel::new(listener.fd(), Rc::downgrade(event_loop));
    let weak_loop = Rc::downgrade(event_loop);
    let next_id = Cell::new(1u64);

    channel.set_read_callback(move || {
        let event_loop = match weak_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };
        while let Ok(Some(sock)) = listener.accept() {
            sock.set_nonblocking().expect("unable to set nonblocking");
            let id = next_id.get();
            next_id.set(id + 1);

            let conn = Connection::new(&event_loop, id, sock);
            configure(&conn, &table);
            table.borrow_mut().insert(id, Rc::clone(&conn));
            conn.established();
        }
    });
    // The poller's map keeps the channel (and the captured listener)
    // alive from here on.
    channel.enable_read();

    port
}

pub fn connect(port: u16) -> TcpStream {
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("unable to connect")
}

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
