use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

/// Connection lifecycle. Transitions are driven by `established`, I/O
/// and `shutdown`; the close path is a no-op once `Disconnected`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

type ConnCallback = Rc<dyn Fn(&Rc<Connection>)>;
type MessageCallback = Rc<dyn Fn(&Rc<Connection>, &mut Buffer)>;

const RECV_CHUNK: usize = 65536;

/// One TCP peer: an owned socket, its channel, an input and an output
/// buffer, and the user's callbacks.
///
/// Connections live on their loop's thread and are handled as
/// `Rc<Connection>`; the embedder's registry holds the owning references
/// and releases them from the close callback. The channel's callbacks
/// hold only weak references, so an unregistered connection cannot be
/// kept alive by its own event wiring.
pub struct Connection {
    id: u64,
    sock: Socket,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    state: Cell<ConnState>,
    context: RefCell<Option<Box<dyn Any>>>,
    idle_timeout: Cell<Option<u64>>,
    event_loop: Weak<EventLoop>,
    connected_cb: RefCell<Option<ConnCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    close_cb: RefCell<Option<ConnCallback>>,
    event_cb: RefCell<Option<ConnCallback>>,
}

impl Connection {
    /// Wrap an accepted (or connecting) socket. The new connection is in
    /// `Connecting`; call [`established`](Connection::established) on the
    /// owning loop once the callbacks are set.
    pub fn new(event_loop: &Rc<EventLoop>, id: u64, sock: Socket) -> Rc<Connection> {
        let channel = Channel::new(sock.fd(), Rc::downgrade(event_loop));

        let conn = Rc::new(Connection {
            id,
            sock,
            channel,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            state: Cell::new(ConnState::Connecting),
            context: RefCell::new(None),
            idle_timeout: Cell::new(None),
            event_loop: Rc::downgrade(event_loop),
            connected_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            event_cb: RefCell::new(None),
        });

        let weak = Rc::downgrade(&conn);
        conn.channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.channel.set_event_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_any_event();
            }
        });

        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.sock.fd()
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn set_connected_callback(&self, cb: impl Fn(&Rc<Connection>) + 'static) {
        *self.connected_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// The message callback owns the decision to consume bytes from the
    /// input buffer; unconsumed bytes are offered again with the next
    /// arrival.
    pub fn set_message_callback(&self, cb: impl Fn(&Rc<Connection>, &mut Buffer) + 'static) {
        *self.message_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn(&Rc<Connection>) + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_event_callback(&self, cb: impl Fn(&Rc<Connection>) + 'static) {
        *self.event_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Attach an opaque per-connection value; replaced on re-set and
    /// dropped when the connection closes.
    pub fn set_context<C: Any>(&self, context: C) {
        *self.context.borrow_mut() = Some(Box::new(context));
    }

    /// Borrow the context as `C`. `None` when unset or of another type.
    pub fn with_context<C: Any, R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.context
            .borrow_mut()
            .as_mut()
            .and_then(|ctx| ctx.downcast_mut::<C>())
            .map(f)
    }

    /// Mark the connection live on the owning loop: enables read
    /// interest, moves to `Connected` and fires the connected callback.
    pub fn established(self: &Rc<Self>) {
        assert_eq!(self.state.get(), ConnState::Connecting);
        self.channel.enable_read();
        self.state.set(ConnState::Connected);
        debug!("conn {}: established on fd {}", self.id, self.fd());

        let cb = self.connected_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Queue `data` and make sure write readiness is being watched; the
    /// actual flush happens in the write callback.
    pub fn send(self: &Rc<Self>, data: &[u8]) {
        match self.state.get() {
            ConnState::Connected => {}
            state => {
                warn!("conn {}: send in state {:?} dropped", self.id, state);
                return;
            }
        }

        self.output.borrow_mut().write(data);
        if !self.channel.is_writing() {
            self.channel.enable_write();
        }
    }

    /// Begin an orderly shutdown: close now if nothing is queued,
    /// otherwise close once the output buffer drains.
    pub fn shutdown(self: &Rc<Self>) {
        if self.state.get() == ConnState::Disconnected {
            return;
        }
        self.state.set(ConnState::Disconnecting);
        if self.output.borrow().readable_size() == 0 {
            self.handle_close();
        }
    }

    /// Close this connection when no event arrives for `ticks` seconds;
    /// any event on the channel pushes the deadline out again.
    pub fn set_idle_timeout(self: &Rc<Self>, ticks: u64) {
        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };
        self.idle_timeout.set(Some(ticks));

        let weak = Rc::downgrade(self);
        event_loop.run_after(self.id, ticks, move || {
            if let Some(conn) = weak.upgrade() {
                debug!("conn {}: idle timeout expired", conn.id);
                conn.handle_close();
            }
        });
    }

    fn handle_read(self: &Rc<Self>) {
        // A callback earlier in this dispatch may have closed us; touching
        // the channel again would re-register the deregistered fd.
        if self.state.get() == ConnState::Disconnected {
            return;
        }

        let mut peer_closed = false;

        {
            let mut input = self.input.borrow_mut();
            let mut chunk = [0u8; RECV_CHUNK];
            loop {
                match self.sock.recv(&mut chunk) {
                    Ok(Some(0)) => {
                        trace!("conn {}: peer closed", self.id);
                        peer_closed = true;
                        break;
                    }
                    Ok(Some(n)) => input.write(&chunk[..n]),
                    Ok(None) => break,
                    Err(err) => {
                        error!("conn {}: recv failed: {}", self.id, err);
                        peer_closed = true;
                        break;
                    }
                }
            }
        }

        // Deliver what arrived before acting on EOF, so a peer that
        // writes and immediately closes loses nothing.
        if self.input.borrow().readable_size() > 0 {
            let cb = self.message_cb.borrow().clone();
            if let Some(cb) = cb {
                let mut input = self.input.borrow_mut();
                cb(self, &mut input);
            }
        }

        if peer_closed {
            self.handle_close();
        }
    }

    fn handle_write(self: &Rc<Self>) {
        if self.state.get() == ConnState::Disconnected {
            return;
        }

        let mut broken = false;

        {
            let mut output = self.output.borrow_mut();
            while output.readable_size() > 0 {
                match self.sock.send(output.readable()) {
                    Ok(Some(0)) | Ok(None) => break,
                    Ok(Some(n)) => output.advance(n),
                    Err(err) => {
                        error!("conn {}: send failed: {}", self.id, err);
                        broken = true;
                        break;
                    }
                }
            }
        }

        if broken {
            self.handle_close();
            return;
        }

        if self.output.borrow().readable_size() == 0 {
            self.channel.disable_write();
            if self.state.get() == ConnState::Disconnecting {
                self.handle_close();
            }
        }
    }

    fn handle_error(self: &Rc<Self>) {
        trace!("conn {}: error event", self.id);
        self.handle_close();
    }

    /// The close path. Safe to reach from several triggers: the first
    /// call deregisters and fires the user callback, later calls see
    /// `Disconnected` and return.
    fn handle_close(self: &Rc<Self>) {
        if self.state.get() == ConnState::Disconnected {
            return;
        }
        self.state.set(ConnState::Disconnected);
        debug!("conn {}: closed", self.id);

        self.channel.disable_all();
        self.channel.remove();

        if let Some(event_loop) = self.event_loop.upgrade() {
            if self.idle_timeout.get().is_some() && event_loop.has_after(self.id) {
                event_loop.remove_after(self.id);
            }
        }

        let cb = self.close_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }

        self.context.borrow_mut().take();
    }

    fn handle_any_event(self: &Rc<Self>) {
        if self.state.get() == ConnState::Disconnected {
            return;
        }

        if self.idle_timeout.get().is_some() {
            if let Some(event_loop) = self.event_loop.upgrade() {
                if event_loop.has_after(self.id) {
                    event_loop.refresh_after(self.id);
                }
            }
        }

        let cb = self.event_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("conn {}: dropped (fd {})", self.id, self.sock.fd());
    }
}
