use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::trace;

use crate::event::Ready;
use crate::event_loop::EventLoop;

type Callback = Rc<dyn Fn()>;
type CallbackSlot = RefCell<Option<Callback>>;

/// Per-fd bundle of interest bits and event callbacks.
///
/// A `Channel` borrows its descriptor; ownership stays with the `Socket`,
/// the timer wheel, or the loop's wakeup fd, all of which outlive the
/// registration. Interest changes are pushed to the owning loop's poller
/// immediately.
pub struct Channel {
    fd: RawFd,
    interest: Cell<Ready>,
    revents: Cell<Ready>,
    event_loop: Weak<EventLoop>,
    read_cb: CallbackSlot,
    write_cb: CallbackSlot,
    error_cb: CallbackSlot,
    close_cb: CallbackSlot,
    // Fires before any other callback on every dispatch; connections use
    // it to refresh their idle timer.
    event_cb: CallbackSlot,
}

impl Channel {
    pub fn new(fd: RawFd, event_loop: Weak<EventLoop>) -> Rc<Channel> {
        Rc::new(Channel {
            fd,
            interest: Cell::new(Ready::EMPTY),
            revents: Cell::new(Ready::EMPTY),
            event_loop,
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            event_cb: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest.get()
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.revents.set(revents);
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(Ready::READABLE)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(Ready::WRITABLE)
    }

    pub fn set_read_callback(&self, cb: impl Fn() + 'static) {
        *self.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        *self.write_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        *self.error_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_event_callback(&self, cb: impl Fn() + 'static) {
        *self.event_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn enable_read(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | Ready::READABLE);
        self.update();
    }

    pub fn disable_read(self: &Rc<Self>) {
        self.interest.set(self.interest.get().remove(Ready::READABLE));
        self.update();
    }

    pub fn enable_write(self: &Rc<Self>) {
        self.interest.set(self.interest.get() | Ready::WRITABLE);
        self.update();
    }

    pub fn disable_write(self: &Rc<Self>) {
        self.interest.set(self.interest.get().remove(Ready::WRITABLE));
        self.update();
    }

    pub fn disable_all(self: &Rc<Self>) {
        self.interest.set(Ready::EMPTY);
        self.update();
    }

    fn update(self: &Rc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_event(self);
        }
    }

    /// Drop the registration entirely. The fd stays open; closing it is
    /// the owner's business.
    pub fn remove(self: &Rc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_event(self);
        }
    }

    fn invoke(slot: &CallbackSlot) {
        // Clone the callback out of the borrow before calling so the
        // callback itself may replace the slot.
        let cb = slot.borrow().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Dispatch one ready event using the mask stamped by the poller.
    ///
    /// Fixed order: the any-event callback first, then the read callback
    /// if any readable-group bit is set, then exactly one terminal
    /// callback (error, else write, else close). A peer that writes and
    /// immediately closes therefore delivers its final bytes before the
    /// close path runs, and the close path runs at most once per
    /// dispatch.
    pub fn handle_event(&self) {
        let revents = self.revents.get();
        trace!("fd {}: dispatch {:?}", self.fd, revents);

        Self::invoke(&self.event_cb);

        if revents.is_readable() {
            Self::invoke(&self.read_cb);
        }

        if revents.is_error() {
            Self::invoke(&self.error_cb);
        } else if revents.is_writable() {
            Self::invoke(&self.write_cb);
        } else if revents.is_hangup() {
            Self::invoke(&self.close_cb);
        }
    }
}
