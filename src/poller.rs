use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{error, trace, warn};

use crate::channel::Channel;
use crate::event::Ready;

const EVENTS_CAPACITY: usize = 1024;

/// Readiness demultiplexer over a set of channels.
///
/// Every fd registered with the kernel has an entry in the map and vice
/// versa; `update` routes to ADD or MOD based on map presence, `remove`
/// deletes both sides. An event for an fd missing from the map means the
/// map and the kernel set diverged, which is corruption, not a condition
/// to recover from.
pub struct Poller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            // SAFETY: `epoll_create1(2)` ensures the fd is valid.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            events: Vec::with_capacity(EVENTS_CAPACITY),
            channels: HashMap::new(),
        })
    }

    fn epoll_op(&self, op: libc::c_int, fd: RawFd, interest: Ready) {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            error!("epoll op {} on fd {} failed: {}", op, fd, err);
            panic!("epoll op failed: {}", err);
        }
    }

    /// Push the channel's current interest mask to the kernel,
    /// registering the fd first if it is new.
    pub fn update(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        if self.channels.contains_key(&fd) {
            self.epoll_op(libc::EPOLL_CTL_MOD, fd, channel.interest());
        } else {
            trace!("registering fd {} with the poller", fd);
            self.epoll_op(libc::EPOLL_CTL_ADD, fd, channel.interest());
            self.channels.insert(fd, Rc::clone(channel));
        }
    }

    /// Deregister the channel's fd. A second remove is a no-op.
    pub fn remove(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        if self.channels.remove(&fd).is_some() {
            trace!("deregistering fd {} from the poller", fd);
            self.epoll_op(libc::EPOLL_CTL_DEL, fd, Ready::EMPTY);
        }
    }

    /// Wait up to `timeout` for readiness (`None` = indefinitely), stamp
    /// each ready channel's received mask and append it to `active` in
    /// kernel return order. An interrupted wait returns with `active`
    /// untouched.
    pub fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Rc<Channel>>) {
        let timeout = timeout.map_or(-1, |to| to.as_millis() as libc::c_int);

        self.events.clear();
        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                warn!("epoll wait interrupted");
                return;
            }
            Err(err) => {
                error!("epoll wait failed: {}", err);
                panic!("epoll wait failed: {}", err);
            }
        };
        // SAFETY: `epoll_wait` initialised the first `n` events.
        unsafe { self.events.set_len(n) };

        for event in &self.events {
            let fd = event.u64 as RawFd;
            let channel = match self.channels.get(&fd) {
                Some(channel) => channel,
                None => {
                    error!("event for fd {} which has no channel", fd);
                    panic!("poller map out of sync with kernel");
                }
            };
            channel.set_revents(Ready::from_bits(event.events));
            active.push(Rc::clone(channel));
        }
    }
}
