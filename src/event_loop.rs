use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, trace, warn};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timer::TimerWheel;

type Task = Box<dyn FnOnce() + Send>;

/// State shared between the loop and its handles: the pending-task queue
/// behind the crate's only mutex, plus the eventfd that unblocks the
/// poller when a task arrives from another thread.
struct Shared {
    owner: ThreadId,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    wakeup_fd: OwnedFd,
}

impl Shared {
    fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let res = syscall!(write(
            self.wakeup_fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ));
        if let Err(err) = res {
            // Only fails when the counter would overflow, in which case
            // the loop is awake already.
            warn!("write eventfd failed: {}", err);
        }
    }
}

/// Single-threaded reactor: an epoll poller, a timer wheel, and a
/// cross-thread task queue, pinned to the thread that created it.
///
/// `EventLoop` is neither `Send` nor `Sync`, so every registration,
/// timer slot and connection it drives is reachable only from the owning
/// thread; other threads submit work through a [`LoopHandle`].
///
/// One loop iteration polls for readiness, dispatches every ready
/// channel in kernel return order, and then drains the pending-task
/// queue. A task enqueued while dispatch is in progress therefore runs
/// no earlier than after all dispatches of that iteration.
pub struct EventLoop {
    shared: Arc<Shared>,
    wakeup_channel: Rc<Channel>,
    poller: RefCell<Poller>,
    wheel: TimerWheel,
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    pub fn new() -> io::Result<Rc<EventLoop>> {
        let poller = Poller::new()?;

        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)).map_err(|err| {
            error!("create eventfd failed: {}", err);
            err
        })?;
        // SAFETY: `eventfd(2)` just returned this fd.
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let wakeup_raw = wakeup_fd.as_raw_fd();
        let timer_fd = TimerWheel::create_timer_fd()?;

        let shared = Arc::new(Shared {
            owner: thread::current().id(),
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            wakeup_fd,
        });

        let event_loop = Rc::new_cyclic(|weak| EventLoop {
            shared,
            wakeup_channel: Channel::new(wakeup_raw, weak.clone()),
            poller: RefCell::new(poller),
            wheel: TimerWheel::with_fd(timer_fd, weak.clone()),
        });

        // Wire the internal channels now that the loop exists.
        let weak = Rc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.drain_wakeup();
            }
        });
        event_loop.wakeup_channel.enable_read();

        let weak = Rc::downgrade(&event_loop);
        event_loop.wheel.channel().set_read_callback(move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.wheel.on_timer_read();
            }
        });
        event_loop.wheel.channel().enable_read();

        Ok(event_loop)
    }

    /// A `Send + Sync` handle for submitting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Run `task` on the loop thread.
    ///
    /// A caller holding a reference to the loop is already on the owning
    /// thread (the type is neither `Send` nor `Sync`), so the task runs
    /// synchronously. Cross-thread submission goes through
    /// [`LoopHandle::run_in_loop`], which enqueues and wakes the poller.
    pub fn run_in_loop(&self, task: impl FnOnce()) {
        debug_assert!(self.is_in_loop_thread());
        task();
    }

    /// Push the channel's interest mask to the poller.
    pub fn update_event(&self, channel: &Rc<Channel>) {
        self.poller.borrow_mut().update(channel);
    }

    /// Deregister the channel from the poller.
    pub fn remove_event(&self, channel: &Rc<Channel>) {
        self.poller.borrow_mut().remove(channel);
    }

    /// Schedule `task` under `id`, `timeout` ticks (seconds) from now.
    pub fn run_after(self: &Rc<Self>, id: u64, timeout: u64, task: impl Fn() + 'static) {
        let event_loop = Rc::clone(self);
        self.run_in_loop(move || {
            event_loop
                .wheel
                .add_task(&event_loop, id, timeout, Box::new(task));
        });
    }

    /// Push the task's expiry out by its original timeout.
    pub fn refresh_after(&self, id: u64) {
        self.run_in_loop(|| self.wheel.refresh_task(id));
    }

    /// Cancel the task registered under `id`.
    pub fn remove_after(&self, id: u64) {
        self.run_in_loop(|| self.wheel.remove_task(id));
    }

    pub fn has_after(&self, id: u64) -> bool {
        self.wheel.has_task(id)
    }

    pub(crate) fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Run until [`quit`](EventLoop::quit) is requested.
    pub fn run(self: &Rc<Self>) {
        trace!("event loop started");
        while !self.shared.quit.load(Ordering::Acquire) {
            self.run_once(None);
        }
        trace!("event loop stopped");
    }

    /// One iteration: poll with the given bound, dispatch every ready
    /// channel, then drain pending tasks.
    pub fn run_once(self: &Rc<Self>, timeout: Option<Duration>) {
        let mut active = Vec::new();
        self.poller.borrow_mut().poll(timeout, &mut active);

        for channel in &active {
            channel.handle_event();
        }

        self.run_pending_tasks();
    }

    /// Stop the loop after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wake();
    }

    fn run_pending_tasks(&self) {
        // Swap the queue out under the lock; the tasks themselves run
        // without it so they may enqueue more work.
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
    }

    /// Read callback of the wakeup channel: consume the eventfd counter
    /// so any number of wakeups coalesce into one readable event.
    fn drain_wakeup(&self) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.shared.wakeup_fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(_) => {}
            Err(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                error!("read eventfd failed: {}", err);
                panic!("read eventfd failed: {}", err);
            }
        }
    }
}

/// Cloneable cross-thread handle to an [`EventLoop`].
///
/// This is the only way another thread interacts with a loop: tasks are
/// enqueued behind the shared mutex and the loop is woken through its
/// eventfd. Tasks submitted from one thread run in submission order.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Run `task` on the loop thread: synchronously when the caller is
    /// the owning thread, otherwise enqueued for the next iteration.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if thread::current().id() == self.shared.owner {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueue, even on the owning thread. The task runs no
    /// earlier than the pending-drain of the next loop iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        self.shared.wake();
    }

    /// Unblock the poller without submitting a task.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Stop the loop after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wake();
    }
}
