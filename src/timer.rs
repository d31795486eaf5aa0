use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Number of wheel slots; the maximum expressible timeout is one less.
pub const WHEEL_SLOTS: usize = 60;

/// One scheduled task, fired by dropping the last owning reference.
///
/// Expiry is tied to destruction: every wheel slot holding the task keeps
/// it alive, refreshing appends another owning reference to a later slot,
/// and the hand clearing the final slot drops the task, which runs the
/// body (unless canceled) and then the release hook.
pub(crate) struct TimerTask {
    timeout: u64,
    task: Box<dyn Fn()>,
    release: Option<Box<dyn FnOnce()>>,
    canceled: Cell<bool>,
}

impl TimerTask {
    fn new(timeout: u64, task: Box<dyn Fn()>, release: Box<dyn FnOnce()>) -> TimerTask {
        TimerTask {
            timeout,
            task,
            release: Some(release),
            canceled: Cell::new(false),
        }
    }

    fn cancel(&self) {
        self.canceled.set(true);
    }

    fn timeout(&self) -> u64 {
        self.timeout
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if !self.canceled.get() {
            (self.task)();
        }
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Hashed timer wheel over a 1 s monotonic timerfd tick.
///
/// Each slot holds owning references to its tasks; a map of weak
/// references keyed by task id gives O(1) refresh and cancel. A task is
/// alive exactly as long as at least one slot still owns it.
pub struct TimerWheel {
    timer_fd: OwnedFd,
    channel: Rc<Channel>,
    hand: Cell<usize>,
    slots: RefCell<Vec<Vec<Rc<TimerTask>>>>,
    tasks: RefCell<HashMap<u64, Weak<TimerTask>>>,
}

impl TimerWheel {
    /// Create the armed 1 s periodic timerfd backing a wheel. Split from
    /// construction because the wheel itself is built inside the loop's
    /// cyclic allocation, where nothing may fail.
    pub(crate) fn create_timer_fd() -> io::Result<OwnedFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))
        .map_err(|err| {
            error!("create timerfd failed: {}", err);
            err
        })?;
        // SAFETY: `timerfd_create(2)` just returned this fd.
        let timer_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 1, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 1, tv_nsec: 0 },
        };
        syscall!(timerfd_settime(
            timer_fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        ))?;

        Ok(timer_fd)
    }

    pub(crate) fn with_fd(timer_fd: OwnedFd, event_loop: Weak<EventLoop>) -> TimerWheel {
        let channel = Channel::new(timer_fd.as_raw_fd(), event_loop);

        TimerWheel {
            timer_fd,
            channel,
            hand: Cell::new(0),
            slots: RefCell::new(vec![Vec::new(); WHEEL_SLOTS]),
            tasks: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    /// Read callback of the timerfd channel. One successful 8-byte read
    /// advances the hand one tick; short reads and not-ready reads are
    /// tolerated per the timerfd contract.
    pub(crate) fn on_timer_read(&self) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.timer_fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(n) if n as usize == buf.len() => self.tick(),
            Ok(_) => {}
            Err(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                error!("read timerfd failed: {}", err);
                panic!("read timerfd failed: {}", err);
            }
        }
    }

    fn tick(&self) {
        let hand = (self.hand.get() + 1) % WHEEL_SLOTS;
        self.hand.set(hand);

        // Take the slot's contents out before dropping them so expiry
        // bodies may re-enter add_task/refresh_task on this wheel.
        let expired = std::mem::take(&mut self.slots.borrow_mut()[hand]);
        trace!("tick to slot {}, {} refs expire", hand, expired.len());
        drop(expired);
    }

    /// Schedule `task` to fire `timeout` ticks from now.
    ///
    /// `timeout` must be in `1..WHEEL_SLOTS`; anything else cannot be
    /// represented on the wheel and is a programming error.
    pub(crate) fn add_task(
        &self,
        event_loop: &Rc<EventLoop>,
        id: u64,
        timeout: u64,
        task: Box<dyn Fn()>,
    ) {
        assert!(
            (1..WHEEL_SLOTS as u64).contains(&timeout),
            "timer timeout {} outside 1..{}",
            timeout,
            WHEEL_SLOTS,
        );

        let weak_loop = Rc::downgrade(event_loop);
        let release = Box::new(move || {
            if let Some(event_loop) = weak_loop.upgrade() {
                let mut tasks = event_loop.wheel().tasks.borrow_mut();
                // Only erase the entry while it points at the task being
                // dropped; a newer task registered under the same id must
                // keep its entry.
                if let Some(entry) = tasks.get(&id) {
                    if entry.upgrade().is_none() {
                        tasks.remove(&id);
                    }
                }
            }
        });

        let task = Rc::new(TimerTask::new(timeout, task, release));
        let slot = (self.hand.get() + timeout as usize) % WHEEL_SLOTS;
        debug!("timer {}: scheduled in slot {} ({} ticks)", id, slot, timeout);

        self.tasks.borrow_mut().insert(id, Rc::downgrade(&task));
        self.slots.borrow_mut()[slot].push(task);
    }

    /// Push the task's expiry out by its original timeout, by handing an
    /// additional owning reference to a later slot.
    pub(crate) fn refresh_task(&self, id: u64) {
        let task = self
            .tasks
            .borrow()
            .get(&id)
            .and_then(|weak| weak.upgrade());
        if let Some(task) = task {
            let slot = (self.hand.get() + task.timeout() as usize) % WHEEL_SLOTS;
            trace!("timer {}: refreshed into slot {}", id, slot);
            self.slots.borrow_mut()[slot].push(task);
        }
    }

    /// Cancel the task. References already parked in slots stay until the
    /// hand reaches them; their drop runs only the release hook.
    pub(crate) fn remove_task(&self, id: u64) {
        let mut tasks = self.tasks.borrow_mut();
        if let Some(weak) = tasks.remove(&id) {
            if let Some(task) = weak.upgrade() {
                debug!("timer {}: canceled", id);
                task.cancel();
            }
        }
    }

    pub(crate) fn has_task(&self, id: u64) -> bool {
        self.tasks.borrow().contains_key(&id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn counting_task(fired: &Rc<Cell<u32>>, released: &Rc<Cell<u32>>) -> Rc<TimerTask> {
        let fired = Rc::clone(fired);
        let released = Rc::clone(released);
        Rc::new(TimerTask::new(
            3,
            Box::new(move || fired.set(fired.get() + 1)),
            Box::new(move || released.set(released.get() + 1)),
        ))
    }

    #[test]
    fn drop_runs_task_then_release() {
        let fired = Rc::new(Cell::new(0));
        let released = Rc::new(Cell::new(0));

        let task = counting_task(&fired, &released);
        drop(task);

        assert_eq!(fired.get(), 1);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn extra_references_defer_expiry() {
        let fired = Rc::new(Cell::new(0));
        let released = Rc::new(Cell::new(0));

        let task = counting_task(&fired, &released);
        let refreshed = Rc::clone(&task);

        // The first slot clearing drops one reference; nothing fires.
        drop(task);
        assert_eq!(fired.get(), 0);

        // The later slot drops the last reference; the task fires once.
        drop(refreshed);
        assert_eq!(fired.get(), 1);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn cancel_skips_body_but_not_release() {
        let fired = Rc::new(Cell::new(0));
        let released = Rc::new(Cell::new(0));

        let task = counting_task(&fired, &released);
        task.cancel();
        drop(task);

        assert_eq!(fired.get(), 0);
        assert_eq!(released.get(), 1);
    }
}
