//! A readiness-based TCP reactor runtime for Linux.
//!
//! muxio provides the building blocks for a high-concurrency network
//! service: a single-threaded [`EventLoop`] driving an epoll [`Poller`],
//! per-fd [`Channel`]s that dispatch readiness callbacks in a fixed order,
//! buffered [`Connection`]s over non-blocking [`Socket`]s, and a hashed
//! [`TimerWheel`] for idle-connection reaping and deferred tasks.
//!
//! # Threading model
//!
//! Every loop is pinned to the thread that created it. All reactor state
//! (readiness registrations, timer slots, per-connection buffers and
//! lifecycle) is mutated only on that thread; the types enforce this by
//! being neither `Send` nor `Sync`. Other threads interact through a
//! [`LoopHandle`], which enqueues tasks behind a mutex and wakes the loop
//! through an eventfd.
//!
//! # Example
//!
//! ```no_run
//! use muxio::EventLoop;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let handle = event_loop.handle();
//!
//! // A task submitted from any thread runs on the loop thread.
//! handle.run_in_loop(|| println!("hello from the loop"));
//!
//! // Run a deferred task three ticks (seconds) from now.
//! event_loop.run_after(1, 3, || println!("three seconds later"));
//!
//! event_loop.run();
//! ```

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod buffer;
mod channel;
mod connection;
mod event;
mod event_loop;
mod poller;
mod socket;
mod timer;

pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{ConnState, Connection};
pub use event::Ready;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::Poller;
pub use socket::Socket;
pub use timer::{TimerWheel, WHEEL_SLOTS};
