use std::fmt;
use std::ops;

/// A set of readiness bits, used both as a `Channel`'s interest mask and
/// as the received mask stamped by the `Poller`.
///
/// The bits are raw epoll flags. Read interest covers readable, priority
/// and peer-shutdown readiness; error and hangup are always reported by
/// the kernel regardless of interest.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ready(u32);

const READABLE: u32 = (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
const WRITABLE: u32 = libc::EPOLLOUT as u32;
const ERROR: u32 = libc::EPOLLERR as u32;
const HANGUP: u32 = libc::EPOLLHUP as u32;

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(READABLE);
    pub const WRITABLE: Ready = Ready(WRITABLE);

    pub(crate) fn from_bits(bits: u32) -> Ready {
        Ready(bits)
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Readable, urgent data pending, or the peer shut down its write half.
    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    /// Both halves closed. Peer-shutdown (`EPOLLRDHUP`) is part of the
    /// readable group instead, so a final burst of bytes is never skipped.
    pub fn is_hangup(self) -> bool {
        self.0 & HANGUP != 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready(READABLE), "Readable"),
            (Ready(WRITABLE), "Writable"),
            (Ready(ERROR), "Error"),
            (Ready(HANGUP), "Hangup"),
        ];

        for (flag, msg) in flags {
            if !(*self & flag).is_empty() {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}
