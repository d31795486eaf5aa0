use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

/// An owned, non-copyable IPv4 stream socket.
///
/// The wrapped file descriptor is closed on drop; `close` may also be
/// called explicitly and is idempotent. A `Channel` registered for this
/// socket only borrows the descriptor and must be deregistered before
/// the socket is dropped.
pub struct Socket {
    fd: Option<OwnedFd>,
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    }
}

impl Socket {
    /// Create a fresh `AF_INET`/`SOCK_STREAM` socket.
    pub fn create() -> io::Result<Socket> {
        let fd = syscall!(socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP))
            .map_err(|err| {
                error!("create socket failed: {}", err);
                err
            })?;
        // SAFETY: `socket(2)` just returned this fd and nothing else owns it.
        Ok(Socket {
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    /// Adopt an already-open descriptor, e.g. one returned by `accept`.
    ///
    /// # Safety
    ///
    /// `fd` must be a live socket descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: Some(OwnedFd::from_raw_fd(fd)),
        }
    }

    /// The raw descriptor, or -1 once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    pub fn bind(&self, ip: Ipv4Addr, port: u16) -> io::Result<()> {
        let addr = sockaddr_in(ip, port);
        syscall!(bind(
            self.fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
        .map_err(|err| {
            error!("bind {}:{} failed: {}", ip, port, err);
            err
        })
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd(), backlog)).map(|_| ()).map_err(|err| {
            error!("listen failed: {}", err);
            err
        })
    }

    /// Connect to `ip:port`. On a non-blocking socket an in-progress
    /// connect is not an error.
    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> io::Result<()> {
        let addr = sockaddr_in(ip, port);
        syscall!(connect(
            self.fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
        .or_else(|err| {
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                Ok(())
            } else {
                error!("connect {}:{} failed: {}", ip, port, err);
                Err(err)
            }
        })
    }

    /// Accept one pending connection. `Ok(None)` when the queue is empty.
    pub fn accept(&self) -> io::Result<Option<Socket>> {
        match syscall!(accept(self.fd(), std::ptr::null_mut(), std::ptr::null_mut())) {
            // SAFETY: `accept(2)` just returned this fd.
            Ok(fd) => Ok(Some(unsafe { Socket::from_raw_fd(fd) })),
            Err(ref err) if would_block(err) => Ok(None),
            Err(err) => {
                error!("accept failed: {}", err);
                Err(err)
            }
        }
    }

    /// Receive into `buf`. `Ok(None)` when the socket is not ready
    /// (`EAGAIN`/`EINTR`), `Ok(Some(0))` on end of stream.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match syscall!(recv(
            self.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )) {
            Ok(n) => Ok(Some(n as usize)),
            Err(ref err) if would_block(err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Send from `buf`. `Ok(None)` when the socket is not ready.
    pub fn send(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        match syscall!(send(
            self.fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )) {
            Ok(n) => Ok(Some(n as usize)),
            Err(ref err) if would_block(err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Close the descriptor now instead of at drop. Safe to call twice.
    pub fn close(&mut self) {
        drop(self.fd.take());
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = syscall!(fcntl(self.fd(), libc::F_GETFL, 0)).map_err(|err| {
            error!("get socket flags failed: {}", err);
            err
        })?;
        syscall!(fcntl(self.fd(), libc::F_SETFL, flags | libc::O_NONBLOCK))
            .map(|_| ())
            .map_err(|err| {
                error!("set nonblocking failed: {}", err);
                err
            })
    }

    /// Enable `SO_REUSEADDR` and `SO_REUSEPORT`.
    pub fn set_reuse(&self) -> io::Result<()> {
        let opt: libc::c_int = 1;
        syscall!(setsockopt(
            self.fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .and_then(|_| {
            syscall!(setsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const libc::c_int as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            ))
        })
        .map(|_| ())
        .map_err(|err| {
            error!("set reuse address/port failed: {}", err);
            err
        })
    }

    /// The locally bound address, from `getsockname`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd(),
            &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        ))?;
        if storage.sin_family as libc::c_int != libc::AF_INET {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let ip = Ipv4Addr::from(storage.sin_addr.s_addr.to_ne_bytes());
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(storage.sin_port))))
    }

    /// Create, configure and start a listening socket in one call.
    pub fn make_server(
        port: u16,
        nonblocking: bool,
        ip: Ipv4Addr,
        backlog: i32,
    ) -> io::Result<Socket> {
        let sock = Socket::create()?;
        sock.set_reuse()?;
        sock.bind(ip, port)?;
        sock.listen(backlog)?;
        if nonblocking {
            sock.set_nonblocking()?;
        }
        Ok(sock)
    }

    /// Create a non-blocking client socket connected (or connecting)
    /// to `ip:port`.
    pub fn make_client(port: u16, ip: Ipv4Addr) -> io::Result<Socket> {
        let sock = Socket::create()?;
        sock.connect(ip, port)?;
        sock.set_nonblocking()?;
        Ok(sock)
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
