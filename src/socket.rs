//! Socket wrapper and error classification for the connection engine.

use std::io::{Error, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use socket2::SockRef;

/// An established, nonblocking TCP socket owned by a connection.
///
/// All readiness-driven I/O goes through the raw fd (the engine's buffers
/// issue their own `readv`/`sendfile` calls); this wrapper carries the
/// stream for its lifetime, the option setters, and the half-close.
#[derive(Debug)]
pub struct Socket {
    stream: TcpStream,
}

impl Socket {
    /// Take ownership of an established stream, switching it to
    /// nonblocking mode.
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.peer_addr()
    }

    pub fn set_keep_alive(&self, on: bool) -> Result<(), Error> {
        SockRef::from(&self.stream).set_keepalive(on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> Result<(), Error> {
        self.stream.set_nodelay(on)
    }

    /// Half-close: shut down the write side, leaving reads open for the
    /// peer's remaining data and FIN.
    pub fn close_write(&self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Write)
    }

    /// Consume the pending `SO_ERROR`, if any.
    pub fn take_error(&self) -> Result<Option<Error>, Error> {
        self.stream.take_error()
    }

    /// One nonblocking write. `Err` of [`is_would_block`] kind means the
    /// kernel buffer is full.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        (&self.stream).write(data)
    }

    /// Zero-copy file-to-socket transfer via `sendfile(2)`, advancing the
    /// file's own cursor. Capped per call; the kernel accepts what fits.
    #[cfg(target_os = "linux")]
    pub fn sendfile(&self, file_fd: RawFd, count: usize) -> Result<usize, Error> {
        let n = unsafe {
            libc::sendfile(
                self.stream.as_raw_fd(),
                file_fd,
                std::ptr::null_mut(),
                count,
            )
        };
        if n < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Normal backpressure: retry when the socket becomes ready again.
pub fn is_would_block(err: &Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

/// The peer is gone; the close will arrive as a separate readiness event,
/// so these are logged at trace only and otherwise ignored.
pub fn is_peer_gone(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ENOTCONN) | Some(libc::EBADMSG)
    )
}
