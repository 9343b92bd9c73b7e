//! Per-fd readiness-interest handle.

use std::io::Error;
use std::os::fd::RawFd;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

/// Tracks which readiness bits a connection's fd is subscribed to and
/// pushes changes to the poller's registry.
///
/// The first enable registers the fd; later changes reregister; dropping
/// both interests deregisters. The owning connection is kept alive for the
/// duration of readiness dispatch by the loop's connection table, so a late
/// event can never observe a dangling owner.
pub struct Channel {
    registry: Registry,
    token: Token,
    fd: RawFd,
    reading: bool,
    writing: bool,
    registered: bool,
}

impl Channel {
    pub fn new(registry: Registry, token: Token, fd: RawFd) -> Self {
        Self {
            registry,
            token,
            fd,
            reading: false,
            writing: false,
            registered: false,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn enable_reading(&mut self) -> Result<(), Error> {
        self.reading = true;
        self.update()
    }

    pub fn enable_writing(&mut self) -> Result<(), Error> {
        self.writing = true;
        self.update()
    }

    pub fn disable_writing(&mut self) -> Result<(), Error> {
        self.writing = false;
        self.update()
    }

    /// Drop all interest and deregister the fd.
    pub fn disable_all(&mut self) -> Result<(), Error> {
        self.reading = false;
        self.writing = false;
        self.update()
    }

    fn update(&mut self) -> Result<(), Error> {
        let interest = match (self.reading, self.writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        match interest {
            Some(interest) if self.registered => {
                self.registry
                    .reregister(&mut SourceFd(&self.fd), self.token, interest)
            }
            Some(interest) => {
                self.registered = true;
                self.registry
                    .register(&mut SourceFd(&self.fd), self.token, interest)
            }
            None if self.registered => {
                self.registered = false;
                self.registry.deregister(&mut SourceFd(&self.fd))
            }
            None => Ok(()),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.registered {
            self.registry.deregister(&mut SourceFd(&self.fd)).ok();
        }
    }
}
