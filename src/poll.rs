//! Readiness poller contract, plus a level-triggered mio implementation.
//!
//! The core never blocks on a socket; it subscribes file descriptors for
//! read/write readiness and re-enters the connection state machines when the
//! poller reports an event. Read interest stays armed for the whole life of
//! a socket; write interest is toggled by the egress path and the TLS
//! WANT_WRITE signal.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use fnv::FnvHashMap;
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::Logger;

#[derive(Debug, Copy, Clone)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// What the peering core asks of the surrounding event loop. Registration
/// calls are infallible from the caller's point of view; an implementation
/// logs failures and carries on.
pub trait PollSet {
    fn add_read(&mut self, fd: RawFd);
    fn add_write(&mut self, fd: RawFd);
    fn remove_read(&mut self, fd: RawFd);
    fn remove_write(&mut self, fd: RawFd);

    /// Blocks for up to `usec` microseconds and replaces the contents of
    /// `out` with whatever became ready.
    fn wait(&mut self, usec: u64, out: &mut Vec<PollEvent>) -> io::Result<()>;
}

/// Level-triggered poller keyed by raw fd, suitable for driving an
/// [`Endpoint`](crate::endpoint::Endpoint) from a plain loop.
pub struct MioPoll {
    log: Logger,
    poll: Poll,
    events: Events,
    interest: FnvHashMap<RawFd, Ready>,
}

impl MioPoll {
    pub fn new(log: Logger) -> io::Result<Self> {
        Ok(Self {
            log,
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            interest: FnvHashMap::default(),
        })
    }

    fn set_interest(&mut self, fd: RawFd, ready: Ready) {
        let prev = self
            .interest
            .get(&fd)
            .cloned()
            .unwrap_or_else(Ready::empty);
        if prev == ready {
            return;
        }
        let res = if ready.is_empty() {
            self.interest.remove(&fd);
            self.poll.deregister(&EventedFd(&fd))
        } else if prev.is_empty() {
            self.interest.insert(fd, ready);
            self.poll
                .register(&EventedFd(&fd), Token(fd as usize), ready, PollOpt::level())
        } else {
            self.interest.insert(fd, ready);
            self.poll
                .reregister(&EventedFd(&fd), Token(fd as usize), ready, PollOpt::level())
        };
        if let Err(e) = res {
            warn!(self.log, "poll registration failed"; "fd" => fd, "error" => %e);
        }
    }

    fn current(&self, fd: RawFd) -> Ready {
        self.interest
            .get(&fd)
            .cloned()
            .unwrap_or_else(Ready::empty)
    }
}

impl PollSet for MioPoll {
    fn add_read(&mut self, fd: RawFd) {
        let ready = self.current(fd) | Ready::readable();
        self.set_interest(fd, ready);
    }

    fn add_write(&mut self, fd: RawFd) {
        let ready = self.current(fd) | Ready::writable();
        self.set_interest(fd, ready);
    }

    fn remove_read(&mut self, fd: RawFd) {
        let ready = self.current(fd) - Ready::readable();
        self.set_interest(fd, ready);
    }

    fn remove_write(&mut self, fd: RawFd) {
        let ready = self.current(fd) - Ready::writable();
        self.set_interest(fd, ready);
    }

    fn wait(&mut self, usec: u64, out: &mut Vec<PollEvent>) -> io::Result<()> {
        out.clear();
        self.poll
            .poll(&mut self.events, Some(Duration::from_micros(usec)))?;
        for ev in self.events.iter() {
            let ready = ev.readiness();
            out.push(PollEvent {
                fd: ev.token().0 as RawFd,
                readable: ready.is_readable(),
                writable: ready.is_writable(),
            });
        }
        Ok(())
    }
}
