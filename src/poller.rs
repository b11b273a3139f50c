//! Readiness polling over `poll(2)`.
//!
//! The poller tracks the registered descriptor set and each descriptor's
//! interest mask; `poll_once` blocks for up to one second and reports the
//! subset with non-empty readiness.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use anyhow::{bail, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Readiness reported for one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

#[derive(Debug, Default)]
pub struct Poller {
    // Registration order is kept so poll results are stable.
    fds: Vec<RawFd>,
    interest: HashMap<RawFd, PollFlags>,
}

impl Poller {
    pub fn new() -> Poller {
        Poller::default()
    }

    pub fn watch(&mut self, fd: RawFd, interest: PollFlags) -> Result<()> {
        if self.interest.contains_key(&fd) {
            bail!("fd {} is already being monitored", fd);
        }
        self.fds.push(fd);
        self.interest.insert(fd, interest);
        Ok(())
    }

    pub fn update(&mut self, fd: RawFd, interest: PollFlags) -> Result<()> {
        match self.interest.get_mut(&fd) {
            Some(events) => {
                *events = interest;
                Ok(())
            }
            None => bail!("fd {} is not being monitored", fd),
        }
    }

    pub fn unwatch(&mut self, fd: RawFd) -> Result<()> {
        if self.interest.remove(&fd).is_none() {
            bail!("fd {} is not being monitored", fd);
        }
        self.fds.retain(|&watched| watched != fd);
        Ok(())
    }

    /// One `poll` round. EINTR and timeout both yield an empty batch; the
    /// outer loop just re-enters.
    pub fn poll_once(&mut self) -> Result<Vec<Event>> {
        if self.fds.is_empty() {
            return Ok(Vec::new());
        }
        let mut poll_fds: Vec<PollFd> = self
            .fds
            .iter()
            .map(|&fd| PollFd::new(fd, self.interest[&fd]))
            .collect();
        match poll(&mut poll_fds, POLL_TIMEOUT_MS) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EINTR)) => return Ok(Vec::new()),
            Err(e) => bail!("poll failed: {}", e),
        }
        let mut events = Vec::new();
        for (i, poll_fd) in poll_fds.iter().enumerate() {
            let revents = match poll_fd.revents() {
                Some(revents) if !revents.is_empty() => revents,
                _ => continue,
            };
            events.push(Event {
                fd: self.fds[i],
                readable: revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLPRI),
                writable: revents.contains(PollFlags::POLLOUT),
                error: revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                hup: revents.contains(PollFlags::POLLHUP),
            });
        }
        Ok(events)
    }
}

/// Interest mask for reading.
pub fn read_interest() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLPRI
}

/// Interest mask for writing.
pub fn write_interest() -> PollFlags {
    PollFlags::POLLOUT
}
