//! Thin wrapper around epoll.
//!
//! Every registration carries an opaque 64-bit [`Tag`] that comes back with
//! each readiness event. The runtime uses the fd itself as the tag so events
//! dispatch without a lookup table.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Opaque value attached to a poller registration and returned on readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    pub fn new(value: u64) -> Tag {
        Tag(value)
    }

    pub fn of_fd(fd: RawFd) -> Tag {
        Tag(fd as u64)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn fd(self) -> RawFd {
        self.0 as RawFd
    }
}

/// Readiness interest set: a subset of {read, write, hangup, shutdown}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(1 << 1);
    pub const HANGUP: Interest = Interest(1 << 2);
    /// Remote end shut down its writing half (EPOLLRDHUP).
    pub const SHUTDOWN: Interest = Interest(1 << 3);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.contains(Interest::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        if self.contains(Interest::HANGUP) {
            events |= libc::EPOLLHUP as u32;
        }
        if self.contains(Interest::SHUTDOWN) {
            events |= libc::EPOLLRDHUP as u32;
        }
        events
    }

    fn from_epoll(events: u32) -> Interest {
        let mut interest = Interest::NONE;
        if events & libc::EPOLLIN as u32 != 0 {
            interest = interest | Interest::READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            interest = interest | Interest::WRITE;
        }
        // EPOLLERR is always reported; fold it into hangup so errored
        // sockets reach the disconnection path.
        if events & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
            interest = interest | Interest::HANGUP;
        }
        if events & libc::EPOLLRDHUP as u32 != 0 {
            interest = interest | Interest::SHUTDOWN;
        }
        interest
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Trigger mode for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Edge,
    Level,
}

/// One readiness event delivered by [`Poller::poll`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub tag: Tag,
    pub flags: Interest,
}

/// Edge-capable readiness multiplexer over a single epoll instance.
///
/// All registration calls are safe from any thread; `poll` is driven by the
/// owning reactor. Spurious wakeups are possible and callers re-check.
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epoll_fd })
    }

    /// Register `fd` with the given interest set.
    pub fn add(&self, fd: RawFd, interest: Interest, tag: Tag, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, tag, mode, false)
    }

    /// Register `fd` for a single delivery; the kernel disarms it afterwards
    /// and it must be rearmed to fire again.
    pub fn add_oneshot(&self, fd: RawFd, interest: Interest, tag: Tag, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, tag, mode, true)
    }

    /// Replace the active interest set of an already-registered fd.
    pub fn rearm(&self, fd: RawFd, interest: Interest, tag: Tag, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, tag, mode, false)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // A zeroed event, not an uninitialized one: pre-2.6.9 kernels read it.
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout` (`None` = indefinitely) and append up to
    /// `max_events` events. Returns the number delivered; an interrupted wait
    /// reports zero events rather than an error.
    pub fn poll(
        &self,
        events: &mut Vec<Event>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(max_events);
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                raw.as_mut_ptr(),
                max_events as i32,
                timeout_ms,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        unsafe { raw.set_len(ready as usize) };

        for ev in &raw {
            events.push(Event {
                tag: Tag::new(ev.u64),
                flags: Interest::from_epoll(ev.events),
            });
        }

        Ok(ready as usize)
    }

    fn ctl(
        &self,
        op: libc::c_int,
        fd: RawFd,
        interest: Interest,
        tag: Tag,
        mode: Mode,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut events = interest.to_epoll();
        if mode == Mode::Edge {
            events |= libc::EPOLLET as u32;
        }
        if one_shot {
            events |= libc::EPOLLONESHOT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: tag.value(),
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
