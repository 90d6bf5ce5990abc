//! Cross-thread wakeup plumbing: an eventfd-backed [`NotifyFd`] and the
//! [`WorkQueue`] that pairs one with an MPSC channel.
//!
//! A reactor blocked in `epoll_wait` is woken by any thread posting to a
//! bound `NotifyFd`. Work items ride the queue; the eventfd only signals
//! "something is there". Posts coalesce: many notifies may be observed as a
//! single readable edge, so consumers drain the queue until empty.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::error::Error;
use crate::poller::{Interest, Mode, Poller, Tag};

/// Counter-backed wakeup descriptor. Unbound until [`bind`](NotifyFd::bind)
/// registers it with a poller; notifying an unbound fd is a usage error.
pub struct NotifyFd {
    event_fd: AtomicI32,
}

impl NotifyFd {
    pub fn new() -> NotifyFd {
        NotifyFd {
            event_fd: AtomicI32::new(-1),
        }
    }

    /// Create the eventfd and register it read/edge with `poller`.
    /// Returns the tag under which readiness will be reported.
    pub fn bind(&self, poller: &Poller) -> Result<Tag, Error> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let tag = Tag::of_fd(fd);
        if let Err(err) = poller.add(fd, Interest::READ, tag, Mode::Edge) {
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(err));
        }
        self.event_fd.store(fd, Ordering::Release);
        Ok(tag)
    }

    pub fn is_bound(&self) -> bool {
        self.event_fd.load(Ordering::Acquire) != -1
    }

    pub fn tag(&self) -> Tag {
        Tag::of_fd(self.event_fd.load(Ordering::Acquire))
    }

    /// Post a wakeup. Multiple posts may coalesce into one observable read.
    pub fn notify(&self) -> Result<(), Error> {
        let fd = self.event_fd.load(Ordering::Acquire);
        if fd == -1 {
            return Err(Error::NotifyUnbound);
        }
        let val: u64 = 1;
        let ret = unsafe { libc::write(fd, &val as *const u64 as *const libc::c_void, 8) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Non-blockingly consume one pending post. Returns whether anything was
    /// read; `false` means the fd is no longer readable.
    pub fn try_read(&self) -> bool {
        let fd = self.event_fd.load(Ordering::Acquire);
        if fd == -1 {
            return false;
        }
        let mut val: u64 = 0;
        let ret = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        ret == 8
    }
}

impl Default for NotifyFd {
    fn default() -> Self {
        NotifyFd::new()
    }
}

impl Drop for NotifyFd {
    fn drop(&mut self) {
        let fd = self.event_fd.load(Ordering::Acquire);
        if fd != -1 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Multi-producer single-consumer hand-off queue bound to a [`NotifyFd`].
///
/// Producers on any thread `push`; the consumer is the reactor owning the
/// poller the notify fd is bound to, and only it calls `pop`. FIFO per
/// producer; no ordering guarantee across producers.
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    notify: NotifyFd,
}

impl<T> WorkQueue<T> {
    pub fn new() -> WorkQueue<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        WorkQueue {
            tx,
            rx,
            notify: NotifyFd::new(),
        }
    }

    /// Register the queue's notify fd with the consumer's poller.
    pub fn bind(&self, poller: &Poller) -> Result<Tag, Error> {
        self.notify.bind(poller)
    }

    pub fn tag(&self) -> Tag {
        self.notify.tag()
    }

    /// Enqueue an item and wake the consumer.
    pub fn push(&self, value: T) -> Result<(), Error> {
        // An unbounded channel only fails when the receiver is gone, which
        // cannot happen while `self` holds it.
        let _ = self.tx.send(value);
        self.notify.notify()
    }

    /// Dequeue the next item. Consumer side only.
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain the wakeup counter until the notify fd is no longer readable.
    pub fn drain_notify(&self) {
        while self.notify.try_read() {}
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn notify_requires_bind() {
        let notify = NotifyFd::new();
        assert!(!notify.is_bound());
        assert!(matches!(notify.notify(), Err(Error::NotifyUnbound)));
    }

    #[test]
    fn notify_then_drain_leaves_fd_quiet() {
        let poller = Poller::new().unwrap();
        let notify = NotifyFd::new();
        let tag = notify.bind(&poller).unwrap();

        notify.notify().unwrap();
        notify.notify().unwrap();

        let mut events = Vec::new();
        let n = poller
            .poll(&mut events, 8, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].tag, tag);

        // Posts coalesce into a single counter read.
        assert!(notify.try_read());
        assert!(!notify.try_read());

        events.clear();
        let n = poller
            .poll(&mut events, 8, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn queue_wakes_consumer_and_preserves_producer_order() {
        let poller = Poller::new().unwrap();
        let queue: WorkQueue<u32> = WorkQueue::new();
        queue.bind(&poller).unwrap();

        let handle = {
            let tx = queue.tx.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    tx.send(i).unwrap();
                }
            })
        };
        handle.join().unwrap();
        queue.notify.notify().unwrap();

        let mut events = Vec::new();
        poller
            .poll(&mut events, 8, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events[0].tag, queue.tag());

        queue.drain_notify();
        let mut seen = Vec::new();
        while let Some(v) = queue.pop() {
            seen.push(v);
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(queue.pop().is_none());
    }
}
