//! Per-worker event loop.
//!
//! Each worker owns one [`Reactor`]: a poller, a shutdown wakeup fd, and the
//! identity of the OS thread driving the loop. The transport registers fds
//! through the reactor; the loop pumps readiness events into the transport
//! and survives per-event failures so one misbehaving peer cannot take the
//! worker down.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use tracing::warn;

use crate::error::Error;
use crate::notify::NotifyFd;
use crate::poller::{Event, Interest, Mode, Poller, Tag};
use crate::transport::Transport;

const MAX_EVENTS: usize = 1024;

pub struct Reactor {
    poller: Poller,
    shutdown: NotifyFd,
    thread: OnceLock<ThreadId>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, Error> {
        let poller = Poller::new()?;
        let shutdown = NotifyFd::new();
        shutdown.bind(&poller)?;
        Ok(Reactor {
            poller,
            shutdown,
            thread: OnceLock::new(),
        })
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Register `fd` with the fd itself as tag.
    pub fn register_fd(&self, fd: RawFd, interest: Interest, mode: Mode) -> Result<(), Error> {
        self.poller.add(fd, interest, Tag::of_fd(fd), mode)?;
        Ok(())
    }

    pub fn register_fd_oneshot(
        &self,
        fd: RawFd,
        interest: Interest,
        mode: Mode,
    ) -> Result<(), Error> {
        self.poller.add_oneshot(fd, interest, Tag::of_fd(fd), mode)?;
        Ok(())
    }

    pub fn modify_fd(&self, fd: RawFd, interest: Interest, mode: Mode) -> Result<(), Error> {
        self.poller.rearm(fd, interest, Tag::of_fd(fd), mode)?;
        Ok(())
    }

    pub fn remove_fd(&self, fd: RawFd) -> Result<(), Error> {
        self.poller.remove(fd)?;
        Ok(())
    }

    /// Thread id of the worker driving this reactor, once the loop started.
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread.get().copied()
    }

    /// Whether the caller is the thread driving this reactor.
    pub fn on_reactor_thread(&self) -> bool {
        self.thread() == Some(thread::current().id())
    }

    /// Claim the current thread as the loop owner. Called by the worker
    /// thread before entering [`run`](Reactor::run).
    pub fn mark_thread(&self) {
        let _ = self.thread.set(thread::current().id());
    }

    /// Ask the loop to exit after draining the current batch. Safe from any
    /// thread.
    pub fn wake_shutdown(&self) -> Result<(), Error> {
        self.shutdown.notify()
    }

    /// Drive the loop until shutdown is requested. Blocks the calling
    /// thread; call [`mark_thread`](Reactor::mark_thread) first.
    pub fn run(&self, transport: &Arc<Transport>) -> Result<(), Error> {
        debug_assert!(self.on_reactor_thread());
        let mut events: Vec<Event> = Vec::with_capacity(MAX_EVENTS);

        loop {
            events.clear();
            self.poller.poll(&mut events, MAX_EVENTS, None)?;

            let mut stop = false;
            for event in &events {
                if event.tag == self.shutdown.tag() {
                    while self.shutdown.try_read() {}
                    stop = true;
                    continue;
                }
                // One failing peer must not kill the worker.
                if let Err(err) = transport.handle_event(event) {
                    warn!(tag = event.tag.value(), error = %err, "event handler failed");
                }
            }

            if stop {
                transport.shutdown();
                return Ok(());
            }
        }
    }
}
