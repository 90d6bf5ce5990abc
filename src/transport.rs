//! The TCP transport living inside a worker reactor.
//!
//! A transport owns every peer adopted by its worker: the peer map, the
//! parked-write map, and the timer map. All three are touched only on the
//! reactor thread; callers on other threads submit through eventfd-backed
//! MPSC queues and receive completion on the owning thread via deferred
//! values. Sends are attempted inline and park for write readiness on
//! EAGAIN; receives drain edge-triggered sockets into a reusable scratch
//! buffer and deliver at most once per readiness window.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::deferred::{deferred, Completer, Deferred};
use crate::error::Error;
use crate::metrics;
use crate::notify::{NotifyFd, WorkQueue};
use crate::peer::Peer;
use crate::poller::{Event, Interest, Mode};
use crate::reactor::Reactor;

/// Byte source for an asynchronous send: owned bytes, or a descriptor range
/// transmitted with `sendfile` for zero-copy.
pub enum WriteBuf {
    Owned(Vec<u8>),
    File { fd: RawFd, offset: u64, len: usize },
}

impl WriteBuf {
    pub fn file(fd: RawFd, offset: u64, len: usize) -> WriteBuf {
        WriteBuf::File { fd, offset, len }
    }

    pub fn len(&self) -> usize {
        match self {
            WriteBuf::Owned(bytes) => bytes.len(),
            WriteBuf::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for WriteBuf {
    fn from(bytes: Vec<u8>) -> WriteBuf {
        WriteBuf::Owned(bytes)
    }
}

impl From<&[u8]> for WriteBuf {
    fn from(bytes: &[u8]) -> WriteBuf {
        WriteBuf::Owned(bytes.to_vec())
    }
}

impl From<&str> for WriteBuf {
    fn from(text: &str) -> WriteBuf {
        WriteBuf::Owned(text.as_bytes().to_vec())
    }
}

/// A send that could not complete synchronously, parked until the socket
/// reports write readiness. At most one entry per fd is parked; later
/// submissions queue FIFO behind it.
struct WriteEntry {
    fd: RawFd,
    flags: libc::c_int,
    buf: WriteBuf,
    written: usize,
    completer: Completer<usize>,
}

struct TimerEntry {
    fd: RawFd,
    duration: Duration,
    active: bool,
    completer: Completer<u64>,
}

enum SendOutcome {
    Complete(usize),
    WouldBlock,
    Fatal(io::Error),
}

/// CPU time consumed by a worker thread, as reported by `RUSAGE_THREAD`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadUsage {
    pub user: Duration,
    pub system: Duration,
    pub max_rss_kb: i64,
}

/// Byte-level connection callbacks, invoked on the owning reactor thread.
pub trait Handler: Send + 'static {
    /// Bytes arrived on a peer socket. Delivered at most once per readiness
    /// window, in receive order, never concurrently for the same peer.
    fn on_input(&self, buffer: &[u8], peer: &Arc<Peer>);

    fn on_connection(&self, _peer: &Arc<Peer>) {}

    fn on_disconnection(&self, _peer: &Arc<Peer>) {}

    /// A single receive window exceeded the payload budget; nothing was
    /// delivered and the peer remains connected.
    fn on_payload_overrun(&self, _peer: &Arc<Peer>) {}
}

/// Per-worker TCP transport.
///
/// The peer, parked-write, and timer maps are reactor-thread-local;
/// `handle_new_peer`, `async_write`, and `arm_timer_ms` are safe from any
/// thread and route through the work queues when called off-thread.
pub struct Transport {
    reactor: Arc<Reactor>,
    handler: Box<dyn Handler>,
    peers: RefCell<HashMap<RawFd, Arc<Peer>>>,
    to_write: RefCell<HashMap<RawFd, VecDeque<WriteEntry>>>,
    timers: RefCell<HashMap<RawFd, TimerEntry>>,
    writes_queue: WorkQueue<WriteEntry>,
    timers_queue: WorkQueue<TimerEntry>,
    peers_queue: WorkQueue<Arc<Peer>>,
    load_notify: NotifyFd,
    load_request: Mutex<Option<Completer<ThreadUsage>>>,
    recv_scratch: RefCell<Vec<u8>>,
    max_payload: usize,
    shutting_down: AtomicBool,
}

// Safety: the RefCell'd maps, the scratch buffer, and the handler are only
// touched on the reactor thread that owns this transport (enforced by the
// same-thread checks in the public entry points); everything reachable from
// other threads is a channel, an eventfd, a mutex, or an atomic.
unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

impl Transport {
    pub fn new(reactor: Arc<Reactor>, handler: Box<dyn Handler>, max_payload: usize) -> Arc<Transport> {
        Arc::new(Transport {
            reactor,
            handler,
            peers: RefCell::new(HashMap::new()),
            to_write: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            writes_queue: WorkQueue::new(),
            timers_queue: WorkQueue::new(),
            peers_queue: WorkQueue::new(),
            load_notify: NotifyFd::new(),
            load_request: Mutex::new(None),
            recv_scratch: RefCell::new(vec![0u8; max_payload]),
            max_payload,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Bind the work queues' notify fds into the reactor's poller. Must be
    /// called before the transport is shared with other threads.
    pub fn bind_poller(&self) -> Result<(), Error> {
        let poller = self.reactor.poller();
        self.writes_queue.bind(poller)?;
        self.timers_queue.bind(poller)?;
        self.peers_queue.bind(poller)?;
        self.load_notify.bind(poller)?;
        Ok(())
    }

    /// Adopt an accepted connection. Safe from any thread: the owning
    /// reactor adopts immediately, other threads enqueue a hand-off.
    pub fn handle_new_peer(self: &Arc<Transport>, peer: Arc<Peer>) {
        if self.reactor.on_reactor_thread() {
            self.handle_peer(peer);
        } else if let Err(err) = self.peers_queue.push(peer) {
            warn!(error = %err, "could not hand off peer to worker");
        }
    }

    /// Schedule a send. Resolves with the total bytes written, or rejects on
    /// an unrecoverable error. A zero-length buffer resolves immediately.
    pub fn async_write(
        self: &Arc<Transport>,
        peer: &Arc<Peer>,
        buf: impl Into<WriteBuf>,
        flags: libc::c_int,
    ) -> Deferred<usize> {
        let (d, completer) = deferred();
        let buf = buf.into();
        if buf.is_empty() {
            completer.resolve(0);
            return d;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            completer.reject(Error::ShuttingDown);
            return d;
        }
        if peer.is_closed() {
            completer.reject(Error::ConnectionClosed);
            return d;
        }

        let entry = WriteEntry {
            fd: peer.fd(),
            flags,
            buf,
            written: 0,
            completer,
        };
        if self.reactor.on_reactor_thread() {
            self.submit_write(entry);
        } else if let Err(err) = self.writes_queue.push(entry) {
            warn!(error = %err, "could not submit cross-thread write");
        }
        d
    }

    /// Arm a one-shot timer on `fd`, resolving with the wakeup count when it
    /// fires. Rejects if a timer is already armed on the same fd.
    pub fn arm_timer_ms(&self, fd: RawFd, duration: Duration) -> Deferred<u64> {
        let (d, completer) = deferred();
        if self.shutting_down.load(Ordering::Acquire) {
            completer.reject(Error::ShuttingDown);
            return d;
        }
        let entry = TimerEntry {
            fd,
            duration,
            active: true,
            completer,
        };
        if self.reactor.on_reactor_thread() {
            self.arm_timer_impl(entry);
        } else if let Err(err) = self.timers_queue.push(entry) {
            warn!(error = %err, "could not submit cross-thread timer");
        }
        d
    }

    /// Mark an armed timer inactive; a subsequent fire is dropped silently.
    /// Must be called on the owning reactor thread.
    pub fn disarm_timer(&self, fd: RawFd) -> Result<(), Error> {
        debug_assert!(self.reactor.on_reactor_thread());
        match self.timers.borrow_mut().get_mut(&fd) {
            Some(entry) => {
                entry.active = false;
                Ok(())
            }
            None => Err(Error::TimerNotArmed),
        }
    }

    /// Probe the worker thread's CPU usage. Safe from any thread; resolves
    /// on the worker with its `RUSAGE_THREAD` numbers.
    pub fn thread_usage(&self) -> Deferred<ThreadUsage> {
        let (d, completer) = deferred();
        {
            let mut slot = self.load_request.lock().unwrap();
            if slot.is_some() {
                drop(slot);
                completer.reject(Error::LoadRequestPending);
                return d;
            }
            *slot = Some(completer);
        }
        if let Err(err) = self.load_notify.notify() {
            if let Some(completer) = self.load_request.lock().unwrap().take() {
                completer.reject(err);
            }
        }
        d
    }

    /// Number of peers currently owned by this transport.
    pub fn peer_count(&self) -> usize {
        debug_assert!(self.reactor.on_reactor_thread() || self.shutting_down.load(Ordering::Acquire));
        self.peers.borrow().len()
    }

    /// Dispatch one readiness event. Reactor thread only.
    pub(crate) fn handle_event(self: &Arc<Transport>, event: &Event) -> Result<(), Error> {
        let tag = event.tag;
        if tag == self.writes_queue.tag() {
            self.drain_writes();
            return Ok(());
        }
        if tag == self.timers_queue.tag() {
            self.drain_timers();
            return Ok(());
        }
        if tag == self.peers_queue.tag() {
            self.drain_peers();
            return Ok(());
        }
        if tag == self.load_notify.tag() {
            self.handle_load_notify();
            return Ok(());
        }

        let fd = tag.fd();
        if event.flags.contains(Interest::READ) {
            let peer = self.peers.borrow().get(&fd).cloned();
            if let Some(peer) = peer {
                self.handle_incoming(&peer)?;
            } else {
                let timer = self.timers.borrow_mut().remove(&fd);
                match timer {
                    // Removed from the map before any resolution happens.
                    Some(entry) => self.handle_timer(entry),
                    None => trace!(fd, "readiness for unknown fd"),
                }
            }
        }
        if event.flags.contains(Interest::WRITE) {
            self.handle_writable(fd)?;
        }
        if !event.flags.intersects(Interest::READ | Interest::WRITE)
            && event.flags.intersects(Interest::HANGUP | Interest::SHUTDOWN)
        {
            let peer = self.peers.borrow().get(&fd).cloned();
            if let Some(peer) = peer {
                self.handle_peer_disconnection(&peer);
            }
        }
        Ok(())
    }

    /// Reject parked work, close every peer, and refuse further submissions.
    /// Reactor thread only (invoked by the loop on shutdown).
    pub(crate) fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("transport shutting down");

        self.writes_queue.drain_notify();
        while let Some(entry) = self.writes_queue.pop() {
            entry.completer.reject(Error::ShuttingDown);
        }
        self.timers_queue.drain_notify();
        while let Some(entry) = self.timers_queue.pop() {
            entry.completer.reject(Error::ShuttingDown);
        }
        self.peers_queue.drain_notify();
        while let Some(peer) = self.peers_queue.pop() {
            if peer.mark_closed() {
                unsafe {
                    libc::close(peer.fd());
                }
            }
        }

        let parked = self.to_write.take();
        for (_, queue) in parked {
            for entry in queue {
                entry.completer.reject(Error::ShuttingDown);
            }
        }

        // Timer completers are abandoned: a shutdown worker never fires.
        self.timers.take();

        if let Some(completer) = self.load_request.lock().unwrap().take() {
            completer.reject(Error::ShuttingDown);
        }

        let peers = self.peers.take();
        for (fd, peer) in peers {
            self.handler.on_disconnection(&peer);
            let _ = self.reactor.remove_fd(fd);
            if peer.mark_closed() {
                unsafe {
                    libc::close(fd);
                }
            }
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
    }

    /// Gracefully drop one peer: deliver the disconnection callback, reject
    /// its parked writes, deregister, and close the fd exactly once.
    /// Reactor thread only.
    pub fn close_peer(&self, peer: &Arc<Peer>) {
        debug_assert!(self.reactor.on_reactor_thread());
        if self.peers.borrow().contains_key(&peer.fd()) {
            self.handle_peer_disconnection(peer);
        }
    }

    // ── Adoption and disconnection ─────────────────────────────────────

    fn handle_peer(self: &Arc<Transport>, peer: Arc<Peer>) {
        if self.shutting_down.load(Ordering::Acquire) {
            if peer.mark_closed() {
                unsafe {
                    libc::close(peer.fd());
                }
            }
            return;
        }

        let fd = peer.fd();
        debug!(fd, peer = %peer, "adopting peer");
        self.peers.borrow_mut().insert(fd, peer.clone());
        metrics::CONNECTIONS_ACTIVE.increment();
        peer.associate_transport(self);
        self.handler.on_connection(&peer);

        if let Err(err) = self
            .reactor
            .register_fd(fd, Interest::READ | Interest::SHUTDOWN, Mode::Edge)
        {
            warn!(fd, error = %err, "could not register peer fd");
            self.handle_peer_disconnection(&peer);
        }
    }

    fn handle_peer_disconnection(&self, peer: &Arc<Peer>) {
        let fd = peer.fd();
        if self.peers.borrow_mut().remove(&fd).is_none() {
            trace!(fd, "disconnection for peer no longer owned");
            return;
        }
        self.handler.on_disconnection(peer);

        if let Some(queue) = self.to_write.borrow_mut().remove(&fd) {
            for entry in queue {
                entry.completer.reject(Error::ConnectionClosed);
            }
        }

        let _ = self.reactor.remove_fd(fd);
        if peer.mark_closed() {
            unsafe {
                libc::close(fd);
            }
        }
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    // ── Receive path ───────────────────────────────────────────────────

    fn handle_incoming(&self, peer: &Arc<Peer>) -> Result<(), Error> {
        let fd = peer.fd();
        let mut scratch = self.recv_scratch.borrow_mut();
        let mut total = 0usize;

        loop {
            let bytes = unsafe {
                libc::recv(
                    fd,
                    scratch.as_mut_ptr().add(total) as *mut libc::c_void,
                    self.max_payload - total,
                    0,
                )
            };

            if bytes < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    if total > 0 {
                        metrics::BYTES_RECEIVED.add(total as u64);
                        self.handler.on_input(&scratch[..total], peer);
                    }
                    return Ok(());
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if err.raw_os_error() == Some(libc::ECONNRESET) {
                    self.handle_peer_disconnection(peer);
                    return Ok(());
                }
                return Err(Error::Io(err));
            }
            if bytes == 0 {
                self.handle_peer_disconnection(peer);
                return Ok(());
            }

            total += bytes as usize;
            if total >= self.max_payload {
                warn!(fd, max = self.max_payload, "receive window exceeded payload budget");
                metrics::PAYLOAD_OVERRUNS.increment();
                self.handler.on_payload_overrun(peer);
                return Ok(());
            }
        }
    }

    // ── Send path ──────────────────────────────────────────────────────

    /// First-try submission on the reactor thread. Queues behind an already
    /// parked write for the same fd to preserve per-peer completion order.
    fn submit_write(&self, mut entry: WriteEntry) {
        let fd = entry.fd;
        {
            let mut parked = self.to_write.borrow_mut();
            if let Some(queue) = parked.get_mut(&fd) {
                queue.push_back(entry);
                return;
            }
        }

        match self.try_send(&mut entry) {
            SendOutcome::Complete(total) => entry.completer.resolve(total),
            SendOutcome::WouldBlock => self.park_write(entry),
            SendOutcome::Fatal(err) => entry.completer.reject(Error::Io(err)),
        }
    }

    fn park_write(&self, entry: WriteEntry) {
        let fd = entry.fd;
        let mut queue = VecDeque::with_capacity(1);
        queue.push_back(entry);
        self.to_write.borrow_mut().insert(fd, queue);
        metrics::WRITES_PARKED.increment();

        if let Err(err) =
            self.reactor
                .modify_fd(fd, Interest::READ | Interest::WRITE, Mode::Edge)
        {
            warn!(fd, error = %err, "could not arm write readiness");
            if let Some(mut queue) = self.to_write.borrow_mut().remove(&fd) {
                while let Some(entry) = queue.pop_front() {
                    entry.completer.reject(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "write readiness registration failed",
                    )));
                }
            }
        }
    }

    /// EPOLLOUT on a parked fd: restore read interest first so a drained
    /// socket does not storm us with write events, then retry.
    fn handle_writable(&self, fd: RawFd) -> Result<(), Error> {
        if !self.to_write.borrow().contains_key(&fd) {
            trace!(fd, "write readiness with nothing parked");
            return Ok(());
        }
        self.reactor
            .modify_fd(fd, Interest::READ | Interest::SHUTDOWN, Mode::Edge)?;
        self.drive_write(fd);
        Ok(())
    }

    fn drive_write(&self, fd: RawFd) {
        loop {
            let outcome = {
                let mut parked = self.to_write.borrow_mut();
                let queue = match parked.get_mut(&fd) {
                    Some(queue) => queue,
                    None => return,
                };
                let entry = match queue.front_mut() {
                    Some(entry) => entry,
                    None => {
                        parked.remove(&fd);
                        return;
                    }
                };
                match self.try_send(entry) {
                    SendOutcome::WouldBlock => None,
                    outcome => {
                        let entry = queue.pop_front().expect("front entry vanished");
                        if queue.is_empty() {
                            parked.remove(&fd);
                        }
                        Some((entry, outcome))
                    }
                }
            };

            match outcome {
                Some((entry, SendOutcome::Complete(total))) => {
                    entry.completer.resolve(total);
                }
                Some((entry, SendOutcome::Fatal(err))) => {
                    entry.completer.reject(Error::Io(err));
                }
                Some((_, SendOutcome::WouldBlock)) => unreachable!(),
                None => {
                    // Still blocked: keep the entry parked and rearm.
                    if let Err(err) =
                        self.reactor
                            .modify_fd(fd, Interest::READ | Interest::WRITE, Mode::Edge)
                    {
                        warn!(fd, error = %err, "could not rearm write readiness");
                    }
                    return;
                }
            }
        }
    }

    fn try_send(&self, entry: &mut WriteEntry) -> SendOutcome {
        loop {
            let remaining = entry.buf.len() - entry.written;
            if remaining == 0 {
                return SendOutcome::Complete(entry.written);
            }

            let written = match &entry.buf {
                WriteBuf::Owned(bytes) => unsafe {
                    libc::send(
                        entry.fd,
                        bytes.as_ptr().add(entry.written) as *const libc::c_void,
                        remaining,
                        entry.flags | libc::MSG_NOSIGNAL,
                    )
                },
                WriteBuf::File { fd, offset, .. } => {
                    let mut file_offset = (*offset + entry.written as u64) as libc::off_t;
                    unsafe { libc::sendfile(entry.fd, *fd, &mut file_offset, remaining) }
                }
            };

            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return SendOutcome::WouldBlock;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return SendOutcome::Fatal(err);
            }

            entry.written += written as usize;
            metrics::BYTES_SENT.add(written as u64);
            if entry.written == entry.buf.len() {
                return SendOutcome::Complete(entry.written);
            }
        }
    }

    // ── Timers ─────────────────────────────────────────────────────────

    fn arm_timer_impl(&self, entry: TimerEntry) {
        if self.timers.borrow().contains_key(&entry.fd) {
            entry.completer.reject(Error::TimerAlreadyArmed);
            return;
        }

        let spec = timer_spec(entry.duration);
        let ret = unsafe { libc::timerfd_settime(entry.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            entry
                .completer
                .reject(Error::Io(io::Error::last_os_error()));
            return;
        }

        if let Err(err) = self
            .reactor
            .register_fd_oneshot(entry.fd, Interest::READ, Mode::Edge)
        {
            entry.completer.reject(err);
            return;
        }
        self.timers.borrow_mut().insert(entry.fd, entry);
    }

    fn handle_timer(&self, entry: TimerEntry) {
        if !entry.active {
            // Disarmed after arming: the fire is dropped silently.
            return;
        }
        let mut wakeups: u64 = 0;
        let bytes = unsafe {
            libc::read(
                entry.fd,
                &mut wakeups as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if bytes == 8 {
            metrics::TIMERS_FIRED.increment();
            entry.completer.resolve(wakeups);
        } else if bytes < 0 {
            entry
                .completer
                .reject(Error::Io(io::Error::last_os_error()));
        } else {
            entry.completer.reject(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short timerfd read",
            )));
        }
    }

    // ── Queue draining ─────────────────────────────────────────────────

    fn drain_writes(&self) {
        self.writes_queue.drain_notify();
        while let Some(entry) = self.writes_queue.pop() {
            if self.shutting_down.load(Ordering::Acquire) {
                entry.completer.reject(Error::ShuttingDown);
            } else {
                self.submit_write(entry);
            }
        }
    }

    fn drain_timers(&self) {
        self.timers_queue.drain_notify();
        while let Some(entry) = self.timers_queue.pop() {
            if self.shutting_down.load(Ordering::Acquire) {
                entry.completer.reject(Error::ShuttingDown);
            } else {
                self.arm_timer_impl(entry);
            }
        }
    }

    fn drain_peers(self: &Arc<Transport>) {
        self.peers_queue.drain_notify();
        while let Some(peer) = self.peers_queue.pop() {
            self.handle_peer(peer);
        }
    }

    fn handle_load_notify(&self) {
        while self.load_notify.try_read() {}
        if let Some(completer) = self.load_request.lock().unwrap().take() {
            match thread_rusage() {
                Ok(usage) => completer.resolve(usage),
                Err(err) => completer.reject(err),
            }
        }
    }
}

/// Create a non-blocking monotonic timerfd suitable for
/// [`Transport::arm_timer_ms`]. The caller owns (and eventually closes) it.
pub fn create_timer_fd() -> Result<RawFd, Error> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fd)
}

/// Make an fd non-blocking.
pub fn make_non_blocking(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// One-shot timer programming with full precision: whole seconds plus the
/// sub-second remainder in nanoseconds.
fn timer_spec(duration: Duration) -> libc::itimerspec {
    libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        },
    }
}

fn thread_rusage() -> Result<ThreadUsage, Error> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(ThreadUsage {
        user: timeval_to_duration(usage.ru_utime),
        system: timeval_to_duration(usage.ru_stime),
        max_rss_kb: usage.ru_maxrss as i64,
    })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}
