//! An accepted TCP connection.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::deferred::{deferred, Deferred};
use crate::error::Error;
use crate::transport::{Transport, WriteBuf};

/// One accepted connection, owned by exactly one [`Transport`].
///
/// The peer holds only a weak back-reference to its transport; the transport
/// exclusively owns the peer through its peer map, so a peer never outlives
/// the transport that adopted it. The transport closes the fd exactly once,
/// at disconnection or shutdown.
pub struct Peer {
    fd: RawFd,
    addr: SocketAddr,
    hostname: Option<String>,
    transport: Mutex<Weak<Transport>>,
    closed: AtomicBool,
}

impl Peer {
    /// Wrap an accepted, non-blocking socket. Takes ownership of `fd`.
    pub fn new(fd: RawFd, addr: SocketAddr) -> Arc<Peer> {
        Peer::with_hostname(fd, addr, None)
    }

    pub fn with_hostname(fd: RawFd, addr: SocketAddr, hostname: Option<String>) -> Arc<Peer> {
        Arc::new(Peer {
            fd,
            addr,
            hostname,
            transport: Mutex::new(Weak::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Reverse-resolved hostname, when the listener was configured to look
    /// one up.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub(crate) fn associate_transport(&self, transport: &Arc<Transport>) {
        *self.transport.lock().unwrap() = Arc::downgrade(transport);
    }

    /// The transport that adopted this peer.
    pub fn transport(&self) -> Result<Arc<Transport>, Error> {
        self.transport
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(Error::ConnectionClosed)
    }

    /// Schedule a send on the owning transport. Safe from any thread.
    pub fn send(self: &Arc<Peer>, buf: impl Into<WriteBuf>) -> Deferred<usize> {
        match self.transport() {
            Ok(transport) => transport.async_write(self, buf, 0),
            Err(err) => {
                let (d, c) = deferred();
                c.reject(err);
                d
            }
        }
    }

    /// First caller wins the right to close the fd.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(host) => write!(f, "{} ({})", self.addr, host),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("fd", &self.fd)
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
