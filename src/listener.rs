//! Listening socket and accept-loop load balancer.
//!
//! Accepts with a blocking `accept4` on a dedicated loop, applies the
//! configured socket options, wraps each connection in a [`Peer`], and hands
//! it to the next worker transport round-robin. Workers are woken through
//! their peer queues' notify fds.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{Config, TcpFlags};
use crate::error::Error;
use crate::metrics;
use crate::peer::Peer;
use crate::transport::Transport;

/// Set once by the signal handler; the accept loop observes it through the
/// EINTR it causes.
static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination_signal(_signum: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::Release);
}

/// Create, configure, bind, and listen. The socket stays blocking: the
/// accept loop owns it and sleeps in `accept4`.
pub(crate) fn bind_listener(addr: SocketAddr, config: &Config) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let result = configure_and_listen(fd, addr, config);
    if result.is_err() {
        unsafe {
            libc::close(fd);
        }
    }
    result.map(|_| fd)
}

fn configure_and_listen(fd: RawFd, addr: SocketAddr, config: &Config) -> Result<(), Error> {
    if config.flags.contains(TcpFlags::REUSE_ADDR) {
        set_sockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    }
    if config.flags.contains(TcpFlags::LINGER) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 1,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    if config.flags.contains(TcpFlags::FAST_OPEN) {
        set_sockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, config.backlog)?;
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let ret = unsafe { libc::listen(fd, config.backlog) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Install SIGINT/SIGTERM handlers that request graceful shutdown. No
/// `SA_RESTART`: the signal must interrupt the blocked `accept4` so the loop
/// notices.
pub(crate) fn install_signal_handler() -> Result<(), Error> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_termination_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for signum in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
    }
    Ok(())
}

/// Writes on peers that vanished must surface as errors, not kill the
/// process.
pub(crate) fn ignore_sigpipe() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGPIPE, &action, std::ptr::null_mut());
    }
}

pub(crate) fn signal_shutdown_requested() -> bool {
    SIGNAL_SHUTDOWN.load(Ordering::Acquire)
}

pub(crate) fn reset_signal_shutdown() {
    SIGNAL_SHUTDOWN.store(false, Ordering::Release);
}

/// Run the accept loop until shutdown. Each accepted connection is made
/// non-blocking by `accept4`, optioned, wrapped in a [`Peer`], and assigned
/// to a worker by round-robin.
pub(crate) fn run_acceptor(
    listen_fd: RawFd,
    workers: &[Arc<Transport>],
    config: &Config,
    shutdown: &AtomicBool,
) {
    let num_workers = workers.len();
    if num_workers == 0 {
        return;
    }

    let mut next_worker = 0usize;
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    loop {
        if shutdown.load(Ordering::Acquire) || signal_shutdown_requested() {
            return;
        }

        let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    // Out of descriptors: back off instead of spinning.
                    warn!("accept failed: out of file descriptors");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                _ => {
                    // Listening socket shut down or a fatal accept error.
                    if !shutdown.load(Ordering::Acquire) && !signal_shutdown_requested() {
                        warn!(error = %err, "accept loop terminating");
                    }
                    return;
                }
            }
        }

        if config.flags.contains(TcpFlags::NO_DELAY) {
            let _ = set_sockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        }
        if config.flags.contains(TcpFlags::QUICK_ACK) {
            let _ = set_sockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1);
        }

        let peer_addr = sockaddr_to_socket_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let hostname = if config.flags.contains(TcpFlags::REVERSE_LOOKUP) {
            reverse_lookup(&storage, addr_len)
        } else {
            None
        };

        let peer = Peer::with_hostname(fd, peer_addr, hostname);
        debug!(fd, peer = %peer, worker = next_worker, "accepted connection");
        metrics::CONNECTIONS_ACCEPTED.increment();

        workers[next_worker].handle_new_peer(peer);
        next_worker = (next_worker + 1) % num_workers;
    }
}

/// Pin the current thread to one CPU core.
pub(crate) fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn set_sockopt_int(
    fd: RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> Result<(), Error> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

fn reverse_lookup(
    storage: &libc::sockaddr_storage,
    addr_len: libc::socklen_t,
) -> Option<String> {
    // NI_MAXHOST
    let mut host = [0 as libc::c_char; 1025];
    let ret = unsafe {
        libc::getnameinfo(
            storage as *const _ as *const libc::sockaddr,
            addr_len,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            0,
        )
    };
    if ret != 0 {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) };
    cstr.to_str().ok().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }
}
