//! Server configuration.

/// TCP and lifecycle option flags applied by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u32);

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags(0);
    /// `TCP_NODELAY` on accepted sockets.
    pub const NO_DELAY: TcpFlags = TcpFlags(1);
    /// `SO_LINGER` on the listening socket.
    pub const LINGER: TcpFlags = TcpFlags(1 << 1);
    /// `TCP_FASTOPEN` on the listening socket.
    pub const FAST_OPEN: TcpFlags = TcpFlags(1 << 2);
    /// `TCP_QUICKACK` on accepted sockets.
    pub const QUICK_ACK: TcpFlags = TcpFlags(1 << 3);
    /// `SO_REUSEADDR` on the listening socket.
    pub const REUSE_ADDR: TcpFlags = TcpFlags(1 << 4);
    /// Resolve each accepted peer's hostname with a reverse DNS lookup.
    pub const REVERSE_LOOKUP: TcpFlags = TcpFlags(1 << 5);
    /// Install a SIGINT/SIGTERM handler that triggers graceful shutdown.
    pub const INSTALL_SIGNAL_HANDLER: TcpFlags = TcpFlags(1 << 6);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Endpoint configuration. Start from `Config::default()` and override with
/// the fluent setters.
///
/// ```
/// use edgeline::config::{Config, TcpFlags};
///
/// let config = Config::default()
///     .threads(4)
///     .flags(TcpFlags::REUSE_ADDR | TcpFlags::NO_DELAY)
///     .backlog(512);
/// assert_eq!(config.threads, 4);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker reactor count. Zero means one worker per online CPU.
    pub threads: usize,
    /// Socket and lifecycle option flags.
    pub flags: TcpFlags,
    /// Listen queue depth.
    pub backlog: i32,
    /// Upper bound on a single request's receive buffer, in bytes.
    pub max_payload: usize,
    /// Pin each worker thread to a CPU core.
    pub pin_workers: bool,
    /// First core used when pinning; worker `i` lands on `core_offset + i`.
    pub core_offset: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            threads: 1,
            flags: TcpFlags::REUSE_ADDR,
            backlog: 1024,
            max_payload: 8192,
            pin_workers: false,
            core_offset: 0,
        }
    }
}

impl Config {
    pub fn threads(mut self, threads: usize) -> Config {
        self.threads = threads;
        self
    }

    pub fn flags(mut self, flags: TcpFlags) -> Config {
        self.flags = flags;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Config {
        self.backlog = backlog;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Config {
        self.max_payload = max_payload;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Config {
        self.pin_workers = pin;
        self
    }

    pub fn core_offset(mut self, offset: usize) -> Config {
        self.core_offset = offset;
        self
    }

    /// Resolved worker count: explicit, or one per online CPU when zero.
    pub fn worker_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus()
        } else {
            self.threads
        }
    }
}

/// Number of online CPU cores.
pub fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}
