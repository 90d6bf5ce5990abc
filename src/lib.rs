//! edgeline — an embeddable epoll-native HTTP/1.x server library for Linux.
//!
//! edgeline is a thread-per-core server framework built directly on
//! edge-triggered epoll, eventfd, and timerfd. A central acceptor distributes
//! connections round-robin to worker reactors; each worker exclusively owns
//! its peers, parks sends that would block until write readiness, and
//! completes asynchronous work through single-assignment [`Deferred`] values.
//! A REST-style [`Router`] compiles URL patterns with named, optional, and
//! splat parameters and dispatches first-match-wins.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edgeline::{Code, Config, Endpoint, Router, TcpFlags};
//!
//! fn main() -> Result<(), edgeline::Error> {
//!     let mut router = Router::new();
//!     router.get("/ready", |_req, resp| {
//!         let _ = resp.send(Code::Ok, "1");
//!     })?;
//!     router.get("/greet/:name", |req, resp| {
//!         let name = req.param(":name").unwrap().value().to_string();
//!         let _ = resp.send(Code::Ok, format!("hello {name}"));
//!     })?;
//!
//!     let config = Config::default()
//!         .threads(4)
//!         .flags(TcpFlags::REUSE_ADDR | TcpFlags::INSTALL_SIGNAL_HANDLER);
//!     let endpoint = Arc::new(Endpoint::new("127.0.0.1:9080".parse().unwrap(), config));
//!     endpoint.set_handler(router.into_handler());
//!     endpoint.serve()
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Requires epoll, eventfd, and timerfd.

pub mod config;
pub mod deferred;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod metrics;
pub mod notify;
pub mod peer;
pub mod poller;
pub mod reactor;
pub mod router;
pub mod transport;

mod listener;

// ── Re-exports: server surface ──────────────────────────────────────

/// Endpoint configuration.
pub use config::Config;
/// TCP and lifecycle option flags.
pub use config::TcpFlags;
/// The server facade: listener, acceptor, and worker pool.
pub use endpoint::Endpoint;
/// Runtime errors.
pub use error::Error;

// ── Re-exports: HTTP types ──────────────────────────────────────────

/// Response status codes.
pub use http::Code;
/// Request-level handler installed on an endpoint.
pub use http::HttpHandler;
/// Request methods.
pub use http::Method;
/// A parsed HTTP request.
pub use http::Request;
/// Writes one response back through the owning transport.
pub use http::ResponseWriter;

// ── Re-exports: routing ─────────────────────────────────────────────

/// A request carrying its route's captured parameters.
pub use router::Request as RoutedRequest;
/// Route table builder.
pub use router::Router;
/// Frozen route tables shared by every worker.
pub use router::RouterHandler;
/// A captured URL parameter with typed conversion.
pub use router::TypedParam;

// ── Re-exports: runtime primitives ──────────────────────────────────

/// Single-assignment asynchronous result.
pub use deferred::deferred;
pub use deferred::Completer;
pub use deferred::Deferred;
/// Cross-thread wakeup descriptor.
pub use notify::NotifyFd;
/// MPSC hand-off queue bound to a notify fd.
pub use notify::WorkQueue;
/// An accepted TCP connection.
pub use peer::Peer;
/// Readiness interest set.
pub use poller::Interest;
/// Trigger mode for a registration.
pub use poller::Mode;
/// Readiness multiplexer over one epoll instance.
pub use poller::Poller;
/// Registration tag returned with each readiness event.
pub use poller::Tag;
/// Per-worker event loop.
pub use reactor::Reactor;
/// Create a timerfd for use with [`transport::Transport::arm_timer_ms`].
pub use transport::create_timer_fd;
/// Byte-level connection callbacks.
pub use transport::Handler;
/// Per-worker TCP transport.
pub use transport::Transport;
/// Worker CPU usage as reported by `RUSAGE_THREAD`.
pub use transport::ThreadUsage;
/// Byte source for an asynchronous send.
pub use transport::WriteBuf;
