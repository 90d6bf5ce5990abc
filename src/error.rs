use std::io;

use thiserror::Error;

/// Errors surfaced by the edgeline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed. Carries the errno-level error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A timer was armed twice on the same descriptor.
    #[error("timer is already armed")]
    TimerAlreadyArmed,
    /// `disarm_timer` was called for a descriptor with no armed timer.
    #[error("timer has not been armed")]
    TimerNotArmed,
    /// A notify descriptor was used before being bound to a poller.
    #[error("notify fd is not bound")]
    NotifyUnbound,
    /// A route pattern failed to compile.
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),
    /// A named parameter was requested that the matched route did not capture.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    /// A typed parameter could not be converted to the requested type.
    #[error("could not parse parameter value: {0}")]
    ParamParse(String),
    /// An inbound request exceeded the configured receive budget.
    #[error("payload exceeds maximum size")]
    PayloadTooLarge,
    /// An inbound byte stream was not a valid HTTP/1.x request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// The peer disconnected before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,
    /// A thread-usage probe is already pending on this worker.
    #[error("load request already pending")]
    LoadRequestPending,
    /// `serve` was called before a request handler was installed.
    #[error("no handler installed")]
    MissingHandler,
    /// The transport is shutting down; pending work was dropped.
    #[error("shutting down")]
    ShuttingDown,
}
