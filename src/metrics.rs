//! Runtime metrics.
//!
//! Per-process counters for connection lifecycle, byte throughput, write
//! parking, timers, and routing outcomes. Registered with `metriken` so an
//! embedding application can expose them through its own admin surface.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total connections accepted by the listener"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_closed",
    description = "Total connections closed (disconnect or shutdown)"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Connections currently owned by a worker"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "writes_parked",
    description = "Sends that could not complete synchronously and parked for write readiness"
)]
pub static WRITES_PARKED: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Timer expirations delivered")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "payload_overruns",
    description = "Receives dropped because a request exceeded the payload budget"
)]
pub static PAYLOAD_OVERRUNS: Counter = Counter::new();

#[metric(
    name = "requests_routed",
    description = "Requests dispatched to a matching route handler"
)]
pub static REQUESTS_ROUTED: Counter = Counter::new();

#[metric(
    name = "requests_unmatched",
    description = "Requests that matched no route and were answered 404"
)]
pub static REQUESTS_UNMATCHED: Counter = Counter::new();
