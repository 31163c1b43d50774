//! ringbridge runtime metrics.
//!
//! Process-wide counters for socket lifecycle, bytes, dispatch and handler
//! pinning. Exposed via metriken's registry for whatever exporter the host
//! process runs.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "ringbridge/connections/opened",
    description = "Connection records that delivered on_open"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "ringbridge/connections/closed",
    description = "Connection records that delivered on_close"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "ringbridge/connections/active",
    description = "Connection records currently alive"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "ringbridge/connect/failed",
    description = "Outbound connect attempts that failed"
)]
pub static CONNECT_FAILED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "ringbridge/bytes/received", description = "Total bytes read")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "ringbridge/bytes/sent", description = "Total bytes written")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Dispatch ─────────────────────────────────────────────────────

#[metric(
    name = "ringbridge/messages/delivered",
    description = "on_message notifications delivered"
)]
pub static MESSAGES_DELIVERED: Counter = Counter::new();

#[metric(
    name = "ringbridge/reads/forced",
    description = "Data events re-delivered after a full buffer read"
)]
pub static READS_FORCED: Counter = Counter::new();

#[metric(
    name = "ringbridge/handler/panics",
    description = "Panics caught while running handler code"
)]
pub static HANDLER_PANICS: Counter = Counter::new();

#[metric(
    name = "ringbridge/registry/holds",
    description = "Outstanding native holds on handler objects"
)]
pub static REGISTRY_HOLDS: Gauge = Gauge::new();

// ── Reactor ──────────────────────────────────────────────────────

#[metric(name = "ringbridge/cqe/processed", description = "Total CQEs processed")]
pub static CQE_PROCESSED: Counter = Counter::new();
