//! Lightweight key-value telemetry using metrics-rs.
//!
//! Every ring publishes its capacity and cursor positions, and the capture
//! engine publishes its packet counters, to whatever recorder the
//! application installs. Without a recorder these calls are no-ops.

use metrics::{counter, gauge};

// Metric names as constants for consistency
const RING_CAPACITY: &str = "bifrost_ring_capacity_bytes";
const RING_HEAD: &str = "bifrost_ring_head_bytes";
const RING_TAIL: &str = "bifrost_ring_tail_bytes";
const READER_LAG: &str = "bifrost_reader_lag_bytes";
const CAPTURE_PACKETS: &str = "bifrost_capture_packets";

/// Record a ring's (new) capacity and memory space.
pub(crate) fn ring_resized(ring: &str, space: &str, capacity: u64) {
    gauge!(RING_CAPACITY, "ring" => ring.to_owned(), "space" => space.to_owned())
        .set(capacity as f64);
}

/// Record the writer's commit frontier and the oldest valid byte.
pub(crate) fn ring_cursors(ring: &str, head: u64, tail: u64) {
    gauge!(RING_HEAD, "ring" => ring.to_owned()).set(head as f64);
    gauge!(RING_TAIL, "ring" => ring.to_owned()).set(tail as f64);
}

/// Record how far a reader trails the commit frontier.
pub(crate) fn reader_lag(ring: &str, reader: u64, lag: u64) {
    gauge!(READER_LAG, "ring" => ring.to_owned(), "reader" => reader.to_string())
        .set(lag as f64);
}

/// Count packets by disposition (`received`, `committed`, `rejected`,
/// `late`, `duplicated`).
pub(crate) fn capture_packets(ring: &str, disposition: &'static str, n: u64) {
    if n > 0 {
        counter!(CAPTURE_PACKETS, "ring" => ring.to_owned(), "disposition" => disposition)
            .increment(n);
    }
}
