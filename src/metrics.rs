//! Metrics instrumentation for dockhand.
//!
//! All metrics are prefixed with `dockhand.`

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// How a query was answered, for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Answered from the local tables.
    Local,
    /// Relayed from an upstream resolver.
    Forwarded,
    /// Answered NXDOMAIN (no entry, no upstream).
    NxDomain,
    /// Dropped after an upstream failure; the client times out.
    Dropped,
    /// Answered SERVFAIL after an upstream failure.
    ServFail,
}

/// Record a handled DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: Duration) {
    let result_str = match result {
        QueryResult::Local => "local",
        QueryResult::Forwarded => "forwarded",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::Dropped => "dropped",
        QueryResult::ServFail => "servfail",
    };

    counter!("dockhand.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("dockhand.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a container lifecycle event seen on the Docker stream.
pub fn record_container_event(action: &str) {
    counter!("dockhand.container.event.count", "action" => action.to_string()).increment(1);
}

/// Record an upstream exchange failure.
pub fn record_forward_failure() {
    counter!("dockhand.forward.failure.count").increment(1);
}

/// Record current table sizes.
pub fn record_table_sizes(hosts: usize, upstreams: usize) {
    gauge!("dockhand.table.hosts").set(hosts as f64);
    gauge!("dockhand.table.upstreams").set(upstreams as f64);
}
