//! Process-wide Prometheus metrics, registered as `lazy_static` gauges
//! and counters the way a long-running server process typically exposes
//! its operational state.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_int_counter, CounterVec, Gauge, IntCounter};

lazy_static! {
    pub static ref BROKERS_ACTIVE: Gauge =
        register_gauge!("corewire_brokers_active", "Brokers currently open across all schemes").unwrap();
    pub static ref ACCEPT_REJECTED_TOTAL: CounterVec = register_counter_vec!(
        "corewire_accept_rejected_total",
        "Accepted connections rejected, labelled by error kind",
        &["kind"]
    )
    .unwrap();
    pub static ref BACKPRESSURE_EVENTS_TOTAL: IntCounter = register_int_counter!(
        "corewire_backpressure_events_total",
        "Times a broker's send queue crossed its backpressure cap"
    )
    .unwrap();
    pub static ref HTTP2_STREAMS_ACTIVE: Gauge =
        register_gauge!("corewire_http2_streams_active", "Open HTTP/2 streams across all sessions").unwrap();
    pub static ref CLUSTER_RESTARTS_TOTAL: IntCounter =
        register_int_counter!("corewire_cluster_restarts_total", "Worker processes auto-restarted").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let before = BACKPRESSURE_EVENTS_TOTAL.get();
        BACKPRESSURE_EVENTS_TOTAL.inc();
        assert_eq!(BACKPRESSURE_EVENTS_TOTAL.get(), before + 1);
    }

    #[test]
    fn labelled_counter_tracks_per_kind() {
        ACCEPT_REJECTED_TOTAL.with_label_values(&["Accept"]).inc();
        assert!(ACCEPT_REJECTED_TOTAL.with_label_values(&["Accept"]).get() >= 1.0);
    }
}
