// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Metrics {
    pub conn_opened: AtomicU64,
    pub conn_rejected: AtomicU64,
    pub conn_closed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub fixes_parsed: AtomicU64,
    pub heartbeats: AtomicU64,
    pub corrupt: AtomicU64,
    pub fixes_saved: AtomicU64,
    pub fixes_unresolved: AtomicU64,
    pub store_errors: AtomicU64,

    // store write latency, coarse buckets in ms
    pub store_lat_b0: AtomicU64,
    pub store_lat_b1: AtomicU64,
    pub store_lat_b2: AtomicU64,
    pub store_lat_b3: AtomicU64,
    pub store_lat_b4: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_conn_opened(&self) {
        self.conn_opened.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_conn_rejected(&self) {
        self.conn_rejected.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_conn_closed(&self) {
        self.conn_closed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_fixes_parsed(&self) {
        self.fixes_parsed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_heartbeats(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_corrupt(&self) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_fixes_saved(&self) {
        self.fixes_saved.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_fixes_unresolved(&self) {
        self.fixes_unresolved.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_store_errors(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store(&self, dur: Duration) {
        let ms = dur.as_millis() as u64;
        // buckets: <1ms, <5ms, <20ms, <100ms, >=100ms
        if ms < 1 {
            self.store_lat_b0.fetch_add(1, Ordering::Relaxed);
        } else if ms < 5 {
            self.store_lat_b1.fetch_add(1, Ordering::Relaxed);
        } else if ms < 20 {
            self.store_lat_b2.fetch_add(1, Ordering::Relaxed);
        } else if ms < 100 {
            self.store_lat_b3.fetch_add(1, Ordering::Relaxed);
        } else {
            self.store_lat_b4.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn prometheus_text(&self) -> String {
        let opened = self.conn_opened.load(Ordering::Relaxed);
        let rejected = self.conn_rejected.load(Ordering::Relaxed);
        let closed = self.conn_closed.load(Ordering::Relaxed);
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let parsed = self.fixes_parsed.load(Ordering::Relaxed);
        let hb = self.heartbeats.load(Ordering::Relaxed);
        let corrupt = self.corrupt.load(Ordering::Relaxed);
        let saved = self.fixes_saved.load(Ordering::Relaxed);
        let unresolved = self.fixes_unresolved.load(Ordering::Relaxed);
        let serr = self.store_errors.load(Ordering::Relaxed);

        let b0 = self.store_lat_b0.load(Ordering::Relaxed);
        let b1 = self.store_lat_b1.load(Ordering::Relaxed);
        let b2 = self.store_lat_b2.load(Ordering::Relaxed);
        let b3 = self.store_lat_b3.load(Ordering::Relaxed);
        let b4 = self.store_lat_b4.load(Ordering::Relaxed);

        format!(
            "\
# TYPE trackerd_connections_opened_total counter
trackerd_connections_opened_total {opened}
# TYPE trackerd_connections_rejected_total counter
trackerd_connections_rejected_total {rejected}
# TYPE trackerd_connections_closed_total counter
trackerd_connections_closed_total {closed}
# TYPE trackerd_bytes_in_total counter
trackerd_bytes_in_total {bytes_in}
# TYPE trackerd_fixes_parsed_total counter
trackerd_fixes_parsed_total {parsed}
# TYPE trackerd_heartbeats_total counter
trackerd_heartbeats_total {hb}
# TYPE trackerd_corrupt_total counter
trackerd_corrupt_total {corrupt}
# TYPE trackerd_fixes_saved_total counter
trackerd_fixes_saved_total {saved}
# TYPE trackerd_fixes_unresolved_total counter
trackerd_fixes_unresolved_total {unresolved}
# TYPE trackerd_store_errors_total counter
trackerd_store_errors_total {serr}
# TYPE trackerd_store_latency_bucket counter
trackerd_store_latency_bucket{{le=\"1\"}} {b0}
trackerd_store_latency_bucket{{le=\"5\"}} {b1}
trackerd_store_latency_bucket{{le=\"20\"}} {b2}
trackerd_store_latency_bucket{{le=\"100\"}} {b3}
trackerd_store_latency_bucket{{le=\"+Inf\"}} {b4}
"
        )
    }
}
