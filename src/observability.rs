use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: history queries answered. Labels: status.
pub const HISTORY_REQUESTS_TOTAL: &str = "recache_history_requests_total";

/// Counter: device searches finished. Labels: outcome.
pub const DEVICE_SEARCHES_TOTAL: &str = "recache_device_searches_total";

/// Histogram: device search latency in seconds.
pub const DEVICE_SEARCH_DURATION_SECONDS: &str = "recache_device_search_duration_seconds";

/// Counter: calendar queries served from the device (cache misses).
pub const CALENDAR_FETCHES_TOTAL: &str = "recache_calendar_fetches_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: search jobs currently queued for one track.
pub const SEARCH_QUEUE_JOBS: &str = "recache_search_queue_jobs";

/// Gauge: per-track caches alive in the registry.
pub const TRACK_CACHES_ACTIVE: &str = "recache_track_caches_active";

/// Install the plain-text tracing subscriber. For standalone runs and
/// tests; embedding runtimes bring their own.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
