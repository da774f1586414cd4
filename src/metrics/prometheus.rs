//! Prometheus metrics integration

use actix_web::{get, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder};

// Define metrics
static DISCOVERY_ROUNDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        opts!("discovery_rounds_total", "Total number of discovery rounds")
    )
    .expect("Failed to create discovery rounds counter")
});

static DISCOVERED_MEMBERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        opts!("discovered_members", "Distinct member addresses found by the last round")
    )
    .expect("Failed to create discovered members gauge")
});

static REGISTRY_WRITE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        opts!("registry_write_failures_total", "Failed presence self-writes")
    )
    .expect("Failed to create registry write failures counter")
});

static REGISTRY_SKIPPED_RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registry_skipped_records_total", "Peer records skipped while reading the registry"),
        &["reason"]
    )
    .expect("Failed to create skipped records counter")
});

static PROBE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        opts!("probe_failures_total", "Peer probes that did not yield a presence record")
    )
    .expect("Failed to create probe failures counter")
});

static PRESENCE_REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        opts!("presence_requests_total", "Probe requests answered by the presence server")
    )
    .expect("Failed to create presence requests counter")
});

/// Initialize all metrics
pub fn init_metrics() {
    // Force lazy initialization
    Lazy::force(&DISCOVERY_ROUNDS_TOTAL);
    Lazy::force(&DISCOVERED_MEMBERS);
    Lazy::force(&REGISTRY_WRITE_FAILURES_TOTAL);
    Lazy::force(&REGISTRY_SKIPPED_RECORDS_TOTAL);
    Lazy::force(&PROBE_FAILURES_TOTAL);
    Lazy::force(&PRESENCE_REQUESTS_TOTAL);
}

/// Record a finished discovery round and its member count
pub fn record_discovery_round(members: usize) {
    DISCOVERY_ROUNDS_TOTAL.inc();
    DISCOVERED_MEMBERS.set(members as i64);
}

pub fn record_registry_write_failure() {
    REGISTRY_WRITE_FAILURES_TOTAL.inc();
}

/// Record a skipped registry child; `reason` is "vanished", "unreadable" or "malformed"
pub fn record_skipped_record(reason: &str) {
    REGISTRY_SKIPPED_RECORDS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_probe_failure() {
    PROBE_FAILURES_TOTAL.inc();
}

pub fn record_presence_request() {
    PRESENCE_REQUESTS_TOTAL.inc();
}

/// Prometheus metrics endpoint
#[get("/metrics")]
pub async fn metrics_endpoint() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("Failed to encode metrics: {}", e));
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();

        record_discovery_round(3);
        record_registry_write_failure();
        record_skipped_record("vanished");
        record_probe_failure();
        record_presence_request();

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "discovery_rounds_total"));
        assert!(names.iter().any(|n| n == "registry_skipped_records_total"));
    }
}
