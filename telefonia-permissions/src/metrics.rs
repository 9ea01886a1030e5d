//! Prometheus metrics for the permission cache
//!
//! Registered in a crate-local registry; the embedding process decides how to
//! expose it.

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry, CounterVec,
    Encoder, HistogramVec, Registry, TextEncoder,
};

/// Metrics registry for the permission cache
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Permission lookups by outcome (`hit`, `key_miss`, `role_miss`)
pub static PERMISSION_CHECKS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "permission_checks_total",
        "Total number of permission lookups",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register PERMISSION_CHECKS")
});

/// Matrix refreshes by trigger and result
pub static PERMISSION_REFRESHES: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "permission_refreshes_total",
        "Total number of permission matrix refresh requests",
        &["trigger", "result"],
        REGISTRY.clone()
    )
    .expect("Failed to register PERMISSION_REFRESHES")
});

/// Duration of remote matrix fetches
pub static PERMISSION_REFRESH_DURATION: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec_with_registry!(
            "permission_refresh_duration_seconds",
            "Permission matrix fetch duration in seconds",
            &["result"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            REGISTRY.clone()
        )
        .expect("Failed to register PERMISSION_REFRESH_DURATION")
    });

/// Scheduler ticks by result (`fresh`, `stale`, `skipped`, `error`)
pub static PERMISSION_SYNC_TICKS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "permission_sync_ticks_total",
        "Total number of permission version polls",
        &["result"],
        REGISTRY.clone()
    )
    .expect("Failed to register PERMISSION_SYNC_TICKS")
});

pub fn record_check(outcome: &str) {
    PERMISSION_CHECKS.with_label_values(&[outcome]).inc();
}

pub fn record_refresh(trigger: &str, result: &str) {
    PERMISSION_REFRESHES.with_label_values(&[trigger, result]).inc();
}

pub fn record_refresh_duration(result: &str, seconds: f64) {
    PERMISSION_REFRESH_DURATION
        .with_label_values(&[result])
        .observe(seconds);
}

pub fn record_sync_tick(result: &str) {
    PERMISSION_SYNC_TICKS.with_label_values(&[result]).inc();
}

/// Render all metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_metrics() {
        record_check("hit");
        record_refresh("cache_miss", "success");
        record_sync_tick("fresh");
        let output = gather();
        assert!(output.contains("permission_checks_total"));
        assert!(output.contains("permission_refreshes_total"));
        assert!(output.contains("permission_sync_ticks_total"));
    }
}
