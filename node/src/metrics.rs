//! # Prometheus Metrics
//!
//! Operational gauges and counters for the escrow book and spend windows,
//! scraped at `/metrics`. Everything lives in a dedicated registry with the
//! `x402` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use x402_core::{EscrowStats, SpendingSummary};

/// Handles for every metric the node publishes.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Expiry sweeps run since start.
    pub sweeps_total: IntCounter,
    /// Sweeps that failed with a storage error.
    pub sweep_failures_total: IntCounter,
    /// Locks moved to EXPIRED by this process.
    pub locks_expired_total: IntCounter,
    /// Escrow locks by status.
    pub escrow_locks: IntGaugeVec,
    /// Cents currently held in LOCKED escrows.
    pub escrow_locked_cents: IntGauge,
    /// Committed spend in today's window, in cents.
    pub spent_today_cents: IntGauge,
    /// Committed spend in this ISO week, in cents.
    pub spent_week_cents: IntGauge,
    /// Wall time of one sweep.
    pub sweep_duration_seconds: Histogram,
}

impl NodeMetrics {
    /// Create and register all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("x402".into()), None)?;

        let sweeps_total = IntCounter::new("sweeps_total", "Escrow expiry sweeps run")?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let sweep_failures_total =
            IntCounter::new("sweep_failures_total", "Escrow expiry sweeps that failed")?;
        registry.register(Box::new(sweep_failures_total.clone()))?;

        let locks_expired_total = IntCounter::new(
            "locks_expired_total",
            "Escrow locks transitioned to EXPIRED by the sweeper",
        )?;
        registry.register(Box::new(locks_expired_total.clone()))?;

        let escrow_locks = IntGaugeVec::new(
            Opts::new("escrow_locks", "Escrow locks in the store, by status"),
            &["status"],
        )?;
        registry.register(Box::new(escrow_locks.clone()))?;

        let escrow_locked_cents = IntGauge::new(
            "escrow_locked_cents",
            "Funds currently held in LOCKED escrows, in cents",
        )?;
        registry.register(Box::new(escrow_locked_cents.clone()))?;

        let spent_today_cents =
            IntGauge::new("spent_today_cents", "Committed spend in the current UTC day")?;
        registry.register(Box::new(spent_today_cents.clone()))?;

        let spent_week_cents =
            IntGauge::new("spent_week_cents", "Committed spend in the current ISO week")?;
        registry.register(Box::new(spent_week_cents.clone()))?;

        let sweep_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("sweep_duration_seconds", "Escrow expiry sweep latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(sweep_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            sweeps_total,
            sweep_failures_total,
            locks_expired_total,
            escrow_locks,
            escrow_locked_cents,
            spent_today_cents,
            spent_week_cents,
            sweep_duration_seconds,
        })
    }

    /// Refresh the gauges from a fresh snapshot.
    pub fn update_from(&self, stats: &EscrowStats, spending: &SpendingSummary) {
        for (status, count) in [
            ("LOCKED", stats.locked),
            ("RELEASED", stats.released),
            ("REFUNDED", stats.refunded),
            ("EXPIRED", stats.expired),
        ] {
            self.escrow_locks
                .with_label_values(&[status])
                .set(gauge_value(count as u64));
        }
        self.escrow_locked_cents
            .set(gauge_value(stats.total_locked.cents()));
        self.spent_today_cents
            .set(gauge_value(spending.today_spent.cents()));
        self.spent_week_cents
            .set(gauge_value(spending.weekly_spent.cents()));
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`. 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
