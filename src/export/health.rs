use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::rpc::bind_addr;

const NAMESPACE: &str = "meshprobe";

/// Prometheus metrics for both process roles.
///
/// All metrics use the "meshprobe" namespace. A role only moves the metrics
/// it owns; the rest stay at zero.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Control plane ===
    /// Dispatch batches completed.
    pub dispatch_batches: Counter,
    /// Probe-task RPCs by status (ok/error).
    pub dispatch_rpcs: CounterVec,
    /// Wall time of one dispatch batch, barrier included.
    pub dispatch_batch_duration: Histogram,
    /// Participants in the registry snapshot of the last dispatch or
    /// aggregation cycle.
    pub participants: Gauge,
    /// Window inserts by status.
    pub window_writes: CounterVec,
    /// Probe samples received over the result service.
    pub probe_results_received: Counter,
    /// Node snapshots received by status.
    pub snapshots_received: CounterVec,
    pub aggregation_cycles: Counter,
    pub aggregation_rows: Counter,
    /// Pairs skipped for an empty window.
    pub aggregation_skipped: Counter,
    /// Window read or row insert failures during aggregation.
    pub aggregation_errors: Counter,
    pub aggregation_duration: Histogram,

    // === Agent ===
    /// TCP probe dials by status (ok/failed).
    pub probe_attempts: CounterVec,
    /// Successful handshake latency in milliseconds.
    pub probe_delay_ms: Histogram,
    /// Result uploads by status.
    pub result_batches: CounterVec,
    /// Tasks currently held in the agent cache.
    pub tasks_cached: Gauge,
    /// Telemetry uploads by status.
    pub telemetry_uploads: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Control plane ===
        let dispatch_batches = Counter::with_opts(
            Opts::new("dispatch_batches_total", "Dispatch batches completed.")
                .namespace(NAMESPACE),
        )?;
        let dispatch_rpcs = CounterVec::new(
            Opts::new("dispatch_rpcs_total", "Probe-task RPCs by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let dispatch_batch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_batch_duration_seconds",
                "Time for one dispatch batch to pass its barrier.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
        )?;
        let participants = Gauge::with_opts(
            Opts::new("participants", "Participants in the last registry snapshot.")
                .namespace(NAMESPACE),
        )?;
        let window_writes = CounterVec::new(
            Opts::new("window_writes_total", "Window inserts by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let probe_results_received = Counter::with_opts(
            Opts::new(
                "probe_results_received_total",
                "Probe samples received from agents.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshots_received = CounterVec::new(
            Opts::new(
                "snapshots_received_total",
                "Node snapshots received by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let aggregation_cycles = Counter::with_opts(
            Opts::new("aggregation_cycles_total", "Aggregation cycles run.").namespace(NAMESPACE),
        )?;
        let aggregation_rows = Counter::with_opts(
            Opts::new(
                "aggregation_rows_total",
                "Link delay rows persisted by aggregation.",
            )
            .namespace(NAMESPACE),
        )?;
        let aggregation_skipped = Counter::with_opts(
            Opts::new(
                "aggregation_skipped_total",
                "Pairs skipped because their window was empty.",
            )
            .namespace(NAMESPACE),
        )?;
        let aggregation_errors = Counter::with_opts(
            Opts::new(
                "aggregation_errors_total",
                "Window read or row insert failures during aggregation.",
            )
            .namespace(NAMESPACE),
        )?;
        let aggregation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "aggregation_duration_seconds",
                "Time to run one aggregation cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        // === Agent ===
        let probe_attempts = CounterVec::new(
            Opts::new("probe_attempts_total", "TCP probe dials by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let probe_delay_ms = Histogram::with_opts(
            HistogramOpts::new("probe_delay_ms", "TCP handshake latency in milliseconds.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
                ]),
        )?;
        let result_batches = CounterVec::new(
            Opts::new("result_batches_total", "Probe result uploads by status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        let tasks_cached = Gauge::with_opts(
            Opts::new("tasks_cached", "Probe tasks held in the agent cache.").namespace(NAMESPACE),
        )?;
        let telemetry_uploads = CounterVec::new(
            Opts::new("telemetry_uploads_total", "Node snapshot uploads by status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;

        // Control plane
        registry.register(Box::new(dispatch_batches.clone()))?;
        registry.register(Box::new(dispatch_rpcs.clone()))?;
        registry.register(Box::new(dispatch_batch_duration.clone()))?;
        registry.register(Box::new(participants.clone()))?;
        registry.register(Box::new(window_writes.clone()))?;
        registry.register(Box::new(probe_results_received.clone()))?;
        registry.register(Box::new(snapshots_received.clone()))?;
        registry.register(Box::new(aggregation_cycles.clone()))?;
        registry.register(Box::new(aggregation_rows.clone()))?;
        registry.register(Box::new(aggregation_skipped.clone()))?;
        registry.register(Box::new(aggregation_errors.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;

        // Agent
        registry.register(Box::new(probe_attempts.clone()))?;
        registry.register(Box::new(probe_delay_ms.clone()))?;
        registry.register(Box::new(result_batches.clone()))?;
        registry.register(Box::new(tasks_cached.clone()))?;
        registry.register(Box::new(telemetry_uploads.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            dispatch_batches,
            dispatch_rpcs,
            dispatch_batch_duration,
            participants,
            window_writes,
            probe_results_received,
            snapshots_received,
            aggregation_cycles,
            aggregation_rows,
            aggregation_skipped,
            aggregation_errors,
            aggregation_duration,
            probe_attempts,
            probe_delay_ms,
            result_batches,
            tasks_cached,
            telemetry_uploads,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind = bind_addr(if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        });

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("health: listening on {bind}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_under_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.dispatch_rpcs.with_label_values(&["ok"]).inc();
        health.probe_delay_ms.observe(3.0);

        let text = health.render().expect("render");
        assert!(text.contains("meshprobe_dispatch_rpcs_total{status=\"ok\"} 1"));
        assert!(text.contains("meshprobe_probe_delay_ms_count 1"));
        assert!(text.contains("meshprobe_participants 0"));
    }

    #[tokio::test]
    async fn test_health_server_serves_endpoints() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.aggregation_rows.inc_by(6.0);

        let addr = health.start().await.expect("start");
        let client = reqwest::Client::new();

        let healthz = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz");
        assert_eq!(healthz.text().await.expect("body"), "ok");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("meshprobe_aggregation_rows_total 6"));

        health.stop();
    }
}
