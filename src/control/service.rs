use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tracing::{debug, warn};

use crate::export::HealthMetrics;
use crate::proto::{
    NodeSnapshot, ProbeResultRequest, StatusResponse, SEND_METRICS_PATH, SEND_PROBE_RESULTS_PATH,
};
use crate::store::{MeshStore, WindowStore};

type Reply = (StatusCode, Json<StatusResponse>);

fn ok() -> Reply {
    (StatusCode::OK, Json(StatusResponse::ok()))
}

fn fail(status: StatusCode, message: String) -> Reply {
    (status, Json(StatusResponse::error(message)))
}

#[derive(Clone)]
struct ResultService<W> {
    window: W,
    health: Option<Arc<HealthMetrics>>,
}

/// Router for `ProbeResultService`.
pub fn results_router<W: WindowStore>(window: W, health: Option<Arc<HealthMetrics>>) -> Router {
    Router::new()
        .route(SEND_PROBE_RESULTS_PATH, post(send_probe_results::<W>))
        .with_state(ResultService { window, health })
}

/// Writes every sample before acknowledging; the first store failure fails
/// the whole call.
async fn send_probe_results<W: WindowStore>(
    State(svc): State<ResultService<W>>,
    Json(req): Json<ProbeResultRequest>,
) -> Reply {
    if let Some(health) = &svc.health {
        health
            .probe_results_received
            .inc_by(req.results.len() as f64);
    }

    for sample in &req.results {
        if let Err(e) = svc.window.insert(sample).await {
            if let Some(health) = &svc.health {
                health.window_writes.with_label_values(&["error"]).inc();
            }

            let message = format!("{e:#}");
            warn!(source = %sample.ip1, dest = %sample.ip2, error = %message, "window write failed");
            return fail(StatusCode::INTERNAL_SERVER_ERROR, message);
        }

        if let Some(health) = &svc.health {
            health.window_writes.with_label_values(&["ok"]).inc();
        }
    }

    debug!(samples = req.results.len(), "probe results stored");

    ok()
}

#[derive(Clone)]
struct MetricsService<S> {
    store: S,
    health: Option<Arc<HealthMetrics>>,
}

impl<S> MetricsService<S> {
    fn record(&self, status: &str) {
        if let Some(health) = &self.health {
            health.snapshots_received.with_label_values(&[status]).inc();
        }
    }
}

/// Router for `MetricsService`.
pub fn metrics_router<S: MeshStore>(store: S, health: Option<Arc<HealthMetrics>>) -> Router {
    Router::new()
        .route(SEND_METRICS_PATH, post(send_metrics::<S>))
        .with_state(MetricsService { store, health })
}

async fn send_metrics<S: MeshStore>(
    State(svc): State<MetricsService<S>>,
    Json(snapshot): Json<NodeSnapshot>,
) -> Reply {
    if snapshot.ip.trim().is_empty() {
        svc.record("rejected");
        return fail(StatusCode::BAD_REQUEST, "snapshot ip is required".to_string());
    }

    match svc.store.insert_node_snapshot(&snapshot, Utc::now()).await {
        Ok(()) => {
            svc.record("ok");
            debug!(ip = %snapshot.ip, "node snapshot stored");
            ok()
        }
        Err(e) => {
            svc.record("error");
            let message = format!("{e:#}");
            warn!(ip = %snapshot.ip, error = %message, "node snapshot insert failed");
            fail(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{bail, Result};
    use chrono::DateTime;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::RpcConfig;
    use crate::proto::ProbeSample;
    use crate::rpc::{serve, RpcClient, RpcError};
    use crate::store::{MemoryStore, MemoryWindowStore, WINDOW_READ_DEPTH};

    #[derive(Clone)]
    struct FullWindow;

    impl WindowStore for FullWindow {
        async fn insert(&self, _sample: &ProbeSample) -> Result<()> {
            bail!("OOM command not allowed")
        }

        async fn newest(&self, _s: &str, _d: &str, _depth: usize) -> Result<Vec<ProbeSample>> {
            Ok(Vec::new())
        }
    }

    fn sample(src: &str, dst: &str, delay: u64) -> ProbeSample {
        ProbeSample {
            ip1: src.to_string(),
            ip2: dst.to_string(),
            tcp_delay: delay,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    async fn client_for(router: Router, cancel: &CancellationToken) -> RpcClient {
        let server = serve("test", "127.0.0.1:0", router, cancel.clone())
            .await
            .expect("serve");
        let rpc = RpcConfig {
            timeout: Duration::from_secs(2),
            connect_attempts: 1,
            connect_backoff: Duration::from_millis(10),
        };
        RpcClient::connect(&server.local_addr().to_string(), &rpc)
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn test_results_are_written_before_ack() {
        let cancel = CancellationToken::new();
        let window = MemoryWindowStore::new(Duration::from_secs(3600));
        let client = client_for(results_router(window.clone(), None), &cancel).await;

        client
            .send_probe_results(vec![sample("A", "B", 5), sample("A", "B", 10), sample("B", "A", 1)])
            .await
            .expect("ack");

        let ab = window.newest("A", "B", WINDOW_READ_DEPTH).await.expect("read");
        assert_eq!(ab.len(), 2);
        assert_eq!(ab[0].tcp_delay, 10);
        assert_eq!(window.newest("B", "A", WINDOW_READ_DEPTH).await.expect("read").len(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_empty_result_batch_acks() {
        let cancel = CancellationToken::new();
        let client = client_for(results_router(FullWindow, None), &cancel).await;

        client.send_probe_results(Vec::new()).await.expect("ack");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_store_failure_fails_whole_call() {
        let cancel = CancellationToken::new();
        let client = client_for(results_router(FullWindow, None), &cancel).await;

        let err = client
            .send_probe_results(vec![sample("A", "B", 5)])
            .await
            .expect_err("store down");

        match err {
            RpcError::Rejected {
                status, message, ..
            } => {
                assert_eq!(status, 500);
                assert!(message.contains("OOM"));
            }
            other => panic!("unexpected error: {other}"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_registers_participant() {
        let cancel = CancellationToken::new();
        let store = MemoryStore::new();
        let client = client_for(metrics_router(store.clone(), None), &cancel).await;

        let snapshot = NodeSnapshot {
            ip: "10.0.0.7".to_string(),
            ..Default::default()
        };
        client.send_metrics(&snapshot).await.expect("ack");

        assert_eq!(
            store.participants().await.expect("participants"),
            vec!["10.0.0.7".to_string()]
        );
        assert_eq!(store.snapshots()[0].snapshot, snapshot);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_without_ip_is_rejected() {
        let cancel = CancellationToken::new();
        let store = MemoryStore::new();
        let client = client_for(metrics_router(store.clone(), None), &cancel).await;

        let err = client
            .send_metrics(&NodeSnapshot::default())
            .await
            .expect_err("missing ip");

        assert!(matches!(err, RpcError::Rejected { status: 400, .. }));
        assert!(store.snapshots().is_empty());

        cancel.cancel();
    }
}
