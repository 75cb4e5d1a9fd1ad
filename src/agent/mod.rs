//! Data-plane agent: receives peer lists, probes peers and reports delays.

pub mod cache;
pub mod prober;
pub mod responder;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::AgentConfig;
use crate::export::HealthMetrics;
use crate::proto::{ProbeTaskRequest, StatusResponse, SEND_PROBE_TASKS_PATH};
use crate::rpc::{self, RpcServer};

pub use cache::TaskCache;
pub use prober::{Prober, ResultSink, RpcResultSink};
pub use responder::ProbeResponder;
pub use telemetry::{TelemetryCollector, TelemetryReporter};

#[derive(Clone)]
struct TaskService {
    cache: TaskCache,
    health: Option<Arc<HealthMetrics>>,
}

/// Router for `ProbeTaskService`: each call replaces the whole cache.
pub fn task_router(cache: TaskCache, health: Option<Arc<HealthMetrics>>) -> Router {
    Router::new()
        .route(SEND_PROBE_TASKS_PATH, post(send_probe_tasks))
        .with_state(TaskService { cache, health })
}

async fn send_probe_tasks(
    State(svc): State<TaskService>,
    Json(req): Json<ProbeTaskRequest>,
) -> (StatusCode, Json<StatusResponse>) {
    let count = req.tasks.len();
    svc.cache.replace(req.tasks);

    if let Some(health) = &svc.health {
        health.tasks_cached.set(count as f64);
    }

    debug!(tasks = count, "probe tasks replaced");

    (StatusCode::OK, Json(StatusResponse::ok()))
}

/// Agent runtime: owns the task cache, the task RPC server, the probe
/// responder and the probe and telemetry loops.
pub struct Agent {
    cfg: AgentConfig,
    health: Option<Arc<HealthMetrics>>,
    cache: TaskCache,
    server: Option<RpcServer>,
    responder: Option<ProbeResponder>,
    loops: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Self {
        Self {
            cfg,
            health: None,
            cache: TaskCache::new(),
            server: None,
            responder: None,
            loops: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the health server, then every agent component.
    pub async fn start(&mut self) -> Result<()> {
        let health =
            Arc::new(HealthMetrics::new(&self.cfg.health.addr).context("creating health metrics")?);
        health
            .start()
            .await
            .context("starting health metrics server")?;
        self.health = Some(health);

        let sink = RpcResultSink::new(self.cfg.control.results_addr.clone(), self.cfg.rpc.clone());

        self.start_with(sink).await
    }

    /// Start every component, reporting probe results to `sink`.
    pub async fn start_with<R: ResultSink>(&mut self, sink: R) -> Result<()> {
        let server = rpc::serve(
            "tasks",
            &self.cfg.task_listen,
            task_router(self.cache.clone(), self.health.clone()),
            self.cancel.child_token(),
        )
        .await?;
        self.server = Some(server);

        let responder = ProbeResponder::start(&self.cfg.probe.listen, self.cancel.child_token())
            .await?;
        self.responder = Some(responder);

        let prober = Prober::new(
            self.cache.clone(),
            sink,
            self.cfg.probe.port,
            self.cfg.probe.connect_timeout,
            self.cfg.probe.concurrency,
            self.cfg.probe.interval,
            self.health.clone(),
        );
        self.loops
            .push(tokio::spawn(prober.run(self.cancel.child_token())));

        if self.cfg.telemetry.enabled {
            let reporter = TelemetryReporter::new(
                TelemetryCollector::new(
                    self.cfg.advertise_ip.clone(),
                    self.cfg.telemetry.disk_path.clone(),
                ),
                self.cfg.control.metrics_addr.clone(),
                self.cfg.rpc.clone(),
                self.cfg.telemetry.interval,
                self.health.clone(),
            );
            self.loops
                .push(tokio::spawn(reporter.run(self.cancel.child_token())));
        } else {
            info!("telemetry disabled, this agent will not self-register");
        }

        info!(ip = %self.cfg.advertise_ip, "agent fully started");

        Ok(())
    }

    /// Handle to the task cache shared with the prober.
    pub fn task_cache(&self) -> TaskCache {
        self.cache.clone()
    }

    pub fn task_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(RpcServer::local_addr)
    }

    pub fn probe_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(ProbeResponder::local_addr)
    }

    /// Signal every component to stop and wait for it.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "agent loop exited abnormally");
            }
        }

        if let Some(server) = self.server.take() {
            server.join().await;
        }

        if let Some(responder) = self.responder.take() {
            responder.join().await;
        }

        if let Some(health) = &self.health {
            health.stop();
        }

        info!("agent stopped");

        Ok(())
    }
}
