//! Control plane: task dispatch, result intake and aggregation.

pub mod aggregator;
pub mod dispatcher;
pub mod pool;
pub mod service;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ControlConfig;
use crate::export::HealthMetrics;
use crate::migrate::SchemaMigrator;
use crate::rpc::{self, RpcServer};
use crate::store::{MeshStore, StoreBackend, WindowBackend, WindowStore};

pub use aggregator::{mean_delay, AggregationReport, Aggregator};
pub use dispatcher::{Dispatcher, RpcTaskTransport, TaskTransport};
pub use pool::{BatchReport, PoolError, WorkerPool};

/// Control-plane runtime: owns the RPC servers, the dispatch pool and the
/// two timer loops.
pub struct ControlPlane {
    cfg: ControlConfig,
    health: Option<Arc<HealthMetrics>>,
    servers: Vec<RpcServer>,
    loops: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(cfg: ControlConfig) -> Self {
        Self {
            cfg,
            health: None,
            servers: Vec::new(),
            loops: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the health server, open the configured stores and run.
    pub async fn start(&mut self) -> Result<()> {
        let health =
            Arc::new(HealthMetrics::new(&self.cfg.health.addr).context("creating health metrics")?);
        health
            .start()
            .await
            .context("starting health metrics server")?;
        self.health = Some(health);

        let store = StoreBackend::open(&self.cfg)
            .await
            .context("opening mesh store")?;
        info!(backend = store.name(), "mesh store ready");

        if let StoreBackend::ClickHouse(ch) = &store {
            if self.cfg.clickhouse.migrations.enabled {
                SchemaMigrator::new(ch.pool().clone())
                    .up()
                    .await
                    .context("applying ClickHouse migrations")?;
            }
        }

        let window = WindowBackend::open(&self.cfg)
            .await
            .context("opening window store")?;
        info!(backend = window.name(), ttl = ?self.cfg.window.ttl, "window store ready");

        let transport = RpcTaskTransport::new(self.cfg.agent_task_port, self.cfg.rpc.clone());

        self.start_with(window, store, transport).await
    }

    /// Start serving and looping over the given collaborators.
    pub async fn start_with<W, S, T>(&mut self, window: W, store: S, transport: T) -> Result<()>
    where
        W: WindowStore,
        S: MeshStore,
        T: TaskTransport,
    {
        let metrics = rpc::serve(
            "metrics",
            &self.cfg.metrics_listen,
            service::metrics_router(store.clone(), self.health.clone()),
            self.cancel.child_token(),
        )
        .await?;

        let results = rpc::serve(
            "results",
            &self.cfg.results_listen,
            service::results_router(window.clone(), self.health.clone()),
            self.cancel.child_token(),
        )
        .await?;

        self.servers.push(metrics);
        self.servers.push(results);

        let dispatcher = Dispatcher::new(
            store.clone(),
            transport,
            self.cfg.pool_size,
            self.cfg.dispatch_interval,
            self.health.clone(),
        )
        .context("creating dispatch pool")?;

        let aggregator = Aggregator::new(
            window,
            store,
            self.cfg.aggregation_interval,
            self.health.clone(),
        );

        self.loops
            .push(tokio::spawn(dispatcher.run(self.cancel.child_token())));
        self.loops
            .push(tokio::spawn(aggregator.run(self.cancel.child_token())));

        info!(
            pool_size = self.cfg.pool_size,
            dispatch_interval = ?self.cfg.dispatch_interval,
            aggregation_interval = ?self.cfg.aggregation_interval,
            "control plane fully started"
        );

        Ok(())
    }

    /// Address of the node telemetry service, once started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.servers.first().map(RpcServer::local_addr)
    }

    /// Address of the probe result service, once started.
    pub fn results_addr(&self) -> Option<SocketAddr> {
        self.servers.get(1).map(RpcServer::local_addr)
    }

    /// Signal every loop and server to stop and wait for them.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "control loop exited abnormally");
            }
        }

        for server in self.servers.drain(..) {
            server.join().await;
        }

        if let Some(health) = &self.health {
            health.stop();
        }

        info!("control plane stopped");

        Ok(())
    }
}
