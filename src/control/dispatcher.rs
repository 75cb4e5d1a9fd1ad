use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{BatchReport, JobHandler, PoolError, WorkerPool};
use crate::config::RpcConfig;
use crate::export::HealthMetrics;
use crate::proto::ProbeTask;
use crate::rpc::{endpoint, RpcClient};
use crate::store::MeshStore;

/// One participant's share of a dispatch batch.
#[derive(Debug, Clone)]
pub struct ProbeTaskJob {
    pub target: String,
    pub participants: Arc<[String]>,
}

/// Peer list for `target`: one (target, peer) task per other participant.
pub fn tasks_for(target: &str, participants: &[String]) -> Vec<ProbeTask> {
    participants
        .iter()
        .filter(|peer| peer.as_str() != target)
        .map(|peer| ProbeTask::new(target, peer.as_str()))
        .collect()
}

/// Delivers a peer list to one agent.
pub trait TaskTransport: Send + Sync + 'static {
    fn send_tasks(
        &self,
        target: &str,
        tasks: Vec<ProbeTask>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Opens a fresh RPC channel to the agent's task port for every delivery.
pub struct RpcTaskTransport {
    task_port: u16,
    rpc: RpcConfig,
}

impl RpcTaskTransport {
    pub fn new(task_port: u16, rpc: RpcConfig) -> Self {
        Self { task_port, rpc }
    }
}

impl TaskTransport for RpcTaskTransport {
    async fn send_tasks(&self, target: &str, tasks: Vec<ProbeTask>) -> Result<()> {
        let client = RpcClient::connect(&endpoint(target, self.task_port), &self.rpc).await?;
        client.send_probe_tasks(tasks).await?;
        Ok(())
    }
}

/// Pool handler: builds the peer list and sends it as one request.
pub struct TaskJobHandler<T> {
    transport: T,
    health: Option<Arc<HealthMetrics>>,
}

impl<T: TaskTransport> TaskJobHandler<T> {
    fn record(&self, status: &str) {
        if let Some(health) = &self.health {
            health.dispatch_rpcs.with_label_values(&[status]).inc();
        }
    }
}

impl<T: TaskTransport> JobHandler for TaskJobHandler<T> {
    type Job = ProbeTaskJob;

    async fn handle(&self, job: ProbeTaskJob) -> Result<()> {
        let tasks = tasks_for(&job.target, &job.participants);
        let count = tasks.len();

        match self.transport.send_tasks(&job.target, tasks).await {
            Ok(()) => {
                self.record("ok");
                debug!(agent = %job.target, tasks = count, "probe tasks delivered");
                Ok(())
            }
            Err(e) => {
                self.record("error");
                warn!(agent = %job.target, error = %format!("{e:#}"), "probe task delivery failed, skipping");
                Err(e)
            }
        }
    }
}

/// Fans the full-mesh task set out to every participant on a fixed cadence.
pub struct Dispatcher<S: MeshStore, T: TaskTransport> {
    registry: S,
    pool: WorkerPool<TaskJobHandler<T>>,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: MeshStore, T: TaskTransport> Dispatcher<S, T> {
    pub fn new(
        registry: S,
        transport: T,
        pool_size: usize,
        interval: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self, PoolError> {
        let handler = TaskJobHandler {
            transport,
            health: health.clone(),
        };

        Ok(Self {
            registry,
            pool: WorkerPool::new(pool_size, handler)?,
            interval,
            health,
        })
    }

    /// Runs one batch over `participants` and waits for all of it.
    pub async fn dispatch_once(&self, participants: &[String]) -> Result<BatchReport> {
        let start = Instant::now();
        let shared: Arc<[String]> = participants.into();

        let mut batch = self.pool.batch();
        for target in participants {
            batch
                .submit(ProbeTaskJob {
                    target: target.clone(),
                    participants: Arc::clone(&shared),
                })
                .await
                .context("submitting dispatch job")?;
        }

        let report = batch.wait().await;
        let elapsed = start.elapsed();

        if let Some(health) = &self.health {
            health.dispatch_batches.inc();
            health.dispatch_batch_duration.observe(elapsed.as_secs_f64());
        }

        info!(
            participants = participants.len(),
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "dispatch batch complete",
        );

        Ok(report)
    }

    /// Snapshots the registry, then runs one batch over it.
    pub async fn dispatch_from_registry(&self) -> Result<BatchReport> {
        let participants = self
            .registry
            .participants()
            .await
            .context("fetching participants")?;

        if let Some(health) = &self.health {
            health.participants.set(participants.len() as f64);
        }

        self.dispatch_once(&participants).await
    }

    /// One immediate batch, then one per interval until `cancel` fires.
    ///
    /// Cancellation is observed between batches only. The pool is released on
    /// exit.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval = ?self.interval,
            workers = self.pool.size(),
            "dispatcher started"
        );

        self.tick().await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.pool.release().await;
        info!("dispatcher stopped");
    }

    async fn tick(&self) {
        if let Err(e) = self.dispatch_from_registry().await {
            warn!(error = %format!("{e:#}"), "dispatch cycle skipped");
        }
    }
}
