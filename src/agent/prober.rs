use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::TaskCache;
use crate::config::RpcConfig;
use crate::export::HealthMetrics;
use crate::proto::{ProbeSample, ProbeTask};
use crate::rpc::{endpoint, RpcClient};

/// Destination for one probe round's samples.
pub trait ResultSink: Send + Sync + 'static {
    fn send_results(&self, samples: Vec<ProbeSample>) -> impl Future<Output = Result<()>> + Send;
}

/// Uploads samples to the control plane's result service.
pub struct RpcResultSink {
    results_addr: String,
    rpc: RpcConfig,
}

impl RpcResultSink {
    pub fn new(results_addr: String, rpc: RpcConfig) -> Self {
        Self { results_addr, rpc }
    }
}

impl ResultSink for RpcResultSink {
    async fn send_results(&self, samples: Vec<ProbeSample>) -> Result<()> {
        let client = RpcClient::connect(&self.results_addr, &self.rpc)
            .await
            .context("connecting to result service")?;

        client
            .send_probe_results(samples)
            .await
            .context("uploading probe results")?;

        Ok(())
    }
}

/// Times a TCP handshake to `host:port`.
async fn dial(host: &str, port: u16, timeout: Duration) -> Result<Duration> {
    let addr = endpoint(host, port);
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let elapsed = start.elapsed();
            drop(stream);
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("dialing {addr}")),
        Err(_) => bail!("dialing {addr}: timed out after {timeout:?}"),
    }
}

/// Runs `attempt` for every task's destination with at most `limit` in
/// flight. An attempt is first polled once it holds a permit, so queued dials
/// do not accrue delay. Results come back in task order.
async fn dial_bounded<F, Fut>(
    tasks: &[ProbeTask],
    limit: usize,
    attempt: F,
) -> Vec<(usize, Result<Duration>)>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Duration>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut dials = JoinSet::new();

    for (idx, task) in tasks.iter().enumerate() {
        let permits = Arc::clone(&permits);
        let dial = attempt(task.ip2.clone());

        dials.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (idx, dial.await)
        });
    }

    let mut results = Vec::with_capacity(tasks.len());

    while let Some(joined) = dials.join_next().await {
        match joined {
            Ok(done) => results.push(done),
            Err(e) => warn!(error = %e, "probe task failed"),
        }
    }

    results.sort_by_key(|(idx, _)| *idx);
    results
}

/// Dials every cached peer each interval and reports the delays in one batch.
pub struct Prober<R> {
    cache: TaskCache,
    sink: R,
    port: u16,
    connect_timeout: Duration,
    concurrency: usize,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<R: ResultSink> Prober<R> {
    pub fn new(
        cache: TaskCache,
        sink: R,
        port: u16,
        connect_timeout: Duration,
        concurrency: usize,
        interval: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cache,
            sink,
            port,
            connect_timeout,
            concurrency,
            interval,
            health,
        }
    }

    /// Dials the current snapshot, at most `concurrency` at once. Failed
    /// dials yield no sample. Samples come back in task order.
    pub async fn probe_once(&self) -> Vec<ProbeSample> {
        let tasks = self.cache.snapshot();
        let port = self.port;
        let timeout = self.connect_timeout;

        let results = dial_bounded(&tasks, self.concurrency, |dest| async move {
            dial(&dest, port, timeout).await
        })
        .await;

        let mut samples = Vec::with_capacity(results.len());

        for (idx, result) in results {
            let Some(task) = tasks.get(idx) else {
                continue;
            };

            match result {
                Ok(elapsed) => {
                    let delay = elapsed.as_millis() as u64;
                    self.record_attempt("ok", Some(delay));

                    samples.push(ProbeSample {
                        ip1: task.ip1.clone(),
                        ip2: task.ip2.clone(),
                        tcp_delay: delay,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    self.record_attempt("failed", None);
                    debug!(source = %task.ip1, dest = %task.ip2, error = %format!("{e:#}"), "probe missed");
                }
            }
        }

        samples
    }

    /// One probe round. Returns the number of samples sent; a round with no
    /// samples makes no call.
    pub async fn run_once(&self) -> Result<usize> {
        let samples = self.probe_once().await;
        let count = samples.len();

        if count == 0 {
            debug!(tasks = self.cache.len(), "no samples this round");
            return Ok(0);
        }

        let outcome = self.sink.send_results(samples).await;

        if let Some(health) = &self.health {
            let status = if outcome.is_ok() { "ok" } else { "error" };
            health.result_batches.with_label_values(&[status]).inc();
        }

        outcome.map(|()| count)
    }

    /// Runs a round every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            port = self.port,
            concurrency = self.concurrency,
            interval = ?self.interval,
            timeout = ?self.connect_timeout,
            "prober started"
        );

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(sent) => debug!(samples = sent, "probe results reported"),
                        Err(e) => warn!(error = %format!("{e:#}"), "probe result upload failed"),
                    }
                }
            }
        }
    }

    fn record_attempt(&self, status: &str, delay_ms: Option<u64>) {
        if let Some(health) = &self.health {
            health.probe_attempts.with_label_values(&[status]).inc();
            if let Some(delay) = delay_ms {
                health.probe_delay_ms.observe(delay as f64);
            }
        }
    }
}
