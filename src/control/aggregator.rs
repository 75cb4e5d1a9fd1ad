use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::HealthMetrics;
use crate::proto::ProbeSample;
use crate::store::{AggregateLinkDelay, MeshStore, WindowStore, WINDOW_READ_DEPTH};

/// Counts from one aggregation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    /// Ordered pairs visited.
    pub pairs: usize,
    /// Rows persisted.
    pub rows: usize,
    /// Pairs with an empty window.
    pub skipped: usize,
    /// Window reads or inserts that failed.
    pub errors: usize,
}

/// Arithmetic mean of the sample delays, or `None` for no samples.
pub fn mean_delay(samples: &[ProbeSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let total: f64 = samples.iter().map(|s| s.tcp_delay as f64).sum();
    Some(total / samples.len() as f64)
}

/// Folds every pair's newest window samples into a persisted average.
pub struct Aggregator<W, S> {
    window: W,
    store: S,
    depth: usize,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<W: WindowStore, S: MeshStore> Aggregator<W, S> {
    pub fn new(window: W, store: S, interval: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            window,
            store,
            depth: WINDOW_READ_DEPTH,
            interval,
            health,
        }
    }

    /// Visits every ordered pair of the current participant set once.
    ///
    /// Only a registry failure fails the cycle; per-pair failures are counted
    /// and skipped.
    pub async fn aggregate_once(&self) -> Result<AggregationReport> {
        let participants = self
            .store
            .participants()
            .await
            .context("fetching participants")?;

        if let Some(health) = &self.health {
            health.participants.set(participants.len() as f64);
        }

        let mut report = AggregationReport::default();

        for source in &participants {
            for dest in &participants {
                if source == dest {
                    continue;
                }
                report.pairs += 1;

                let samples = match self.window.newest(source, dest, self.depth).await {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!(source = %source, dest = %dest, error = %format!("{e:#}"), "window read failed");
                        report.errors += 1;
                        continue;
                    }
                };

                let Some(avg_delay) = mean_delay(&samples) else {
                    report.skipped += 1;
                    continue;
                };

                let row = AggregateLinkDelay {
                    source_ip: source.clone(),
                    dest_ip: dest.clone(),
                    avg_delay,
                    timestamp: Utc::now(),
                };

                match self.store.insert_link_delay(&row).await {
                    Ok(()) => {
                        debug!(source = %source, dest = %dest, avg_delay, samples = samples.len(), "link delay stored");
                        report.rows += 1;
                    }
                    Err(e) => {
                        warn!(source = %source, dest = %dest, error = %format!("{e:#}"), "link delay insert failed");
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Runs a cycle every interval, the first one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, depth = self.depth, "aggregator started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("aggregator stopped");
    }

    async fn tick(&self) {
        let start = Instant::now();

        match self.aggregate_once().await {
            Ok(report) => {
                if let Some(health) = &self.health {
                    health.aggregation_cycles.inc();
                    health.aggregation_rows.inc_by(report.rows as f64);
                    health.aggregation_skipped.inc_by(report.skipped as f64);
                    health.aggregation_errors.inc_by(report.errors as f64);
                    health
                        .aggregation_duration
                        .observe(start.elapsed().as_secs_f64());
                }

                info!(
                    pairs = report.pairs,
                    rows = report.rows,
                    skipped = report.skipped,
                    errors = report.errors,
                    "aggregation cycle complete",
                );
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "aggregation cycle skipped");
            }
        }
    }
}
