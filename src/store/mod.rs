//! Storage seams: per-pair sample windows and the durable mesh store.
//!
//! Both seams are traits; the configured backend is selected by an enum.

pub mod clickhouse;
pub mod memory;
pub mod window;

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::{ControlConfig, StorageBackendKind, WindowBackendKind};
use crate::proto::{NodeSnapshot, ProbeSample};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;
pub use self::window::{window_key, MemoryWindowStore, RedisWindowStore};

/// Newest samples consulted per window.
pub const WINDOW_READ_DEPTH: usize = 10;

/// Averaged delay persisted for one ordered pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateLinkDelay {
    pub source_ip: String,
    pub dest_ip: String,
    pub avg_delay: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-pair sliding sample history.
pub trait WindowStore: Clone + Send + Sync + 'static {
    /// Appends `sample` to the window keyed by its (ip1, ip2) pair, creating
    /// the window with a fresh TTL when absent.
    fn insert(&self, sample: &ProbeSample) -> impl Future<Output = Result<()>> + Send;

    /// Returns up to `depth` samples, newest first.
    fn newest(
        &self,
        source: &str,
        dest: &str,
        depth: usize,
    ) -> impl Future<Output = Result<Vec<ProbeSample>>> + Send;
}

/// Durable store: participant registry, node snapshots and link delays.
pub trait MeshStore: Clone + Send + Sync + 'static {
    /// Distinct IPs that have ever uploaded a node snapshot.
    fn participants(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn insert_node_snapshot(
        &self,
        snapshot: &NodeSnapshot,
        received_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn insert_link_delay(
        &self,
        row: &AggregateLinkDelay,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Configured window backend.
#[derive(Clone)]
pub enum WindowBackend {
    Redis(RedisWindowStore),
    Memory(MemoryWindowStore),
}

impl WindowBackend {
    /// Opens the backend selected by `cfg.window.backend`.
    pub async fn open(cfg: &ControlConfig) -> Result<Self> {
        match cfg.window.backend {
            WindowBackendKind::Redis => Ok(Self::Redis(
                RedisWindowStore::connect(&cfg.redis.url, cfg.window.ttl).await?,
            )),
            WindowBackendKind::Memory => Ok(Self::Memory(MemoryWindowStore::new(cfg.window.ttl))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }
}

impl WindowStore for WindowBackend {
    async fn insert(&self, sample: &ProbeSample) -> Result<()> {
        match self {
            Self::Redis(s) => s.insert(sample).await,
            Self::Memory(s) => s.insert(sample).await,
        }
    }

    async fn newest(&self, source: &str, dest: &str, depth: usize) -> Result<Vec<ProbeSample>> {
        match self {
            Self::Redis(s) => s.newest(source, dest, depth).await,
            Self::Memory(s) => s.newest(source, dest, depth).await,
        }
    }
}

/// Configured durable store backend.
#[derive(Clone)]
pub enum StoreBackend {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl StoreBackend {
    /// Opens the backend selected by `cfg.storage.backend`.
    pub async fn open(cfg: &ControlConfig) -> Result<Self> {
        match cfg.storage.backend {
            StorageBackendKind::Clickhouse => Ok(Self::ClickHouse(
                ClickHouseStore::connect(&cfg.clickhouse).await?,
            )),
            StorageBackendKind::Memory => Ok(Self::Memory(MemoryStore::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(_) => "clickhouse",
            Self::Memory(_) => "memory",
        }
    }
}

impl MeshStore for StoreBackend {
    async fn participants(&self) -> Result<Vec<String>> {
        match self {
            Self::ClickHouse(s) => s.participants().await,
            Self::Memory(s) => s.participants().await,
        }
    }

    async fn insert_node_snapshot(
        &self,
        snapshot: &NodeSnapshot,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.insert_node_snapshot(snapshot, received_at).await,
            Self::Memory(s) => s.insert_node_snapshot(snapshot, received_at).await,
        }
    }

    async fn insert_link_delay(&self, row: &AggregateLinkDelay) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.insert_link_delay(row).await,
            Self::Memory(s) => s.insert_link_delay(row).await,
        }
    }
}

/// Test doubles shared by the control-plane modules.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;

    use super::*;

    /// A `MemoryStore` whose first `failures` participant lookups fail.
    #[derive(Clone)]
    pub(crate) struct FlakyRegistry {
        pub(crate) inner: MemoryStore,
        remaining: Arc<AtomicUsize>,
    }

    impl FlakyRegistry {
        pub(crate) fn new(inner: MemoryStore, failures: usize) -> Self {
            Self {
                inner,
                remaining: Arc::new(AtomicUsize::new(failures)),
            }
        }
    }

    impl MeshStore for FlakyRegistry {
        async fn participants(&self) -> Result<Vec<String>> {
            let failing = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                bail!("registry offline");
            }
            self.inner.participants().await
        }

        async fn insert_node_snapshot(
            &self,
            snapshot: &NodeSnapshot,
            received_at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.insert_node_snapshot(snapshot, received_at).await
        }

        async fn insert_link_delay(&self, row: &AggregateLinkDelay) -> Result<()> {
            self.inner.insert_link_delay(row).await
        }
    }
}
