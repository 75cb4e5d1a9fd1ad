use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AggregateLinkDelay, MeshStore};
use crate::proto::NodeSnapshot;

/// A node snapshot as persisted, with its receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub snapshot: NodeSnapshot,
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    system_info: Vec<StoredSnapshot>,
    link_info: Vec<AggregateLinkDelay>,
}

/// In-process mesh store. Tables are append-only vectors.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one empty snapshot per IP, so each counts as a
    /// participant.
    pub fn with_participants<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        let now = Utc::now();
        {
            let mut tables = store.tables.lock();
            for ip in ips {
                tables.system_info.push(StoredSnapshot {
                    snapshot: NodeSnapshot {
                        ip: ip.into(),
                        ..Default::default()
                    },
                    received_at: now,
                });
            }
        }
        store
    }

    pub fn link_rows(&self) -> Vec<AggregateLinkDelay> {
        self.tables.lock().link_info.clone()
    }

    pub fn snapshots(&self) -> Vec<StoredSnapshot> {
        self.tables.lock().system_info.clone()
    }
}

impl MeshStore for MemoryStore {
    async fn participants(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let mut ips: Vec<String> = Vec::new();
        for stored in &tables.system_info {
            if !ips.contains(&stored.snapshot.ip) {
                ips.push(stored.snapshot.ip.clone());
            }
        }
        Ok(ips)
    }

    async fn insert_node_snapshot(
        &self,
        snapshot: &NodeSnapshot,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        self.tables.lock().system_info.push(StoredSnapshot {
            snapshot: snapshot.clone(),
            received_at,
        });
        Ok(())
    }

    async fn insert_link_delay(&self, row: &AggregateLinkDelay) -> Result<()> {
        self.tables.lock().link_info.push(row.clone());
        Ok(())
    }
}
