use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use super::{AggregateLinkDelay, MeshStore};
use crate::config::ClickHouseConfig;
use crate::proto::NodeSnapshot;

const SYSTEM_INFO_COLUMNS: &str = "ip, \
    cpu_cores, cpu_model_name, cpu_mhz, cpu_cache_size, cpu_usage, \
    memory_total, memory_available, memory_used, memory_used_percent, \
    disk_device, disk_total, disk_free, disk_used, disk_used_percent, \
    network_interface_name, network_bytes_sent, network_bytes_recv, \
    network_packets_sent, network_packets_recv, \
    hostname, os, platform, platform_version, uptime, \
    load1, load5, load15, timestamp";

/// ClickHouse-backed mesh store over a native TCP connection pool.
///
/// Tables are created by the embedded migrations in `crate::migrate`.
#[derive(Clone)]
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
}

impl ClickHouseStore {
    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self> {
        let pool = Pool::new(cfg.dsn());

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse store connected");

        Ok(Self {
            pool,
            database: cfg.database.clone(),
        })
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn execute(&self, sql: String, what: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("inserting {what}"))?;

        Ok(())
    }
}

impl MeshStore for ClickHouseStore {
    async fn participants(&self) -> Result<Vec<String>> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for participants")?;

        let sql = format!("SELECT DISTINCT ip FROM {}.system_info", self.database);

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying participants")?;

        let mut ips = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let ip: String = row.get("ip").context("reading ip")?;
            ips.push(ip);
        }

        Ok(ips)
    }

    async fn insert_node_snapshot(
        &self,
        snapshot: &NodeSnapshot,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = build_system_info_insert(&self.database, snapshot, received_at);
        self.execute(sql, "system_info row").await
    }

    async fn insert_link_delay(&self, row: &AggregateLinkDelay) -> Result<()> {
        let sql = build_link_info_insert(&self.database, row);
        self.execute(sql, "link_info row").await
    }
}

fn build_system_info_insert(
    database: &str,
    s: &NodeSnapshot,
    received_at: DateTime<Utc>,
) -> String {
    let mut sql = String::with_capacity(1024);

    let _ = write!(
        sql,
        "INSERT INTO {database}.system_info ({SYSTEM_INFO_COLUMNS}) VALUES ("
    );

    let _ = write!(
        sql,
        "'{}', {}, '{}', {}, {}, {}, ",
        escape_sql(&s.ip),
        s.cpu_info.cores,
        escape_sql(&s.cpu_info.model_name),
        format_float(s.cpu_info.mhz),
        s.cpu_info.cache_size,
        format_float(s.cpu_info.usage),
    );

    let _ = write!(
        sql,
        "{}, {}, {}, {}, ",
        s.memory_info.total,
        s.memory_info.available,
        s.memory_info.used,
        format_float(s.memory_info.used_percent),
    );

    let _ = write!(
        sql,
        "'{}', {}, {}, {}, {}, ",
        escape_sql(&s.disk_info.device),
        s.disk_info.total,
        s.disk_info.free,
        s.disk_info.used,
        format_float(s.disk_info.used_percent),
    );

    let _ = write!(
        sql,
        "'{}', {}, {}, {}, {}, ",
        escape_sql(&s.network_info.interface_name),
        s.network_info.bytes_sent,
        s.network_info.bytes_recv,
        s.network_info.packets_sent,
        s.network_info.packets_recv,
    );

    let _ = write!(
        sql,
        "'{}', '{}', '{}', '{}', {}, ",
        escape_sql(&s.host_info.hostname),
        escape_sql(&s.host_info.os),
        escape_sql(&s.host_info.platform),
        escape_sql(&s.host_info.platform_version),
        s.host_info.uptime,
    );

    let _ = write!(
        sql,
        "{}, {}, {}, {})",
        format_float(s.load_info.load1),
        format_float(s.load_info.load5),
        format_float(s.load_info.load15),
        format_datetime(received_at),
    );

    sql
}

fn build_link_info_insert(database: &str, row: &AggregateLinkDelay) -> String {
    format!(
        "INSERT INTO {database}.link_info (source_ip, destination_ip, delay, timestamp) \
         VALUES ('{}', '{}', {}, {})",
        escape_sql(&row.source_ip),
        escape_sql(&row.dest_ip),
        format_float(row.avg_delay),
        format_datetime(row.timestamp),
    )
}

/// Formats a timestamp as a quoted ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Non-finite values have no SQL literal; they are stored as zero.
fn format_float(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        "0".to_string()
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
