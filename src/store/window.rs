use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;
use tokio::time::Instant;

use super::WindowStore;
use crate::proto::ProbeSample;

/// Direction-sensitive window key for an ordered pair.
pub fn window_key(source: &str, dest: &str) -> String {
    format!("{source}:{dest}")
}

fn encode_sample(sample: &ProbeSample) -> Result<String> {
    serde_json::to_string(sample).context("encoding probe sample")
}

/// Decodes stored values, dropping any that fail to parse.
fn decode_samples(key: &str, values: Vec<String>) -> Vec<ProbeSample> {
    values
        .into_iter()
        .filter_map(|raw| match serde_json::from_str::<ProbeSample>(&raw) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::warn!(key, error = %e, "skipping undecodable window value");
                None
            }
        })
        .collect()
}

/// Redis-backed windows: one list per pair, newest at the head.
///
/// The TTL is set only when an insert finds the key absent, so expiry is
/// anchored at window creation. The exists/push/expire sequence is not
/// atomic.
#[derive(Clone)]
pub struct RedisWindowStore<C = ConnectionManager> {
    conn: C,
    ttl_secs: i64,
}

impl RedisWindowStore {
    /// Connects to `url` and verifies the connection.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("parsing redis url {url}"))?;

        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("connecting to redis at {url}"))?;

        let store = Self::with_connection(conn, ttl)?;

        tracing::info!(url, ttl_secs = store.ttl_secs, "redis window store connected");

        Ok(store)
    }
}

impl<C> RedisWindowStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Wraps an established connection. Sub-second TTLs round up to the next
    /// whole second.
    pub fn with_connection(conn: C, ttl: Duration) -> Result<Self> {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let ttl_secs = i64::try_from(secs).context("window ttl out of range")?;

        Ok(Self { conn, ttl_secs })
    }
}

impl<C> WindowStore for RedisWindowStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn insert(&self, sample: &ProbeSample) -> Result<()> {
        let key = window_key(&sample.ip1, &sample.ip2);
        let value = encode_sample(sample)?;
        let mut conn = self.conn.clone();

        let exists: bool = conn
            .exists(&key)
            .await
            .with_context(|| format!("checking window {key}"))?;

        let _: i64 = conn
            .lpush(&key, value)
            .await
            .with_context(|| format!("pushing to window {key}"))?;

        if !exists {
            let _: bool = conn
                .expire(&key, self.ttl_secs)
                .await
                .with_context(|| format!("setting ttl on window {key}"))?;
        }

        Ok(())
    }

    async fn newest(&self, source: &str, dest: &str, depth: usize) -> Result<Vec<ProbeSample>> {
        if depth == 0 {
            return Ok(Vec::new());
        }

        let key = window_key(source, dest);
        let stop = isize::try_from(depth - 1).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();

        let values: Vec<String> = conn
            .lrange(&key, 0, stop)
            .await
            .with_context(|| format!("reading window {key}"))?;

        Ok(decode_samples(&key, values))
    }
}

struct Window {
    expires_at: Instant,
    samples: VecDeque<ProbeSample>,
}

/// In-process windows with the same creation-anchored expiry as Redis.
///
/// Runs on the tokio clock so paused-time tests can step past the TTL.
/// Storage per window is unbounded; reads are capped by `depth`.
#[derive(Clone)]
pub struct MemoryWindowStore {
    windows: Arc<DashMap<String, Window>>,
    ttl: Duration,
}

impl MemoryWindowStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.windows
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WindowStore for MemoryWindowStore {
    async fn insert(&self, sample: &ProbeSample) -> Result<()> {
        let now = Instant::now();
        let key = window_key(&sample.ip1, &sample.ip2);

        let mut window = self.windows.entry(key).or_insert_with(|| Window {
            expires_at: now + self.ttl,
            samples: VecDeque::new(),
        });

        if window.expires_at <= now {
            window.expires_at = now + self.ttl;
            window.samples.clear();
        }

        window.samples.push_front(sample.clone());

        Ok(())
    }

    async fn newest(&self, source: &str, dest: &str, depth: usize) -> Result<Vec<ProbeSample>> {
        let now = Instant::now();
        let key = window_key(source, dest);

        if let Some(window) = self.windows.get(&key) {
            if window.expires_at > now {
                return Ok(window.samples.iter().take(depth).cloned().collect());
            }
        } else {
            return Ok(Vec::new());
        }

        self.windows.remove_if(&key, |_, w| w.expires_at <= now);

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use redis::Value;
    use redis_test::{MockCmd, MockRedisConnection};

    use super::*;

    fn sample(src: &str, dst: &str, delay: u64) -> ProbeSample {
        ProbeSample {
            ip1: src.to_string(),
            ip2: dst.to_string(),
            tcp_delay: delay,
            timestamp: Utc.timestamp_opt(1_700_000_000 + delay as i64, 0).unwrap(),
        }
    }

    fn delays(samples: &[ProbeSample]) -> Vec<u64> {
        samples.iter().map(|s| s.tcp_delay).collect()
    }

    #[test]
    fn test_window_key_is_ordered() {
        assert_eq!(window_key("10.0.0.1", "10.0.0.2"), "10.0.0.1:10.0.0.2");
        assert_ne!(
            window_key("10.0.0.1", "10.0.0.2"),
            window_key("10.0.0.2", "10.0.0.1")
        );
    }

    #[test]
    fn test_decode_skips_garbage() {
        let good = encode_sample(&sample("a", "b", 4)).expect("encode");
        let decoded = decode_samples("a:b", vec!["not json".to_string(), good]);
        assert_eq!(delays(&decoded), vec![4]);
    }

    #[tokio::test]
    async fn test_newest_first_round_trip() {
        let store = MemoryWindowStore::new(Duration::from_secs(3600));

        for delay in [5, 10, 15] {
            store.insert(&sample("A", "B", delay)).await.expect("insert");
        }

        let read = store.newest("A", "B", 10).await.expect("read");
        assert_eq!(delays(&read), vec![15, 10, 5]);
    }

    #[tokio::test]
    async fn test_read_depth_caps_result() {
        let store = MemoryWindowStore::new(Duration::from_secs(3600));

        for delay in 1..=25 {
            store.insert(&sample("A", "B", delay)).await.expect("insert");
        }

        let read = store.newest("A", "B", 10).await.expect("read");
        assert_eq!(read.len(), 10);
        assert_eq!(read[0].tcp_delay, 25);
        assert_eq!(read[9].tcp_delay, 16);

        assert!(store.newest("A", "B", 0).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_windows_are_direction_sensitive() {
        let store = MemoryWindowStore::new(Duration::from_secs(3600));

        store.insert(&sample("A", "B", 3)).await.expect("insert");

        assert_eq!(store.newest("A", "B", 10).await.expect("read").len(), 1);
        assert!(store.newest("B", "A", 10).await.expect("read").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_anchored_at_creation() {
        let ttl = Duration::from_secs(3600);
        let store = MemoryWindowStore::new(ttl);

        store.insert(&sample("A", "B", 1)).await.expect("insert");

        // Writes just before the horizon must not extend it.
        tokio::time::advance(ttl - Duration::from_secs(1)).await;
        store.insert(&sample("A", "B", 2)).await.expect("insert");
        assert_eq!(store.newest("A", "B", 10).await.expect("read").len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.newest("A", "B", 10).await.expect("read").is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_after_expiry_starts_fresh_window() {
        let ttl = Duration::from_secs(60);
        let store = MemoryWindowStore::new(ttl);

        store.insert(&sample("A", "B", 1)).await.expect("insert");
        tokio::time::advance(ttl + Duration::from_secs(1)).await;

        store.insert(&sample("A", "B", 2)).await.expect("insert");
        let read = store.newest("A", "B", 10).await.expect("read");
        assert_eq!(delays(&read), vec![2]);

        // The new window carries its own full TTL.
        tokio::time::advance(ttl - Duration::from_secs(1)).await;
        assert_eq!(store.newest("A", "B", 10).await.expect("read").len(), 1);
    }

    fn redis_store(commands: Vec<MockCmd>, ttl: Duration) -> RedisWindowStore<MockRedisConnection> {
        RedisWindowStore::with_connection(MockRedisConnection::new(commands), ttl).expect("store")
    }

    fn stored(values: &[&str]) -> Value {
        Value::Array(
            values
                .iter()
                .map(|v| Value::BulkString(v.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_redis_insert_into_absent_key_sets_ttl() {
        let first = sample("A", "B", 5);
        let value = encode_sample(&first).expect("encode");

        // The trailing LRANGE only matches once EXPIRE has been consumed.
        let store = redis_store(
            vec![
                MockCmd::new(redis::cmd("EXISTS").arg("A:B"), Ok(0i64)),
                MockCmd::new(redis::cmd("LPUSH").arg("A:B").arg(&value), Ok(1i64)),
                MockCmd::new(redis::cmd("EXPIRE").arg("A:B").arg(90i64), Ok(1i64)),
                MockCmd::new(
                    redis::cmd("LRANGE").arg("A:B").arg(0).arg(9),
                    Ok(stored(&[&value])),
                ),
            ],
            Duration::from_secs(90),
        );

        store.insert(&first).await.expect("insert");
        let read = store.newest("A", "B", 10).await.expect("read");
        assert_eq!(delays(&read), vec![5]);
    }

    #[tokio::test]
    async fn test_redis_insert_into_existing_key_keeps_ttl() {
        let next = sample("A", "B", 10);
        let value = encode_sample(&next).expect("encode");
        let older = encode_sample(&sample("A", "B", 5)).expect("encode");

        // An EXPIRE here would be answered with a mismatch error.
        let store = redis_store(
            vec![
                MockCmd::new(redis::cmd("EXISTS").arg("A:B"), Ok(1i64)),
                MockCmd::new(redis::cmd("LPUSH").arg("A:B").arg(&value), Ok(2i64)),
                MockCmd::new(
                    redis::cmd("LRANGE").arg("A:B").arg(0).arg(9),
                    Ok(stored(&[&value, &older])),
                ),
            ],
            Duration::from_secs(90),
        );

        store.insert(&next).await.expect("insert");
        let read = store.newest("A", "B", 10).await.expect("read");
        assert_eq!(delays(&read), vec![10, 5]);
    }

    #[tokio::test]
    async fn test_redis_newest_reads_from_head() {
        let values: Vec<String> = [15, 10, 5]
            .into_iter()
            .map(|d| encode_sample(&sample("A", "B", d)).expect("encode"))
            .collect();

        let store = redis_store(
            vec![MockCmd::new(
                redis::cmd("LRANGE").arg("A:B").arg(0).arg(2),
                Ok(stored(&[&values[0], "garbage", &values[1], &values[2]])),
            )],
            Duration::from_secs(90),
        );

        let read = store.newest("A", "B", 3).await.expect("read");
        assert_eq!(delays(&read), vec![15, 10, 5]);

        // Zero depth never reaches the server.
        assert!(store.newest("A", "B", 0).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_redis_sub_second_ttl_rounds_up() {
        let first = sample("C", "D", 1);
        let value = encode_sample(&first).expect("encode");

        let store = redis_store(
            vec![
                MockCmd::new(redis::cmd("EXISTS").arg("C:D"), Ok(0i64)),
                MockCmd::new(redis::cmd("LPUSH").arg("C:D").arg(&value), Ok(1i64)),
                MockCmd::new(redis::cmd("EXPIRE").arg("C:D").arg(2i64), Ok(1i64)),
            ],
            Duration::from_millis(1500),
        );

        store.insert(&first).await.expect("insert");
    }
}
