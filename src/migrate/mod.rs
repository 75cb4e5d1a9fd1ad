use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// One embedded schema step.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
}

/// Embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    up_sql: include_str!("sql/001_init.up.sql"),
}];

/// Recorded schema position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SchemaState {
    version: u32,
    dirty: bool,
}

/// Outcome of [`SchemaMigrator::up`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: u32,
}

/// Creates and upgrades the `system_info` and `link_info` tables.
///
/// Progress is tracked in a single-row `schema_migrations` table. A step is
/// recorded dirty before it runs and clean after, so a crash mid-step blocks
/// later runs until an operator intervenes.
pub struct SchemaMigrator {
    pool: Pool,
}

impl SchemaMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Applies every embedded migration newer than the recorded version.
    pub async fn up(&self) -> Result<MigrationReport> {
        self.ensure_tracking_table().await?;

        let state = self.state().await?;
        if state.dirty {
            bail!(
                "schema version {} is dirty, manual intervention required",
                state.version
            );
        }

        let mut report = MigrationReport {
            from: state.version,
            to: state.version,
            applied: 0,
        };

        for migration in pending(state.version) {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "applying migration"
            );

            self.record(migration.version, true).await?;

            self.execute_all(migration.up_sql)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;

            self.record(migration.version, false).await?;

            report.to = migration.version;
            report.applied += 1;
        }

        if report.applied == 0 {
            tracing::info!(version = report.from, "schema up to date");
        } else {
            tracing::info!(
                from = report.from,
                to = report.to,
                applied = report.applied,
                "migrations completed"
            );
        }

        Ok(report)
    }

    async fn ensure_tracking_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema_migrations")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn state(&self) -> Result<SchemaState> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema state")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying schema version")?;

        let Some(row) = block.rows().next() else {
            return Ok(SchemaState::default());
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok(SchemaState {
            version: u32::try_from(version).context("schema version out of range")?,
            dirty: dirty != 0,
        })
    }

    async fn record(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema update")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );

        handle
            .execute(sql.as_str())
            .await
            .context("recording schema version")?;

        Ok(())
    }

    async fn execute_all(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migration")?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_trailing_semicolons() {
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
        assert!(split_statements("  \n ").is_empty());
    }

    #[test]
    fn test_init_creates_mesh_tables() {
        let statements = split_statements(MIGRATIONS[0].up_sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("system_info"));
        assert!(statements[1].contains("link_info"));
    }

    #[test]
    fn test_pending_skips_applied() {
        assert_eq!(pending(0).count(), MIGRATIONS.len());
        let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        assert_eq!(pending(latest).count(), 0);
    }

    #[test]
    fn test_migrations_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[0].version < window[1].version);
        }
    }
}
