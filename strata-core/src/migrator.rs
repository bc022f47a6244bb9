use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{OrmError, OrmResult};
use crate::value::Value;

/// One schema change unit. Identifiers carry a lexicographically sortable
/// timestamp prefix (`20250101120000_create_users`); the runner applies
/// units in identifier order.
#[async_trait]
pub trait Migration: Send + Sync {
    fn id(&self) -> &str;
    async fn up(&self, conn: &Connection) -> OrmResult<()>;
    async fn down(&self, conn: &Connection) -> OrmResult<()>;
    /// Units without a reverse script report `false` and cannot be rolled
    /// back.
    fn has_down(&self) -> bool {
        true
    }
}

/// A migration unit defined by raw SQL scripts. Scripts may contain
/// several statements. An empty down script marks the unit irreversible.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    pub id: String,
    pub up_sql: String,
    pub down_sql: String,
}

impl SqlMigration {
    pub fn new(
        id: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn id(&self) -> &str {
        &self.id
    }

    async fn up(&self, conn: &Connection) -> OrmResult<()> {
        conn.execute_batch(&self.up_sql).await
    }

    async fn down(&self, conn: &Connection) -> OrmResult<()> {
        if !self.has_down() {
            return Err(OrmError::MigrationFailed {
                id: self.id.clone(),
                message: "down migration is empty".to_string(),
            });
        }
        conn.execute_batch(&self.down_sql).await
    }

    fn has_down(&self) -> bool {
        !self.down_sql.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: String,
    pub ran: bool,
}

/// Applies and reverses ordered migration units, stamping each applied
/// unit with a batch number in the `migrations` tracking table (created
/// lazily). Rollback acts on whole batches, newest first. Units are not
/// wrapped in a shared transaction: a failing unit stops the batch and
/// leaves the previously applied units in place, so a later `run` resumes
/// where it stopped.
pub struct Migrator {
    conn: Arc<Connection>,
    migrations: Vec<Arc<dyn Migration>>,
}

impl Migrator {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            migrations: Vec::new(),
        }
    }

    pub fn register(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    fn sorted(&self) -> Vec<Arc<dyn Migration>> {
        let mut units = self.migrations.clone();
        units.sort_by(|a, b| a.id().cmp(b.id()));
        units
    }

    async fn ensure_table(&self) -> OrmResult<()> {
        let dialect = self.conn.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS migrations (\
             id {}, \
             migration TEXT NOT NULL, \
             batch INTEGER NOT NULL, \
             created_at TIMESTAMP DEFAULT {})",
            dialect.auto_increment_pk(),
            dialect.current_timestamp_fn()
        );
        self.conn.execute_batch(&sql).await
    }

    /// Applied units as (identifier, batch), oldest first.
    async fn applied(&self) -> OrmResult<Vec<(String, i64)>> {
        let rows = self
            .conn
            .query(
                "SELECT migration, batch FROM migrations ORDER BY id ASC",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get("migration")?.as_key()?;
                let batch = row.get("batch")?.as_i64()?;
                Some((name, batch))
            })
            .collect())
    }

    /// Applies every pending unit under a fresh batch number. Returns the
    /// number of units applied. Running twice with no new units is a
    /// no-op.
    pub async fn run(&self) -> OrmResult<usize> {
        self.ensure_table().await?;
        let applied = self.applied().await?;
        let batch = applied.iter().map(|(_, b)| *b).max().unwrap_or(0) + 1;
        let applied_names: Vec<&String> = applied.iter().map(|(name, _)| name).collect();

        let mut count = 0;
        for unit in self.sorted() {
            if applied_names.iter().any(|name| *name == unit.id()) {
                continue;
            }
            tracing::info!(
                operation = "migration_apply",
                id = %unit.id(),
                batch = batch,
                "strata migration"
            );
            unit.up(&self.conn)
                .await
                .map_err(|e| OrmError::MigrationFailed {
                    id: unit.id().to_string(),
                    message: e.to_string(),
                })?;
            self.conn
                .execute(
                    "INSERT INTO migrations (migration, batch) VALUES (?, ?)",
                    &[Value::Str(unit.id().to_string()), Value::Int(batch)],
                )
                .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Reverses the last `steps` batches, newest unit first, deleting each
    /// tracking row as its unit comes down.
    pub async fn rollback(&self, steps: u32) -> OrmResult<usize> {
        self.ensure_table().await?;
        let applied = self.applied().await?;
        let max_batch = match applied.iter().map(|(_, b)| *b).max() {
            Some(batch) => batch,
            None => return Ok(0),
        };
        let cutoff = max_batch - (steps.max(1) as i64 - 1);

        let mut count = 0;
        for (name, batch) in applied.iter().rev() {
            if *batch < cutoff {
                continue;
            }
            self.rollback_unit(name).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Reverses every applied unit, newest first.
    pub async fn reset(&self) -> OrmResult<usize> {
        self.ensure_table().await?;
        let applied = self.applied().await?;
        let mut count = 0;
        for (name, _) in applied.iter().rev() {
            self.rollback_unit(name).await?;
            count += 1;
        }
        Ok(count)
    }

    /// `reset` followed by `run`.
    pub async fn refresh(&self) -> OrmResult<()> {
        self.reset().await?;
        self.run().await?;
        Ok(())
    }

    /// Drops every table reported by the dialect catalog, then runs all
    /// units from scratch.
    pub async fn fresh(&self) -> OrmResult<()> {
        let dialect = self.conn.dialect();
        let tables = self.conn.query(dialect.table_catalog_sql(), &[]).await?;
        for row in &tables {
            if let Some(table) = row.values().next().and_then(Value::as_key) {
                self.conn
                    .execute_batch(&dialect.drop_table_sql(&table))
                    .await?;
            }
        }
        self.run().await?;
        Ok(())
    }

    /// Every known unit annotated with whether it has been applied.
    pub async fn status(&self) -> OrmResult<Vec<MigrationStatus>> {
        self.ensure_table().await?;
        let applied = self.applied().await?;
        Ok(self
            .sorted()
            .iter()
            .map(|unit| MigrationStatus {
                id: unit.id().to_string(),
                ran: applied.iter().any(|(name, _)| name == unit.id()),
            })
            .collect())
    }

    async fn rollback_unit(&self, name: &str) -> OrmResult<()> {
        let unit = self
            .migrations
            .iter()
            .find(|m| m.id() == name)
            .ok_or_else(|| OrmError::MigrationFailed {
                id: name.to_string(),
                message: "unit is recorded as applied but not registered".to_string(),
            })?;
        if !unit.has_down() {
            return Err(OrmError::MigrationFailed {
                id: name.to_string(),
                message: "down migration is empty".to_string(),
            });
        }
        tracing::info!(
            operation = "migration_rollback",
            id = %unit.id(),
            "strata migration"
        );
        unit.down(&self.conn)
            .await
            .map_err(|e| OrmError::MigrationFailed {
                id: name.to_string(),
                message: e.to_string(),
            })?;
        self.conn
            .execute(
                "DELETE FROM migrations WHERE migration = ?",
                &[Value::Str(name.to_string())],
            )
            .await?;
        Ok(())
    }
}
