use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::dialect::Dialect;
use crate::error::{map_sqlx_error, OrmError, OrmResult};
use crate::value::{Row, Value};

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Auto-increment key of the inserted row. `None` for PostgreSQL,
    /// which reports inserted keys through `RETURNING` instead.
    pub last_insert_id: Option<i64>,
}

#[cfg(feature = "metrics")]
fn record_statement_metrics(operation: &str, elapsed: std::time::Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [("operation", operation.to_string())];
    metrics::histogram!("strata.statement.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("strata.statement.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn record_statement_metrics(_operation: &str, _elapsed: std::time::Duration) {}

enum Backend {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
    #[cfg(feature = "mysql")]
    MySql(sqlx::MySqlPool),
}

/// The driver adapter: owns the pool for one database and exposes the two
/// read modes the rest of the crate is written against.
///
/// Safe for concurrent callers; the pool serializes access for the
/// single-connection dialects (SQLite pools are capped at one connection so
/// `sqlite::memory:` stays a single database).
pub struct Connection {
    backend: Backend,
    statements: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.dialect())
            .finish()
    }
}

impl Connection {
    /// Connects to the database named by the URL scheme
    /// (`sqlite:` / `postgres:` / `mysql:`). A scheme whose cargo feature
    /// is disabled reports the missing driver.
    pub async fn connect(url: &str) -> OrmResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        let backend = match scheme {
            "sqlite" => Self::sqlite_backend(url).await?,
            "postgres" | "postgresql" => Self::postgres_backend(url).await?,
            "mysql" => Self::mysql_backend(url).await?,
            other => {
                return Err(OrmError::ConnectionFailed(format!(
                    "unrecognized database url scheme '{}'",
                    other
                )));
            }
        };
        Ok(Self {
            backend,
            statements: AtomicU64::new(0),
        })
    }

    #[cfg(feature = "sqlite")]
    async fn sqlite_backend(url: &str) -> OrmResult<Backend> {
        // One connection keeps `sqlite::memory:` a single database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| OrmError::ConnectionFailed(e.to_string()))?;
        Ok(Backend::Sqlite(pool))
    }

    #[cfg(not(feature = "sqlite"))]
    async fn sqlite_backend(_url: &str) -> OrmResult<Backend> {
        Err(OrmError::DriverUnavailable("sqlite"))
    }

    #[cfg(feature = "postgres")]
    async fn postgres_backend(url: &str) -> OrmResult<Backend> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| OrmError::ConnectionFailed(e.to_string()))?;
        Ok(Backend::Postgres(pool))
    }

    #[cfg(not(feature = "postgres"))]
    async fn postgres_backend(_url: &str) -> OrmResult<Backend> {
        Err(OrmError::DriverUnavailable("postgres"))
    }

    #[cfg(feature = "mysql")]
    async fn mysql_backend(url: &str) -> OrmResult<Backend> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| OrmError::ConnectionFailed(e.to_string()))?;
        Ok(Backend::MySql(pool))
    }

    #[cfg(not(feature = "mysql"))]
    async fn mysql_backend(_url: &str) -> OrmResult<Backend> {
        Err(OrmError::DriverUnavailable("mysql"))
    }

    pub fn dialect(&self) -> Dialect {
        match &self.backend {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(_) => Dialect::Sqlite,
            #[cfg(feature = "postgres")]
            Backend::Postgres(_) => Dialect::Postgres,
            #[cfg(feature = "mysql")]
            Backend::MySql(_) => Dialect::MySql,
        }
    }

    /// Total statements issued through this adapter. Exposed so tests can
    /// assert the bounded-query guarantees of eager loading.
    pub fn statements_run(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    fn note_statement(&self, operation: &str, sql: &str) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(operation = operation, sql = %sql, "strata query");
    }

    /// Executes a SELECT and decodes every row into a column → value map.
    pub async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        let sql = self.dialect().rewrite_placeholders(sql);
        self.note_statement("query", &sql);
        let start = std::time::Instant::now();
        let rows = match &self.backend {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                rows.iter()
                    .map(decode_sqlite_row)
                    .collect::<OrmResult<Vec<_>>>()?
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                rows.iter()
                    .map(decode_postgres_row)
                    .collect::<OrmResult<Vec<_>>>()?
            }
            #[cfg(feature = "mysql")]
            Backend::MySql(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                rows.iter()
                    .map(decode_mysql_row)
                    .collect::<OrmResult<Vec<_>>>()?
            }
        };
        record_statement_metrics("query", start.elapsed());
        Ok(rows)
    }

    /// Executes a write statement and reports affected rows plus the
    /// driver's last-insert id where the dialect has one.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
        let sql = self.dialect().rewrite_placeholders(sql);
        self.note_statement("execute", &sql);
        let start = std::time::Instant::now();
        let result = match &self.backend {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let res = query.execute(pool).await.map_err(map_sqlx_error)?;
                ExecResult {
                    rows_affected: res.rows_affected(),
                    last_insert_id: Some(res.last_insert_rowid()),
                }
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let res = query.execute(pool).await.map_err(map_sqlx_error)?;
                ExecResult {
                    rows_affected: res.rows_affected(),
                    last_insert_id: None,
                }
            }
            #[cfg(feature = "mysql")]
            Backend::MySql(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let res = query.execute(pool).await.map_err(map_sqlx_error)?;
                ExecResult {
                    rows_affected: res.rows_affected(),
                    last_insert_id: Some(res.last_insert_id() as i64),
                }
            }
        };
        record_statement_metrics("execute", start.elapsed());
        Ok(result)
    }

    /// Runs a raw script without preparing it, so it may contain several
    /// statements. Migration units go through here.
    pub async fn execute_batch(&self, sql: &str) -> OrmResult<()> {
        self.note_statement("batch", sql);
        match &self.backend {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(pool) => {
                sqlx::raw_sql(sql).execute(pool).await.map_err(map_sqlx_error)?;
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                sqlx::raw_sql(sql).execute(pool).await.map_err(map_sqlx_error)?;
            }
            #[cfg(feature = "mysql")]
            Backend::MySql(pool) => {
                sqlx::raw_sql(sql).execute(pool).await.map_err(map_sqlx_error)?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match &self.backend {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(pool) => pool.close().await,
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => pool.close().await,
            #[cfg(feature = "mysql")]
            Backend::MySql(pool) => pool.close().await,
        }
    }
}

#[cfg(feature = "sqlite")]
fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Str(v) => query.bind(v.clone()),
        Value::Bool(v) => query.bind(*v),
        Value::Json(v) => query.bind(v.to_string()),
        Value::DateTime(v) => query.bind(*v),
        Value::Bytes(v) => query.bind(v.clone()),
    }
}

#[cfg(feature = "postgres")]
fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Str(v) => query.bind(v.clone()),
        Value::Bool(v) => query.bind(*v),
        Value::Json(v) => query.bind(v.clone()),
        Value::DateTime(v) => query.bind(*v),
        Value::Bytes(v) => query.bind(v.clone()),
    }
}

#[cfg(feature = "mysql")]
fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Str(v) => query.bind(v.clone()),
        Value::Bool(v) => query.bind(*v),
        Value::Json(v) => query.bind(v.to_string()),
        Value::DateTime(v) => query.bind(*v),
        Value::Bytes(v) => query.bind(v.clone()),
    }
}

#[cfg(feature = "sqlite")]
fn decode_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> OrmResult<Row> {
    use sqlx::{Column, Row as _, TypeInfo, ValueRef};

    let mut out = IndexMap::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(map_sqlx_error)?;
        let type_name = raw.type_info().name().to_string();
        let value = if raw.is_null() {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "NUMERIC" => Value::Int(row.try_get::<i64, _>(i).map_err(map_sqlx_error)?),
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i).map_err(map_sqlx_error)?),
                "REAL" => Value::Float(row.try_get::<f64, _>(i).map_err(map_sqlx_error)?),
                "BLOB" => Value::Bytes(row.try_get::<Vec<u8>, _>(i).map_err(map_sqlx_error)?),
                "DATETIME" | "TIMESTAMP" => Value::DateTime(
                    row.try_get::<chrono::NaiveDateTime, _>(i).map_err(map_sqlx_error)?,
                ),
                _ => Value::Str(row.try_get::<String, _>(i).map_err(map_sqlx_error)?),
            }
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(feature = "postgres")]
fn decode_postgres_row(row: &sqlx::postgres::PgRow) -> OrmResult<Row> {
    use sqlx::{Column, Row as _, TypeInfo, ValueRef};

    let mut out = IndexMap::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(map_sqlx_error)?;
        let type_name = raw.type_info().name().to_string();
        let value = if raw.is_null() {
            Value::Null
        } else {
            match type_name.as_str() {
                "BOOL" => Value::Bool(row.try_get::<bool, _>(i).map_err(map_sqlx_error)?),
                "INT2" => Value::Int(row.try_get::<i16, _>(i).map_err(map_sqlx_error)? as i64),
                "INT4" => Value::Int(row.try_get::<i32, _>(i).map_err(map_sqlx_error)? as i64),
                "INT8" => Value::Int(row.try_get::<i64, _>(i).map_err(map_sqlx_error)?),
                "FLOAT4" => Value::Float(row.try_get::<f32, _>(i).map_err(map_sqlx_error)? as f64),
                "FLOAT8" => Value::Float(row.try_get::<f64, _>(i).map_err(map_sqlx_error)?),
                "JSON" | "JSONB" => {
                    Value::Json(row.try_get::<serde_json::Value, _>(i).map_err(map_sqlx_error)?)
                }
                "TIMESTAMP" => Value::DateTime(
                    row.try_get::<chrono::NaiveDateTime, _>(i).map_err(map_sqlx_error)?,
                ),
                "TIMESTAMPTZ" => Value::DateTime(
                    row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                        .map_err(map_sqlx_error)?
                        .naive_utc(),
                ),
                "DATE" => Value::Str(
                    row.try_get::<chrono::NaiveDate, _>(i)
                        .map_err(map_sqlx_error)?
                        .format("%Y-%m-%d")
                        .to_string(),
                ),
                "BYTEA" => Value::Bytes(row.try_get::<Vec<u8>, _>(i).map_err(map_sqlx_error)?),
                _ => match row.try_get::<String, _>(i) {
                    Ok(s) => Value::Str(s),
                    Err(_) => Value::Null,
                },
            }
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(feature = "mysql")]
fn decode_mysql_row(row: &sqlx::mysql::MySqlRow) -> OrmResult<Row> {
    use sqlx::{Column, Row as _, TypeInfo, ValueRef};

    let mut out = IndexMap::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(map_sqlx_error)?;
        let type_name = raw.type_info().name().to_string();
        let value = if raw.is_null() {
            Value::Null
        } else {
            match type_name.as_str() {
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i).map_err(map_sqlx_error)?),
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                    Value::Int(row.try_get::<i64, _>(i).map_err(map_sqlx_error)?)
                }
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED"
                | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
                    Value::Int(row.try_get::<u64, _>(i).map_err(map_sqlx_error)? as i64)
                }
                "FLOAT" => Value::Float(row.try_get::<f32, _>(i).map_err(map_sqlx_error)? as f64),
                "DOUBLE" => Value::Float(row.try_get::<f64, _>(i).map_err(map_sqlx_error)?),
                "JSON" => {
                    Value::Json(row.try_get::<serde_json::Value, _>(i).map_err(map_sqlx_error)?)
                }
                "DATETIME" => Value::DateTime(
                    row.try_get::<chrono::NaiveDateTime, _>(i).map_err(map_sqlx_error)?,
                ),
                "TIMESTAMP" => Value::DateTime(
                    row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                        .map_err(map_sqlx_error)?
                        .naive_utc(),
                ),
                "DATE" => Value::Str(
                    row.try_get::<chrono::NaiveDate, _>(i)
                        .map_err(map_sqlx_error)?
                        .format("%Y-%m-%d")
                        .to_string(),
                ),
                "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "VARBINARY" | "BINARY" => {
                    Value::Bytes(row.try_get::<Vec<u8>, _>(i).map_err(map_sqlx_error)?)
                }
                _ => match row.try_get::<String, _>(i) {
                    Ok(s) => Value::Str(s),
                    Err(_) => Value::Null,
                },
            }
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}
