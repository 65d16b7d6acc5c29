use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{ConnectionRole, Storage, StorageConnection};
use crate::config::{is_sql_identifier, Config, DbConfig};
use crate::models::{SqlValue, Statement};

/// SQLite storage. Each [`connect`](Storage::connect) opens a fresh
/// dedicated connection; WAL mode plus a busy timeout lets several
/// workers write to the same file.
pub struct SqliteStorage {
    path: PathBuf,
    busy_timeout: Duration,
    fact_tables: Vec<String>,
    schema: OnceCell<()>,
}

impl SqliteStorage {
    pub fn new(db: &DbConfig, fact_tables: Vec<String>) -> Self {
        Self {
            path: db.path.clone(),
            busy_timeout: Duration::from_millis(db.busy_timeout_ms),
            fact_tables,
            schema: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.db, config.fact_tables())
    }

    /// Open a raw connection without touching the schema.
    pub async fn open(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.busy_timeout);

        let conn = options
            .connect()
            .await
            .with_context(|| format!("Failed to open database: {}", self.path.display()))?;
        Ok(conn)
    }

    /// Create tables if they do not exist yet. Runs at most once per storage.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                let mut conn = self.open().await?;
                create_schema(&mut conn, &self.fact_tables).await?;
                conn.close().await?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

async fn create_schema(conn: &mut SqliteConnection, fact_tables: &[String]) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            log_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            last_parsed_at INTEGER,
            facts_count INTEGER NOT NULL DEFAULT 0,
            errors_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            UNIQUE(project_id, path)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_files_project ON log_files(project_id)")
        .execute(&mut *conn)
        .await?;

    for table in fact_tables {
        if !is_sql_identifier(table) {
            anyhow::bail!("refusing to create fact table with name '{}'", table);
        }
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                log_file_id INTEGER NOT NULL,
                fact_id INTEGER NOT NULL,
                line_no INTEGER NOT NULL,
                rule TEXT NOT NULL,
                fields_json TEXT NOT NULL DEFAULT '{{}}',
                created_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(&mut *conn)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_log_file ON {table}(log_file_id, line_no)"
        ))
        .execute(&mut *conn)
        .await?;
    }

    tracing::debug!(tables = fact_tables.len(), "schema ready");
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn StorageConnection>> {
        self.ensure_schema().await?;
        let conn = self.open().await?;
        tracing::debug!(%role, path = %self.path.display(), "opened sqlite connection");
        Ok(Box::new(SqliteStorageConnection { conn, role }))
    }
}

struct SqliteStorageConnection {
    conn: SqliteConnection,
    role: ConnectionRole,
}

#[async_trait]
impl StorageConnection for SqliteStorageConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlValue::Null => query.bind(None::<i64>),
                SqlValue::Integer(i) => query.bind(*i),
                SqlValue::Real(f) => query.bind(*f),
                SqlValue::Text(s) => query.bind(s.as_str()),
            };
        }
        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        tracing::debug!(role = %self.role, "closing sqlite connection");
        self.conn.close().await?;
        Ok(())
    }
}
