//! Core data models used throughout the extraction engine.
//!
//! These types represent the log files, facts, and storage statements that
//! flow from parser tasks through the write-behind queue into storage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A registered source log file and the counters of its last parse run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogFile {
    pub id: i64,
    pub project_id: i64,
    pub path: PathBuf,
    pub log_type: String,
    pub size_bytes: u64,
    pub last_parsed_at: Option<DateTime<Utc>>,
    pub facts_count: u64,
    pub errors_count: u64,
    pub last_error: Option<String>,
}

impl LogFile {
    pub fn new(id: i64, project_id: i64, path: impl Into<PathBuf>, log_type: &str) -> Self {
        Self {
            id,
            project_id,
            path: path.into(),
            log_type: log_type.to_string(),
            size_bytes: 0,
            last_parsed_at: None,
            facts_count: 0,
            errors_count: 0,
            last_error: None,
        }
    }

    /// Zero the per-run counters before a new parse run.
    pub fn reset_counters(&mut self) {
        self.facts_count = 0;
        self.errors_count = 0;
        self.last_error = None;
    }

    pub fn record_error(&mut self, message: String) {
        self.errors_count += 1;
        self.last_error = Some(message);
    }

    /// Insert-or-update of this file's row in `log_files`.
    pub fn upsert_statement(&self) -> Statement {
        Statement::new(
            r#"
            INSERT INTO log_files (project_id, path, log_type, size_bytes, last_parsed_at, facts_count, errors_count, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, path) DO UPDATE SET
                log_type = excluded.log_type,
                size_bytes = excluded.size_bytes,
                last_parsed_at = excluded.last_parsed_at,
                facts_count = excluded.facts_count,
                errors_count = excluded.errors_count,
                last_error = excluded.last_error
            "#,
        )
        .bind(self.project_id)
        .bind(self.path.to_string_lossy().to_string())
        .bind(self.log_type.as_str())
        .bind(self.size_bytes)
        .bind(self.last_parsed_at.map(|t| t.timestamp()))
        .bind(self.facts_count)
        .bind(self.errors_count)
        .bind(self.last_error.clone())
    }
}

/// Fact fields produced by a rule, before the parser task numbers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactDraft {
    pub rule: String,
    pub fields: BTreeMap<String, String>,
}

/// One structured record extracted from a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fact {
    /// Monotonic within one parse run, starting at 1.
    pub fact_id: u64,
    pub line_no: u64,
    pub rule: String,
    pub fields: BTreeMap<String, String>,
    pub log_file_id: i64,
}

impl Fact {
    pub fn insert_statement(&self, table: &str) -> Statement {
        let fields_json = serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string());
        Statement::new(format!(
            "INSERT INTO {} (log_file_id, fact_id, line_no, rule, fields_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            table
        ))
        .bind(self.log_file_id)
        .bind(self.fact_id)
        .bind(self.line_no)
        .bind(self.rule.as_str())
        .bind(fields_json)
        .bind(Utc::now().timestamp())
    }

    /// Statement removing a file's facts from a previous run.
    pub fn clear_statement(table: &str, log_file_id: i64) -> Statement {
        Statement::new(format!("DELETE FROM {} WHERE log_file_id = ?", table)).bind(log_file_id)
    }
}

/// A positional bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A write statement: SQL text plus positional binds.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}
