//! Log file catalog.
//!
//! Finds log files under a directory, records them in `log_files`, and
//! reads them back for parsing. Files are matched to a log type by the
//! [`LogRules`] collaborator; files no log type claims are skipped.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::LogFile;
use crate::rules::LogRules;
use crate::storage::SqliteStorage;

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Walk `root` and return an unsaved [`LogFile`] (id 0) for every file a log
/// type claims, sorted by path.
pub fn scan_directory(root: &Path, project_id: i64, rules: &dyn LogRules) -> Result<Vec<LogFile>> {
    if !root.is_dir() {
        bail!("Scan root does not exist or is not a directory: {}", root.display());
    }
    let excludes = build_globset(&DEFAULT_EXCLUDES)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.is_match(relative) {
            continue;
        }

        match rules.match_file(path) {
            Some(log_type) => {
                let mut file = LogFile::new(0, project_id, path, &log_type);
                file.size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push(file);
            }
            None => tracing::trace!(path = %path.display(), "no log type"),
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(root = %root.display(), found = files.len(), "scan complete");
    Ok(files)
}

/// Insert new files or refresh the log type of known ones. Returns the
/// stored rows with their ids and last-run counters.
pub async fn register(storage: &SqliteStorage, files: &[LogFile]) -> Result<Vec<LogFile>> {
    storage.ensure_schema().await?;
    let mut conn = storage.open().await?;

    let mut stored = Vec::with_capacity(files.len());
    for file in files {
        let path = file.path.to_string_lossy().to_string();
        sqlx::query(
            r#"
            INSERT INTO log_files (project_id, path, log_type, size_bytes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_id, path) DO UPDATE SET
                log_type = excluded.log_type,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(file.project_id)
        .bind(&path)
        .bind(&file.log_type)
        .bind(file.size_bytes as i64)
        .execute(&mut conn)
        .await?;

        let row = sqlx::query(&format!("{} WHERE project_id = ? AND path = ?", SELECT_LOG_FILES))
            .bind(file.project_id)
            .bind(&path)
            .fetch_one(&mut conn)
            .await?;
        stored.push(row_to_log_file(&row));
    }

    conn.close().await?;
    Ok(stored)
}

/// Registered files, optionally limited to one project.
pub async fn load(storage: &SqliteStorage, project_id: Option<i64>) -> Result<Vec<LogFile>> {
    storage.ensure_schema().await?;
    let mut conn = storage.open().await?;

    let rows = match project_id {
        Some(p) => {
            sqlx::query(&format!(
                "{} WHERE project_id = ? ORDER BY project_id, path",
                SELECT_LOG_FILES
            ))
            .bind(p)
            .fetch_all(&mut conn)
            .await?
        }
        None => {
            sqlx::query(&format!("{} ORDER BY project_id, path", SELECT_LOG_FILES))
                .fetch_all(&mut conn)
                .await?
        }
    };

    conn.close().await?;
    Ok(rows.iter().map(row_to_log_file).collect())
}

const SELECT_LOG_FILES: &str = "SELECT id, project_id, path, log_type, size_bytes, last_parsed_at, \
     facts_count, errors_count, last_error FROM log_files";

fn row_to_log_file(row: &SqliteRow) -> LogFile {
    let last_parsed_at: Option<i64> = row.get("last_parsed_at");
    LogFile {
        id: row.get("id"),
        project_id: row.get("project_id"),
        path: PathBuf::from(row.get::<String, _>("path")),
        log_type: row.get("log_type"),
        size_bytes: row.get::<i64, _>("size_bytes").max(0) as u64,
        last_parsed_at: last_parsed_at.and_then(to_datetime),
        facts_count: row.get::<i64, _>("facts_count").max(0) as u64,
        errors_count: row.get::<i64, _>("errors_count").max(0) as u64,
        last_error: row.get("last_error"),
    }
}

fn to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
