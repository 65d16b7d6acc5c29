//! Parser task: one log file, one parse run.
//!
//! A task waits for a parse channel, clears the file's facts from the
//! previous run, reads the file line by line, and hands every fact to the
//! write-behind queue (or writes it inline when write-behind is off). When
//! the file is done it upserts the `log_files` row, gives the channel back,
//! and reports `Completed` or `Error`.
//!
//! Lines that fail to parse are counted on the file and do not stop the
//! run. Failing to open or read the file aborts it.

use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::engine::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::models::{Fact, LogFile, Statement};
use crate::storage::{ConnectionRole, Storage, StorageConnection};

/// Outcome of one parse run.
#[derive(Debug, Clone)]
pub struct ParseReport {
    /// The file with this run's counters applied.
    pub file: LogFile,
    /// Why the run stopped early, if it did.
    pub aborted: Option<String>,
}

impl ParseReport {
    pub fn is_ok(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Handle to a submitted parse task. Dropping it does not cancel the task.
pub struct ParseHandle {
    log_file_id: i64,
    handle: JoinHandle<EngineResult<ParseReport>>,
}

impl ParseHandle {
    /// The run itself goes on its own task so a panic in a rule is caught
    /// here and still reported on the progress channel.
    pub(crate) fn spawn(ctx: Arc<EngineContext>, file: LogFile, batch: bool) -> Self {
        let log_file_id = file.id;
        let subject = file.path.display().to_string();
        let run = tokio::spawn(run(ctx.clone(), file, batch));
        let handle = tokio::spawn(async move {
            let e = match run.await {
                Ok(report) => return Ok(report),
                Err(e) => e,
            };
            tracing::error!(log_file = %subject, log_file_id, error = %e, "parse task did not finish");
            if !e.is_panic() {
                return Err(EngineError::Stopped);
            }
            ctx.progress.error(subject.as_str(), "parser task panicked");
            if batch {
                ctx.progress.step(1, subject);
            }
            Err(EngineError::TaskPanicked { log_file_id })
        });
        Self {
            log_file_id,
            handle,
        }
    }

    pub fn log_file_id(&self) -> i64 {
        self.log_file_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. A panic inside the task surfaces as
    /// [`EngineError::TaskPanicked`]; its parse channel has already been
    /// returned and an `Error` event reported by then.
    pub async fn join(self) -> EngineResult<ParseReport> {
        self.handle.await.map_err(|e| {
            tracing::error!(log_file_id = self.log_file_id, error = %e, "parse supervisor did not finish");
            EngineError::Stopped
        })?
    }
}

/// Writes that bypass the queue: the run's clear and upsert, and every fact
/// when write-behind is off. The connection is opened on first use and is
/// private to this task.
struct InlineWriter {
    storage: Arc<dyn Storage>,
    conn: Option<Box<dyn StorageConnection>>,
}

impl InlineWriter {
    fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            conn: None,
        }
    }

    async fn execute(&mut self, statement: &Statement) -> anyhow::Result<u64> {
        if self.conn.is_none() {
            self.conn = Some(self.storage.connect(ConnectionRole::Synchronous).await?);
        }
        match self.conn.as_mut() {
            Some(conn) => conn.execute(statement).await,
            None => anyhow::bail!("synchronous connection unavailable"),
        }
    }

    async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "failed to close synchronous connection");
            }
        }
    }
}

async fn run(ctx: Arc<EngineContext>, mut file: LogFile, batch: bool) -> ParseReport {
    let subject = file.path.display().to_string();

    let channels = ctx.channels();
    let permit = match channels.acquire().await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(log_file = %subject, error = %e, "parse not started");
            file.record_error(e.to_string());
            ctx.progress.error(subject, e.to_string());
            return ParseReport {
                file,
                aborted: Some(e.to_string()),
            };
        }
    };

    file.reset_counters();
    let write_behind = ctx.write_behind_active();
    let mut inline = InlineWriter::new(ctx.storage.clone());

    tracing::debug!(log_file = %subject, log_type = %file.log_type, write_behind, "parse started");
    let aborted = match extract(&ctx, &mut file, &mut inline, write_behind).await {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(log_file = %subject, error = %e, "parse aborted");
            file.record_error(e.to_string());
            Some(e.to_string())
        }
    };

    file.last_parsed_at = Some(Utc::now());
    if let Err(e) = inline.execute(&file.upsert_statement()).await {
        tracing::warn!(log_file = %subject, error = %e, "failed to update log file row");
    }
    inline.close().await;
    drop(permit);

    match &aborted {
        None => {
            tracing::info!(
                log_file = %subject,
                facts = file.facts_count,
                errors = file.errors_count,
                "parse finished"
            );
            ctx.progress.completed(
                subject.as_str(),
                format!("{} facts, {} errors", file.facts_count, file.errors_count),
            );
        }
        Some(reason) => ctx.progress.error(subject.as_str(), reason.as_str()),
    }
    if batch {
        ctx.progress.step(1, subject);
    }

    ParseReport { file, aborted }
}

async fn extract(
    ctx: &EngineContext,
    file: &mut LogFile,
    inline: &mut InlineWriter,
    write_behind: bool,
) -> EngineResult<()> {
    let table = ctx
        .rules
        .table_for(&file.log_type)
        .ok_or_else(|| EngineError::UnknownLogType(file.log_type.clone()))?;

    let handle = tokio::fs::File::open(&file.path)
        .await
        .map_err(|source| EngineError::Io {
            path: file.path.clone(),
            source,
        })?;

    if let Err(e) = inline.execute(&Fact::clear_statement(&table, file.id)).await {
        tracing::warn!(log_file = %file.path.display(), error = %e, "failed to clear previous facts");
        file.record_error(format!("clearing previous facts: {}", e));
    }

    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();
    let mut line_no = 0u64;
    let mut next_fact_id = 1u64;
    let mut bytes = 0u64;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|source| EngineError::Io {
                path: file.path.clone(),
                source,
            })?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        line_no += 1;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        let drafts = match ctx.rules.parse_line(&file.log_type, line_no, line) {
            Ok(drafts) => drafts,
            Err(e) => {
                tracing::debug!(log_file = %file.path.display(), line_no, error = %e, "line rejected");
                file.record_error(e.0);
                continue;
            }
        };

        for draft in drafts {
            let fact = Fact {
                fact_id: next_fact_id,
                line_no,
                rule: draft.rule,
                fields: draft.fields,
                log_file_id: file.id,
            };
            next_fact_id += 1;
            let statement = fact.insert_statement(&table);

            if write_behind {
                let caption = format!(
                    "{}:{} fact {} ({})",
                    file.path.display(),
                    line_no,
                    fact.fact_id,
                    fact.rule
                );
                ctx.queue.enqueue(Some(file.id), caption, statement);
                file.facts_count += 1;
            } else {
                match inline.execute(&statement).await {
                    Ok(_) => file.facts_count += 1,
                    Err(e) => {
                        tracing::warn!(
                            log_file = %file.path.display(),
                            line_no,
                            fact_id = fact.fact_id,
                            error = %e,
                            "failed to persist fact"
                        );
                        file.record_error(format!("line {}: {}", line_no, e));
                    }
                }
            }
        }
    }

    file.size_bytes = bytes;
    Ok(())
}
