//! Error taxonomy for the extraction engine.
//!
//! Collaborator traits ([`Storage`](crate::storage::Storage),
//! [`LogRules`](crate::rules::LogRules), [`Plugin`](crate::plugin::Plugin))
//! return [`anyhow::Result`]; the engine wraps their failures into
//! [`EngineError`] at its own boundary so callers can match on the kind of
//! unit that failed.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine facade and its components.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine's alive flag is cleared; workers are not running.
    #[error("engine is stopped")]
    Stopped,

    /// Operations are queued but there are no persistence workers to drain them.
    #[error("{pending} operations queued but no persistence workers are running")]
    NoWorkers { pending: usize },

    /// A bulk release would have pushed outstanding permits past capacity.
    #[error("semaphore overflow: requested {requested}, released {released}, capacity {capacity}")]
    SemaphoreOverflow {
        requested: usize,
        released: usize,
        capacity: usize,
    },

    /// A storage statement failed.
    #[error("storage error in '{caption}': {source}")]
    Storage {
        caption: String,
        #[source]
        source: anyhow::Error,
    },

    /// A fatal I/O error while reading a log file.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log file's type has no configured rules or table.
    #[error("unknown log type '{0}'")]
    UnknownLogType(String),

    /// A plugin candidate failed loading or validation. Converted from
    /// [`crate::plugin::PluginRejection`].
    #[error("plugin '{source_name}' rejected: {reason}")]
    PluginRejected { source_name: String, reason: String },

    /// A plugin's `activate` entry point failed.
    #[error("plugin '{plugin}' failed to activate: {source}")]
    PluginActivation {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    /// A parser task panicked; its permit was released during unwind.
    #[error("parse task for log file {log_file_id} panicked")]
    TaskPanicked { log_file_id: i64 },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
