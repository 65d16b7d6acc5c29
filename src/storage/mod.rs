//! Storage abstraction for the extraction engine.
//!
//! The [`Storage`] trait is the connection factory the engine writes
//! through. Every persistence worker, every synchronous-mode parser task,
//! and every plugin activation opens its own [`StorageConnection`]; a
//! connection is never shared between two of them.
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`sqlite::SqliteStorage`] | SQLite file via sqlx, lazy schema creation |
//! | [`memory::MemoryStorage`] | Records statements in memory, for tests and dry runs |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::models::Statement;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Who a connection is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Persistence worker `n`.
    Worker(usize),
    /// Parser task or caller writing inline.
    Synchronous,
    /// Plugin activation.
    Plugin,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Worker(n) => write!(f, "worker-{}", n),
            ConnectionRole::Synchronous => f.write_str("synchronous"),
            ConnectionRole::Plugin => f.write_str("plugin"),
        }
    }
}

/// Connection factory. Schema creation happens lazily on first connect.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn StorageConnection>>;
}

/// An exclusive connection.
#[async_trait]
pub trait StorageConnection: Send {
    /// Execute a write statement and return the number of rows affected.
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    async fn close(self: Box<Self>) -> Result<()>;
}
