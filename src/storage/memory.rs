//! In-memory storage backend.
//!
//! Records every executed statement together with the role of the
//! connection that ran it. Useful for tests and for dry runs where nothing
//! should touch disk.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ConnectionRole, Storage, StorageConnection};
use crate::models::Statement;

/// A statement as it was executed.
#[derive(Debug, Clone)]
pub struct ExecutedStatement {
    pub role: ConnectionRole,
    pub statement: Statement,
}

#[derive(Default)]
struct Shared {
    executed: Mutex<Vec<ExecutedStatement>>,
    opened: Mutex<Vec<ConnectionRole>>,
    closed: Mutex<Vec<ConnectionRole>>,
    failures: AtomicUsize,
}

/// Storage that keeps executed statements in a vector.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
    fail_marker: Option<String>,
    latency: Option<Duration>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement whose SQL contains `marker`.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    /// Sleep this long inside every execute.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.shared.executed.lock().clone()
    }

    /// Executed statements whose SQL starts with `prefix`.
    pub fn executed_matching(&self, prefix: &str) -> Vec<ExecutedStatement> {
        self.shared
            .executed
            .lock()
            .iter()
            .filter(|e| e.statement.sql.trim_start().starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn opened(&self) -> Vec<ConnectionRole> {
        self.shared.opened.lock().clone()
    }

    pub fn closed(&self) -> Vec<ConnectionRole> {
        self.shared.closed.lock().clone()
    }

    pub fn failures(&self) -> usize {
        self.shared.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn StorageConnection>> {
        self.shared.opened.lock().push(role);
        Ok(Box::new(MemoryConnection {
            role,
            storage: self.clone(),
        }))
    }
}

struct MemoryConnection {
    role: ConnectionRole,
    storage: MemoryStorage,
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        if let Some(latency) = self.storage.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(marker) = &self.storage.fail_marker {
            if statement.sql.contains(marker.as_str()) {
                self.storage.shared.failures.fetch_add(1, Ordering::SeqCst);
                bail!("statement rejected by marker '{}'", marker);
            }
        }
        self.storage.shared.executed.lock().push(ExecutedStatement {
            role: self.role,
            statement: statement.clone(),
        });
        Ok(1)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.storage.shared.closed.lock().push(self.role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_role_and_statement() {
        let storage = MemoryStorage::new();
        let mut conn = storage.connect(ConnectionRole::Worker(2)).await.unwrap();
        conn.execute(&Statement::new("INSERT INTO t VALUES (?)").bind(1i64))
            .await
            .unwrap();
        conn.close().await.unwrap();

        let executed = storage.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].role, ConnectionRole::Worker(2));
        assert_eq!(storage.closed(), vec![ConnectionRole::Worker(2)]);
    }

    #[tokio::test]
    async fn marker_fails_matching_statements() {
        let storage = MemoryStorage::new().failing_on("poison");
        let mut conn = storage.connect(ConnectionRole::Synchronous).await.unwrap();
        assert!(conn.execute(&Statement::new("INSERT poison")).await.is_err());
        assert!(conn.execute(&Statement::new("INSERT fine")).await.is_ok());
        assert_eq!(storage.failures(), 1);
        assert_eq!(storage.executed_matching("INSERT").len(), 1);
    }
}
