//! Driver seams between the session gateway and a concrete SQL Server client.
//!
//! The lifecycle manager only ever talks to a [`Connector`] (opens pools) and
//! the [`SqlPool`] handles it returns. The production implementation lives in
//! `connection.rs`; tests plug in an in-memory driver.

use crate::config::ConnectionConfig;
use crate::database::query::ResultRow;
use crate::error::ServerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Settings for a single pool open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound on concurrently open connections.
    pub max_connections: u32,

    /// How long establishing a connection may take.
    pub connect_timeout: Duration,
}

/// Raw output of one statement, before it is wrapped into a `QueryResult`.
#[derive(Debug, Clone, Default)]
pub struct StatementOutput {
    /// Rows of the first result set, columns in server order.
    pub rows: Vec<ResultRow>,

    /// Rows affected as reported by the server, if it reported any.
    pub rows_affected: Option<u64>,
}

impl StatementOutput {
    /// Output of a row-returning statement.
    pub fn rows(rows: Vec<ResultRow>) -> Self {
        Self {
            rows,
            rows_affected: None,
        }
    }

    /// Output of a statement that only reports an affected-row count.
    pub fn affected(count: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected: Some(count),
        }
    }
}

/// Opens connection pools.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a pool and prove it can hand out at least one connection.
    async fn open(
        &self,
        config: &ConnectionConfig,
        options: PoolOptions,
    ) -> Result<Arc<dyn SqlPool>, ServerError>;
}

/// A live pool of connections to one database.
#[async_trait]
pub trait SqlPool: Send + Sync {
    /// Run one SQL batch on a pooled connection.
    async fn run(&self, sql: &str) -> Result<StatementOutput, ServerError>;

    /// Close the pool. Later `run` calls fail.
    async fn close(&self) -> Result<(), ServerError>;

    /// Signal raised when the pool hits an unrecoverable error on its own.
    fn faults(&self) -> FaultSignal;
}

/// One-shot signal a pool raises when its connections are gone for good.
///
/// Cloning shares the signal. Raising is idempotent: the first reason wins.
#[derive(Debug, Clone)]
pub struct FaultSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for FaultSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultSignal {
    /// Create an un-raised signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Returns `false` if it was already raised.
    pub fn raise(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }

    /// Whether the signal has been raised.
    pub fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The reason given when the signal was raised.
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Wait until the signal is raised and return its reason.
    pub async fn raised(&self) -> String {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close while we wait.
            Err(_) => String::new(),
        };
        reason
    }
}
