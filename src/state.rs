//! Session state: the single active connection and its lifecycle.
//!
//! `Session` only enforces which transitions are legal; the I/O around them
//! (testing, opening and closing pools) lives in the lifecycle manager.

use crate::config::ConnectionConfig;
use crate::database::{SchemaDocument, SqlPool};
use crate::error::ServerError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Lifecycle of the session.
///
/// ```text
/// Disconnected --begin_test--> Testing --complete--> Connected
///      ^                          |                      |
///      +--------abort-------------+                      |
///      +--------clear / evict----------------------------+
/// ```
///
/// `begin_test` from `Connected` hands back the previous session so its pool
/// can be closed before the new one is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Disconnected,
    Testing,
    Connected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Testing => "testing",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// A live connection: its pool, the config it was opened with and the schema
/// captured at connect time.
///
/// Dropping it stops the task watching the pool for faults.
pub struct ActiveSession {
    generation: u64,
    pool: Arc<dyn SqlPool>,
    config: ConnectionConfig,
    schema: SchemaDocument,
    watcher: Option<AbortHandle>,
}

impl ActiveSession {
    pub fn new(
        generation: u64,
        pool: Arc<dyn SqlPool>,
        config: ConnectionConfig,
        schema: SchemaDocument,
    ) -> Self {
        Self {
            generation,
            pool,
            config,
            schema,
            watcher: None,
        }
    }

    /// Attach the fault watcher task to this session's lifetime.
    pub fn with_watcher(mut self, watcher: AbortHandle) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Detach the fault watcher so dropping the session leaves it running.
    pub fn disarm_watcher(&mut self) {
        self.watcher = None;
    }

    /// Distinguishes this session from earlier ones opened with the same config.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &Arc<dyn SqlPool> {
        &self.pool
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaDocument {
        &self.schema
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("generation", &self.generation)
            .field("config", &self.config)
            .field("tables", &self.schema.table_count())
            .finish_non_exhaustive()
    }
}

/// The single session record.
///
/// Invariant: `active` is `Some` exactly when `state` is `Connected`, so a
/// schema document exists iff the session is connected.
#[derive(Debug)]
pub struct Session {
    state: LifecycleState,
    active: Option<ActiveSession>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// An empty, disconnected session.
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Disconnected,
            active: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LifecycleState::Connected
    }

    /// The active session, if connected.
    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    /// The active session, or the "not initialized" error.
    pub fn require_active(&self) -> Result<&ActiveSession, ServerError> {
        self.active.as_ref().ok_or(ServerError::NotInitialized)
    }

    /// Enter `Testing`, returning the session being replaced.
    ///
    /// Allowed from every state: a `Testing` left behind by an abandoned
    /// connect is simply restarted.
    pub fn begin_test(&mut self) -> Option<ActiveSession> {
        self.state = LifecycleState::Testing;
        self.active.take()
    }

    /// `Testing -> Connected`.
    pub fn complete(&mut self, active: ActiveSession) -> Result<(), ServerError> {
        if self.state != LifecycleState::Testing {
            return Err(ServerError::internal(format!(
                "cannot complete a connect from the {} state",
                self.state
            )));
        }
        self.state = LifecycleState::Connected;
        self.active = Some(active);
        Ok(())
    }

    /// `Testing -> Disconnected` after a failed test, open or introspection.
    pub fn abort(&mut self) {
        if self.state == LifecycleState::Testing {
            self.state = LifecycleState::Disconnected;
        }
    }

    /// `Connected -> Disconnected`, returning the session to close.
    /// A no-op on a session that is not connected.
    pub fn clear(&mut self) -> Option<ActiveSession> {
        if self.state == LifecycleState::Connected {
            self.state = LifecycleState::Disconnected;
        }
        self.active.take()
    }

    /// Clear the session only if it is still the given generation.
    pub fn evict(&mut self, generation: u64) -> Option<ActiveSession> {
        match &self.active {
            Some(active) if active.generation == generation => self.clear(),
            _ => None,
        }
    }
}
