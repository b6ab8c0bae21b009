//! Connection lifecycle manager.
//!
//! Owns the single [`Session`] and drives every transition on it. Transitions
//! (connect, disconnect, fault eviction) are serialized by one async mutex and
//! take the session write lock only briefly; statement execution holds the read
//! lock for its whole duration, so a pool is never closed under a running
//! statement.

use crate::config::{ConnectionConfig, SessionSettings};
use crate::constants::{LIVENESS_QUERY, TEST_POOL_MAX_CONNECTIONS};
use crate::database::{
    Connector, FaultSignal, PoolOptions, QueryExecutor, QueryResult, SchemaDocument,
    SchemaIntrospector, TdsConnector,
};
use crate::error::ServerError;
use crate::state::{ActiveSession, LifecycleState, Session};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Result of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub ok: bool,
    pub message: String,
}

/// Reply to a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Reply to a disconnect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
    pub message: String,
}

/// Connection status, read from the session only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// Handle to the gateway's single database session.
///
/// Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    executor: QueryExecutor,
    session: RwLock<Session>,
    transition: Mutex<()>,
    generation: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager over an arbitrary driver.
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings) -> Self {
        let executor = QueryExecutor::new(settings.query_timeout);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                executor,
                session: RwLock::new(Session::new()),
                transition: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create a manager over the SQL Server driver.
    pub fn with_tds(settings: SessionSettings) -> Self {
        Self::new(Arc::new(TdsConnector::new()), settings)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.session.read().await.state()
    }

    /// Test a config on a throwaway single-connection pool. Never touches the
    /// session.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> TestOutcome {
        match self.run_test(config).await {
            Ok(()) => TestOutcome {
                ok: true,
                message: "Connection successful".to_string(),
            },
            Err(e) => TestOutcome {
                ok: false,
                message: e.to_string(),
            },
        }
    }

    async fn run_test(&self, config: &ConnectionConfig) -> Result<(), ServerError> {
        config.validate()?;

        let options = PoolOptions {
            max_connections: TEST_POOL_MAX_CONNECTIONS,
            connect_timeout: self.inner.settings.test_timeout,
        };
        let pool = self.inner.connector.open(config, options).await?;
        let result = self
            .inner
            .executor
            .run(pool.as_ref(), LIVENESS_QUERY)
            .await;

        if let Err(e) = pool.close().await {
            warn!("Failed to close test pool: {}", e);
        }

        result.map(|_| ())
    }

    /// Connect, replacing any existing session. All-or-nothing.
    pub async fn connect(&self, config: ConnectionConfig) -> ConnectResponse {
        let server = config.server.clone();
        let database = config.database.clone();

        match self.try_connect(config).await {
            Ok(schema) => ConnectResponse {
                success: true,
                message: format!(
                    "Successfully connected to database \"{}\" on server \"{}\"",
                    database, server
                ),
                schema: Some(schema.to_string()),
            },
            Err(e) => ConnectResponse {
                success: false,
                message: e.to_string(),
                schema: None,
            },
        }
    }

    /// Connect and return the schema document, or the connect error.
    pub async fn try_connect(
        &self,
        config: ConnectionConfig,
    ) -> Result<SchemaDocument, ServerError> {
        let _transition = self.inner.transition.lock().await;
        info!("Connecting to {} (database: {})", config.address(), config.database);

        let previous = self.inner.session.write().await.begin_test();
        if let Some(previous) = previous {
            info!("Closing previous connection before reconnecting");
            close_quietly(previous).await;
        }

        if let Err(e) = self.run_test(&config).await {
            self.inner.session.write().await.abort();
            warn!("Connection test failed: {}", e);
            return Err(ServerError::connection_test(e.to_string()));
        }

        let options = PoolOptions {
            max_connections: self.inner.settings.max_connections,
            connect_timeout: self.inner.settings.connection_timeout,
        };
        let pool = match self.inner.connector.open(&config, options).await {
            Ok(pool) => pool,
            Err(e) => {
                self.inner.session.write().await.abort();
                warn!("Failed to open connection pool: {}", e);
                return Err(ServerError::connect_failure(e.to_string()));
            }
        };

        let introspector = SchemaIntrospector::new(self.inner.executor);
        let schema = match introspector.introspect(pool.as_ref()).await {
            Ok(schema) => schema,
            Err(e) => {
                if let Err(close_err) = pool.close().await {
                    warn!("Failed to close pool after introspection: {}", close_err);
                }
                self.inner.session.write().await.abort();
                warn!("Schema introspection failed: {}", e);
                return Err(ServerError::connect_failure(e.to_string()));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let watcher =
            spawn_fault_watcher(Arc::downgrade(&self.inner), generation, pool.faults());
        let active =
            ActiveSession::new(generation, pool, config, schema.clone()).with_watcher(watcher);

        self.inner.session.write().await.complete(active)?;
        info!(
            "Connected (session {}, {} tables)",
            generation,
            schema.table_count()
        );
        Ok(schema)
    }

    /// Close the session if there is one. Idempotent.
    pub async fn disconnect(&self) -> DisconnectResponse {
        let _transition = self.inner.transition.lock().await;
        let previous = self.inner.session.write().await.clear();

        match previous {
            Some(active) => {
                let database = active.config().database.clone();
                close_quietly(active).await;
                info!("Disconnected from database {}", database);
                DisconnectResponse {
                    success: true,
                    message: format!("Disconnected from database \"{}\"", database),
                }
            }
            None => DisconnectResponse {
                success: true,
                message: "No active database connection".to_string(),
            },
        }
    }

    /// Connection status. Never touches the network.
    pub async fn status(&self) -> StatusResponse {
        let session = self.inner.session.read().await;
        match session.active().filter(|a| !a.pool().faults().is_raised()) {
            Some(active) => StatusResponse {
                connected: true,
                database: Some(active.config().database.clone()),
                server: Some(active.config().server.clone()),
            },
            None => StatusResponse {
                connected: false,
                database: None,
                server: None,
            },
        }
    }

    /// Execute one statement. Always returns a result, never an error.
    pub async fn execute(&self, sql: &str) -> QueryResult {
        let session = self.inner.session.read().await;
        let active = match session.require_active() {
            Ok(active) if !active.pool().faults().is_raised() => active,
            _ => return QueryResult::failure(ServerError::NotInitialized.to_string(), sql),
        };

        self.inner.executor.execute(active.pool().as_ref(), sql).await
    }

    /// Schema document of the active session.
    pub async fn schema(&self) -> Result<SchemaDocument, ServerError> {
        let session = self.inner.session.read().await;
        Ok(session.require_active()?.schema().clone())
    }

    /// Drop the session if it is still the given generation.
    async fn evict(&self, generation: u64, reason: &str) {
        let _transition = self.inner.transition.lock().await;
        let evicted = self.inner.session.write().await.evict(generation);

        if let Some(mut active) = evicted {
            warn!("Session {} evicted after pool fault: {}", generation, reason);
            // Running inside the watcher; aborting it now would cut the close short.
            active.disarm_watcher();
            close_quietly(active).await;
        } else {
            debug!("Ignoring fault from stale session {}", generation);
        }
    }
}

fn spawn_fault_watcher(
    inner: Weak<Inner>,
    generation: u64,
    faults: FaultSignal,
) -> tokio::task::AbortHandle {
    let handle = tokio::spawn(async move {
        let reason = faults.raised().await;
        if let Some(inner) = inner.upgrade() {
            ConnectionManager { inner }.evict(generation, &reason).await;
        }
    });
    handle.abort_handle()
}

async fn close_quietly(active: ActiveSession) {
    if let Err(e) = active.pool().close().await {
        warn!("Error closing connection pool: {}", e);
    }
}
