//! SQL Server driver: tiberius connections pooled with bb8.

use crate::config::ConnectionConfig;
use crate::constants::APPLICATION_NAME;
use crate::database::driver::{Connector, FaultSignal, PoolOptions, SqlPool, StatementOutput};
use crate::database::query::{ResultRow, StatementKind};
use crate::database::types::TypeMapper;
use crate::error::ServerError;
use async_trait::async_trait;
use bb8::{ErrorSink, ManageConnection, Pool};
use parking_lot::RwLock;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

/// Type alias for a raw tiberius connection.
type RawConnection = Client<Compat<TcpStream>>;

/// Create a tiberius Config from a connection config.
pub fn build_tiberius_config(config: &ConnectionConfig) -> Config {
    let mut tib = Config::new();

    tib.host(&config.server);
    tib.port(config.port);
    tib.database(&config.database);
    tib.authentication(AuthMethod::sql_server(&config.user, &config.password));

    if config.encrypt {
        tib.encryption(EncryptionLevel::Required);
    } else {
        tib.encryption(EncryptionLevel::Off);
    }

    if config.trust_server_certificate {
        tib.trust_cert();
    }

    tib.application_name(APPLICATION_NAME);
    tib
}

/// Opens bb8 pools of tiberius connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TdsConnector;

impl TdsConnector {
    pub fn new() -> Self {
        Self
    }

    /// Establish one raw connection so a bad host or login surfaces its real
    /// error instead of a pool acquire timeout.
    async fn probe(
        config: &ConnectionConfig,
        options: PoolOptions,
    ) -> Result<RawConnection, ServerError> {
        let address = config.address();
        debug!("Probing {}", address);

        let connect = async {
            let tcp = TcpStream::connect(&address).await.map_err(|e| {
                ServerError::connection(format!("Failed to connect to {}: {}", address, e))
            })?;
            tcp.set_nodelay(true).map_err(|e| {
                ServerError::connection(format!("Failed to set TCP_NODELAY: {}", e))
            })?;

            let client = Client::connect(build_tiberius_config(config), tcp.compat_write()).await?;
            Ok::<_, ServerError>(client)
        };

        match tokio::time::timeout(options.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::connection(format!(
                "Failed to connect to {}: timed out after {} seconds",
                address,
                options.connect_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl Connector for TdsConnector {
    async fn open(
        &self,
        config: &ConnectionConfig,
        options: PoolOptions,
    ) -> Result<Arc<dyn SqlPool>, ServerError> {
        info!(
            "Creating connection pool for {} (database: {}, max: {})",
            config.address(),
            config.database,
            options.max_connections
        );

        drop(Self::probe(config, options).await?);

        let faults = FaultSignal::new();
        let manager = TdsManager::new(build_tiberius_config(config));
        let pool = Pool::builder()
            .max_size(options.max_connections)
            .connection_timeout(options.connect_timeout)
            .test_on_check_out(true)
            .error_sink(Box::new(FaultSink {
                faults: faults.clone(),
            }))
            .build_unchecked(manager);

        info!("Connection pool created successfully");
        Ok(Arc::new(TdsPool {
            pool: RwLock::new(Some(pool)),
            faults,
        }))
    }
}

/// Routes background pool errors to the fault signal.
#[derive(Debug, Clone)]
struct FaultSink {
    faults: FaultSignal,
}

impl ErrorSink<bb8_tiberius::Error> for FaultSink {
    fn sink(&self, error: bb8_tiberius::Error) {
        let error = ServerError::from(error);
        if error.is_connection_lost() {
            warn!("Pool connection lost: {}", error);
            self.faults.raise(error.to_string());
        } else {
            warn!("Pool error: {}", error);
        }
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<bb8_tiberius::Error>> {
        Box::new(self.clone())
    }
}

/// Pooled connection that remembers whether a statement is still running.
///
/// A statement future dropped by the timeout leaves its response unread on
/// the wire; the pool must discard such a connection rather than reuse it.
#[derive(Debug)]
pub struct Tracked<C> {
    conn: C,
    in_flight: bool,
}

impl<C> Tracked<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            in_flight: false,
        }
    }

    /// Mark a statement as started and hand out the connection for it.
    pub fn begin(&mut self) -> &mut C {
        self.in_flight = true;
        &mut self.conn
    }

    /// Mark the running statement as fully read.
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

type InnerManager = bb8_tiberius::ConnectionManager;
type PooledClient = <InnerManager as ManageConnection>::Connection;

/// bb8 manager that drops connections abandoned mid-statement.
pub struct TdsManager {
    inner: InnerManager,
}

impl TdsManager {
    pub fn new(config: Config) -> Self {
        Self {
            inner: InnerManager::new(config),
        }
    }
}

#[async_trait]
impl ManageConnection for TdsManager {
    type Connection = Tracked<PooledClient>;
    type Error = bb8_tiberius::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Ok(Tracked::new(self.inner.connect().await?))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.inner.is_valid(&mut conn.conn).await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        if conn.in_flight {
            debug!("Discarding connection abandoned mid-statement");
            return true;
        }
        self.inner.has_broken(&mut conn.conn)
    }
}

/// A bb8 pool of tiberius connections to one database.
pub struct TdsPool {
    pool: RwLock<Option<Pool<TdsManager>>>,
    faults: FaultSignal,
}

impl TdsPool {
    async fn run_on(pool: &Pool<TdsManager>, sql: &str) -> Result<StatementOutput, ServerError> {
        let mut conn = pool.get().await?;

        let result = Self::run_statement(conn.begin(), sql).await;
        // Skipped when the timeout drops this future mid-statement.
        conn.finish();
        result
    }

    async fn run_statement(
        client: &mut PooledClient,
        sql: &str,
    ) -> Result<StatementOutput, ServerError> {
        match StatementKind::classify(sql) {
            StatementKind::Modification => {
                let result = client.execute(sql, &[]).await?;
                Ok(StatementOutput::affected(
                    result.rows_affected().iter().sum(),
                ))
            }
            StatementKind::Rows | StatementKind::BatchDdl => {
                let rows = client.simple_query(sql).await?.into_first_result().await?;
                Ok(StatementOutput::rows(rows.iter().map(to_result_row).collect()))
            }
        }
    }
}

#[async_trait]
impl SqlPool for TdsPool {
    async fn run(&self, sql: &str) -> Result<StatementOutput, ServerError> {
        // bb8 pools are cheap handles; clone out so no lock is held across I/O.
        let pool = self.pool.read().clone().ok_or(ServerError::NotInitialized)?;

        let result = Self::run_on(&pool, sql).await;
        if let Err(e) = &result {
            if e.is_connection_lost() {
                warn!("Connection lost while running statement: {}", e);
                self.faults.raise(e.to_string());
            }
        }
        result
    }

    async fn close(&self) -> Result<(), ServerError> {
        // Dropping the last handle closes idle connections; checked-out ones
        // close when returned.
        if self.pool.write().take().is_some() {
            debug!("Connection pool closed");
        }
        Ok(())
    }

    fn faults(&self) -> FaultSignal {
        self.faults.clone()
    }
}

fn to_result_row(row: &Row) -> ResultRow {
    let mut out = ResultRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name(), TypeMapper::extract_column(row, idx));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            server: "localhost".to_string(),
            database: "master".to_string(),
            user: "sa".to_string(),
            password: "test".to_string(),
            port: 14333,
            encrypt: false,
            trust_server_certificate: true,
        }
    }

    #[test]
    fn test_build_tiberius_config_address() {
        let tib = build_tiberius_config(&test_config());
        assert_eq!(tib.get_addr(), "localhost:14333");
    }

    #[tokio::test]
    async fn test_tracked_connection_stays_in_flight_when_abandoned() {
        let mut tracked = Tracked::new(0u8);

        *tracked.begin() += 1;
        tracked.finish();
        assert!(!tracked.is_in_flight());

        let abandoned = tokio::time::timeout(std::time::Duration::from_millis(10), async {
            let conn = tracked.begin();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            *conn += 1;
        })
        .await;
        assert!(abandoned.is_err());
        assert!(tracked.is_in_flight());
    }

    #[tokio::test]
    async fn test_open_unreachable_server_fails_fast() {
        let mut config = test_config();
        // TEST-NET-1, never routable
        config.server = "192.0.2.1".to_string();
        config.port = 1433;

        let options = PoolOptions {
            max_connections: 1,
            connect_timeout: std::time::Duration::from_millis(200),
        };
        let err = match TdsConnector::new().open(&config, options).await {
            Ok(_) => panic!("expected connection failure"),
            Err(e) => e,
        };
        assert!(err.is_connection_lost());
        assert!(err.to_string().contains("192.0.2.1:1433"));
    }
}
