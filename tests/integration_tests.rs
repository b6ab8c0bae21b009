//! Live tests for the gateway against a real SQL Server.
//!
//! These tests support two modes:
//! 1. **Testcontainers** (default): Automatically spins up SQL Server containers
//! 2. **External server**: Connect to existing server via MSSQL_HOST env var
//!
//! ## Running with testcontainers (requires Docker):
//! ```bash
//! cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Running against external server:
//! ```bash
//! MSSQL_HOST=localhost MSSQL_PORT=1433 MSSQL_PASSWORD='yourPass' \
//!   cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! Note: SQL Server container requires ~2GB RAM and takes 30-60 seconds to start.

use mssql_agent_gateway::config::{ConnectionConfig, SessionSettings};
use mssql_agent_gateway::database::SqlValue;
use mssql_agent_gateway::state::LifecycleState;
use mssql_agent_gateway::tools::SqlToolBridge;
use mssql_agent_gateway::ConnectionManager;
use serde_json::{json, Value};
use serial_test::serial;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mssql_server::MssqlServer;

/// Default SA password for testcontainers.
const DEFAULT_SA_PASSWORD: &str = "yourStrong(!)Password";

/// Image tag used unless `MSSQL_TEST_VERSION` says otherwise.
const DEFAULT_VERSION: &str = "2022-latest";

/// Database the tests create their tables in.
const TEST_DATABASE: &str = "gateway_test";

fn use_external_server() -> bool {
    std::env::var("MSSQL_HOST").is_ok()
}

#[allow(dead_code)] // Variants held for lifetime management (Drop trait)
enum TestDatabaseSource {
    External,
    Container(Box<ContainerAsync<MssqlServer>>),
}

/// A SQL Server to run the gateway against.
struct TestDatabase {
    #[allow(dead_code)] // Held for lifetime management (Drop trait on Container)
    source: TestDatabaseSource,
    host: String,
    port: u16,
    password: String,
}

impl TestDatabase {
    async fn new() -> Self {
        if use_external_server() {
            Self::from_external()
        } else {
            let version = std::env::var("MSSQL_TEST_VERSION")
                .unwrap_or_else(|_| DEFAULT_VERSION.to_string());
            Self::from_testcontainer(&version).await
        }
    }

    fn from_external() -> Self {
        let host = std::env::var("MSSQL_HOST").expect("MSSQL_HOST must be set");
        let port = std::env::var("MSSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1433);
        let password =
            std::env::var("MSSQL_PASSWORD").unwrap_or_else(|_| DEFAULT_SA_PASSWORD.to_string());

        eprintln!("Using external SQL Server at {}:{}", host, port);
        Self {
            source: TestDatabaseSource::External,
            host,
            port,
            password,
        }
    }

    async fn from_testcontainer(version: &str) -> Self {
        eprintln!("Starting SQL Server {} container via testcontainers...", version);

        let container = MssqlServer::default()
            .with_accept_eula()
            .with_tag(version)
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start SQL Server {} container: {}", version, e));

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(1433)
            .await
            .expect("Failed to get port");

        // Wait a bit for SQL Server to fully initialize
        tokio::time::sleep(Duration::from_secs(5)).await;

        Self {
            source: TestDatabaseSource::Container(Box::new(container)),
            host: host.to_string(),
            port,
            password: DEFAULT_SA_PASSWORD.to_string(),
        }
    }

    fn config(&self, database: &str) -> ConnectionConfig {
        serde_json::from_value(json!({
            "server": self.host,
            "port": self.port,
            "database": database,
            "user": "sa",
            "password": self.password,
            "encrypt": true,
            "trustServerCertificate": true
        }))
        .expect("valid connection config")
    }

    /// Create the test database with two related tables, then return a
    /// manager connected to it.
    async fn seeded(&self) -> ConnectionManager {
        let manager = ConnectionManager::with_tds(SessionSettings::default());
        let response = manager.connect(self.config("master")).await;
        assert!(response.success, "{}", response.message);

        let result = manager
            .execute(&format!(
                "IF DB_ID('{0}') IS NULL CREATE DATABASE {0}",
                TEST_DATABASE
            ))
            .await;
        assert!(result.is_success(), "{:?}", result.error());

        let response = manager.connect(self.config(TEST_DATABASE)).await;
        assert!(response.success, "{}", response.message);

        for sql in [
            "IF OBJECT_ID('dbo.orders') IS NOT NULL DROP TABLE dbo.orders",
            "IF OBJECT_ID('dbo.customers') IS NOT NULL DROP TABLE dbo.customers",
            "CREATE TABLE dbo.customers (
                id INT PRIMARY KEY,
                name NVARCHAR(100) NOT NULL,
                notes NVARCHAR(MAX) NULL
            )",
            "CREATE TABLE dbo.orders (
                id INT IDENTITY(1,1) PRIMARY KEY,
                customer_id INT NOT NULL REFERENCES dbo.customers(id),
                total DECIMAL(10,2) NOT NULL DEFAULT 0,
                placed_at DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME()
            )",
        ] {
            let result = manager.execute(sql).await;
            assert!(result.is_success(), "{}: {:?}", sql, result.error());
        }

        // reconnect so the schema document sees the new tables
        let response = manager.connect(self.config(TEST_DATABASE)).await;
        assert!(response.success, "{}", response.message);
        manager
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_connect_and_status() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());

        let outcome = manager.test_connection(&db.config("master")).await;
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(manager.state().await, LifecycleState::Disconnected);

        let response = manager.connect(db.config("master")).await;
        assert!(response.success, "{}", response.message);
        assert!(response.schema.unwrap().starts_with("Database Schema"));

        let status = manager.status().await;
        assert!(status.connected);
        assert_eq!(status.database.as_deref(), Some("master"));
        assert_eq!(status.server.as_deref(), Some(db.host.as_str()));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_wrong_password_fails_test() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());

        let mut config = db.config("master");
        config.password = "not the password".to_string();

        let response = manager.connect(config).await;
        assert!(!response.success);
        assert!(response.message.starts_with("Connection test failed:"));
        assert!(response.message.contains("Login failed"));
        assert_eq!(manager.state().await, LifecycleState::Disconnected);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_schema_lists_every_table_once() {
        let db = TestDatabase::new().await;
        let manager = db.seeded().await;

        let schema = manager.schema().await.expect("connected");
        let text = schema.as_str();
        assert_eq!(text.matches("Table: dbo.customers").count(), 1);
        assert_eq!(text.matches("Table: dbo.orders").count(), 1);
        assert!(text.contains("notes: nvarchar(MAX) NULLABLE"));
        assert!(text.contains("FK -> dbo.customers(id)"));
        assert!(text.contains("Total tables: 2"));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_disconnect_twice_then_execute() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());
        assert!(manager.connect(db.config("master")).await.success);

        assert!(manager.disconnect().await.success);
        let second = manager.disconnect().await;
        assert!(second.success);
        assert_eq!(second.message, "No active database connection");

        let result = manager.execute("SELECT 1 as test").await;
        assert!(result.error().unwrap().contains("not initialized"));
    }
}

// =============================================================================
// Query Tests
// =============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_select_one_through_tool() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());
        assert!(manager.connect(db.config("master")).await.success);

        let bridge = SqlToolBridge::new(manager);
        let envelope = bridge.invoke(&json!({"sql": "SELECT 1 as test"})).await;
        let json: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(json["data"], json!([{"test": 1}]));
        assert_eq!(json["rowsAffected"], 1);
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_syntax_error_keeps_session() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());
        assert!(manager.connect(db.config("master")).await.success);

        let result = manager.execute("SELEC * FROM x").await;
        assert!(!result.is_success());
        assert!(!result.error().unwrap().contains("not initialized"));

        assert!(manager.status().await.connected);
        assert!(manager.execute("SELECT 1 as test").await.is_success());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_modifications_report_rows_affected() {
        let db = TestDatabase::new().await;
        let manager = db.seeded().await;

        let result = manager
            .execute("INSERT INTO dbo.customers (id, name) VALUES (1, N'Alice'), (2, N'Bob')")
            .await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.rows_affected(), 2);

        let result = manager
            .execute("INSERT INTO dbo.orders (customer_id, total) OUTPUT INSERTED.id VALUES (1, 10.50)")
            .await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.rows().len(), 1);

        let result = manager
            .execute("UPDATE dbo.customers SET notes = N'vip' WHERE id = 1")
            .await;
        assert_eq!(result.rows_affected(), 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_prefixed_and_mixed_batches() {
        let db = TestDatabase::new().await;
        let manager = db.seeded().await;

        let result = manager
            .execute("INSERT INTO dbo.customers (id, name) VALUES (1, N'Output Logistics'), (2, N'Bob'), (3, N'Cy')")
            .await;
        assert_eq!(result.rows_affected(), 3);

        let result = manager
            .execute("UPDATE dbo.customers SET notes = 'Output pending' WHERE name <> N'Cy'")
            .await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.rows_affected(), 2);

        let result = manager
            .execute("SET NOCOUNT OFF; UPDATE dbo.customers SET notes = NULL WHERE id = 3")
            .await;
        assert_eq!(result.rows_affected(), 1);

        let result = manager
            .execute(
                "WITH gone AS (SELECT id FROM dbo.customers WHERE notes IS NOT NULL) \
                 DELETE FROM dbo.customers WHERE id IN (SELECT id FROM gone)",
            )
            .await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.rows_affected(), 2);

        let result = manager
            .execute("UPDATE dbo.customers SET notes = N'last'; SELECT id, notes FROM dbo.customers")
            .await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.rows().len(), 1);
        assert_eq!(result.rows()[0].get("notes").unwrap().as_str(), Some("last"));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_value_mapping() {
        let db = TestDatabase::new().await;
        let manager = ConnectionManager::with_tds(SessionSettings::default());
        assert!(manager.connect(db.config("master")).await.success);

        let result = manager
            .execute(
                "SELECT CAST(12.34 AS DECIMAL(10,2)) AS amount, NULL AS missing, \
                 CAST(1 AS BIT) AS flag, N'héllo' AS greeting, \
                 CAST('6F9619FF-8B86-D011-B42D-00C04FC964FF' AS UNIQUEIDENTIFIER) AS id",
            )
            .await;
        assert!(result.is_success(), "{:?}", result.error());

        let row = &result.rows()[0];
        assert_eq!(row.get("amount").unwrap().to_display_string(), "12.34");
        assert!(row.get("missing").unwrap().is_null());
        assert_eq!(row.get("flag"), Some(&SqlValue::Bool(true)));
        assert_eq!(row.get("greeting").unwrap().as_str(), Some("héllo"));
        assert!(matches!(row.get("id"), Some(SqlValue::Uuid(_))));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_statement_timeout() {
        let db = TestDatabase::new().await;
        let settings = SessionSettings {
            query_timeout: Duration::from_secs(1),
            max_connections: 1,
            ..SessionSettings::default()
        };
        let manager = ConnectionManager::with_tds(settings);
        assert!(manager.connect(db.config("master")).await.success);

        let result = manager.execute("WAITFOR DELAY '00:00:05'").await;
        assert!(!result.is_success());
        assert!(result.error().unwrap().contains("timeout"));

        // The abandoned connection must not be handed out again.
        for _ in 0..3 {
            let started = std::time::Instant::now();
            let result = manager.execute("SELECT 1 AS ok").await;
            assert!(result.is_success(), "{:?}", result.error());
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }
}
