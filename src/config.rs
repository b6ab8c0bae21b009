//! Configuration management for the gateway.
//!
//! Configuration is loaded from environment variables following the 12-factor app pattern.
//! Connection configs can also arrive at runtime as JSON through the connect operation.

use crate::constants::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_PORT, DEFAULT_QUERY_TIMEOUT, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_TEST_TIMEOUT,
    DEFAULT_TEST_TIMEOUT_SECS,
};
use crate::error::ServerError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection to open at startup, if `MSSQL_HOST` is set
    pub startup_connection: Option<ConnectionConfig>,

    /// Pool and timeout settings for every session
    pub session: SessionSettings,

    /// Opaque credentials for the external reasoning engine
    pub agent: AgentConfig,
}

/// Database connection configuration.
///
/// Immutable once accepted; a reconnect replaces it wholesale.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// SQL Server hostname or IP address
    pub server: String,

    /// Database name
    pub database: String,

    /// SQL Server login
    pub user: String,

    /// SQL Server password
    #[serde(skip_serializing)]
    pub password: String,

    /// SQL Server port (default: 1433)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable TLS encryption (default: true)
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,

    /// Trust server certificate (for self-signed certs)
    #[serde(default)]
    pub trust_server_certificate: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_encrypt() -> bool {
    true
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .finish()
    }
}

impl ConnectionConfig {
    /// Reject configs that cannot possibly connect before any network I/O.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server.trim().is_empty() {
            return Err(ServerError::config("server is required"));
        }
        if self.database.trim().is_empty() {
            return Err(ServerError::config("database is required"));
        }
        if self.user.trim().is_empty() {
            return Err(ServerError::config("user is required"));
        }
        if self.port == 0 {
            return Err(ServerError::config("port must be non-zero"));
        }
        Ok(())
    }

    /// `host:port` form used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Pool and timeout settings applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Maximum number of connections in the session pool
    pub max_connections: u32,

    /// Connect timeout for the throwaway test pool
    pub test_timeout: Duration,

    /// Connect timeout for the session pool
    pub connection_timeout: Duration,

    /// Statement timeout
    pub query_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Credentials for the external reasoning engine.
///
/// The gateway never interprets these; they are handed to whichever
/// `AgentLoop` implementation drives the conversation.
#[derive(Clone, Default)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Startup connection (all optional; `MSSQL_HOST` enables it)
    /// - `MSSQL_HOST`: SQL Server hostname
    /// - `MSSQL_DATABASE`: Database name (required when `MSSQL_HOST` is set)
    /// - `MSSQL_USER` / `MSSQL_PASSWORD`: SQL Server login
    /// - `MSSQL_PORT`: Port number (default: 1433)
    /// - `MSSQL_ENCRYPT`: Enable TLS (default: true)
    /// - `MSSQL_TRUST_CERT`: Trust server certificate (default: false)
    ///
    /// ## Session settings
    /// - `MSSQL_POOL_MAX`: Maximum pool connections (default: 10)
    /// - `MSSQL_TEST_TIMEOUT`: Connection test timeout in seconds (default: 10)
    /// - `MSSQL_CONNECT_TIMEOUT`: Connect timeout in seconds (default: 15)
    /// - `MSSQL_QUERY_TIMEOUT`: Statement timeout in seconds (default: 30)
    ///
    /// ## Agent
    /// - `AGENT_API_KEY`, `AGENT_ENDPOINT`, `AGENT_PROJECT_ID`, `AGENT_MODEL`
    /// - `AGENT_TEMPERATURE` (default: 0.1)
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let startup_connection = match lookup("MSSQL_HOST") {
            Some(server) => {
                let database = lookup("MSSQL_DATABASE").ok_or_else(|| {
                    ServerError::config("MSSQL_DATABASE is required when MSSQL_HOST is set")
                })?;

                let (user, password) = match (lookup("MSSQL_USER"), lookup("MSSQL_PASSWORD")) {
                    (Some(u), Some(p)) => (u, p),
                    (Some(_), None) => {
                        return Err(ServerError::config(
                            "MSSQL_PASSWORD is required when MSSQL_USER is set",
                        ))
                    }
                    (None, _) => {
                        return Err(ServerError::config(
                            "Authentication required: set MSSQL_USER and MSSQL_PASSWORD",
                        ))
                    }
                };

                let port = match lookup("MSSQL_PORT") {
                    Some(p) => p
                        .parse()
                        .map_err(|_| ServerError::config(format!("Invalid MSSQL_PORT: {}", p)))?,
                    None => DEFAULT_PORT,
                };

                let encrypt = lookup("MSSQL_ENCRYPT").map(|v| parse_flag(&v)).unwrap_or(true);
                let trust_server_certificate = lookup("MSSQL_TRUST_CERT")
                    .map(|v| parse_flag(&v))
                    .unwrap_or(false);

                let config = ConnectionConfig {
                    server,
                    database,
                    user,
                    password,
                    port,
                    encrypt,
                    trust_server_certificate,
                };
                config.validate()?;
                Some(config)
            }
            None => None,
        };

        let max_connections = lookup("MSSQL_POOL_MAX")
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let test_timeout_secs = lookup("MSSQL_TEST_TIMEOUT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_TEST_TIMEOUT_SECS);

        let connection_timeout_secs = lookup("MSSQL_CONNECT_TIMEOUT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);

        let query_timeout_secs = lookup("MSSQL_QUERY_TIMEOUT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);

        let agent = AgentConfig {
            api_key: lookup("AGENT_API_KEY"),
            endpoint: lookup("AGENT_ENDPOINT").map(|e| e.trim().to_string()),
            project_id: lookup("AGENT_PROJECT_ID"),
            model: lookup("AGENT_MODEL"),
            temperature: lookup("AGENT_TEMPERATURE")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0.1),
        };

        Ok(Config {
            startup_connection,
            session: SessionSettings {
                max_connections,
                test_timeout: Duration::from_secs(test_timeout_secs),
                connection_timeout: Duration::from_secs(connection_timeout_secs),
                query_timeout: Duration::from_secs(query_timeout_secs),
            },
            agent,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
