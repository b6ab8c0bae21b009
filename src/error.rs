//! Error types for the gateway.
//!
//! This module defines semantic error types with SQL Server error code mapping
//! for user-friendly error messages. Statement-level errors never leave the
//! executor as `Err`; they are folded into a `QueryResult::Failure`.

use thiserror::Error;

/// Domain-specific errors for the gateway.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The liveness test against a candidate configuration failed.
    #[error("Connection test failed: {0}")]
    ConnectionTest(String),

    /// Opening the session pool or bootstrapping the schema failed.
    #[error("Connection failed: {0}")]
    ConnectFailure(String),

    /// An operation needed the session but none is active.
    #[error("Database connection not initialized. Please connect to a database first.")]
    NotInitialized,

    /// Connection error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Object not found (table, view, procedure, etc.)
    #[error("{object_type} not found: {name}")]
    ObjectNotFound { object_type: String, name: String },

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Query execution error
    #[error("Query execution error: {message}")]
    QueryExecution {
        message: String,
        sql_error_code: Option<i32>,
    },

    /// Query timeout
    #[error("Query timeout: operation exceeded {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Malformed tool call
    #[error("{0}")]
    ToolInput(String),

    /// Both the full and the reduced metadata queries failed.
    #[error("Schema introspection failed: {primary}; fallback query also failed: {fallback}")]
    SchemaIntrospection { primary: String, fallback: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection test error.
    pub fn connection_test(msg: impl Into<String>) -> Self {
        Self::ConnectionTest(msg.into())
    }

    /// Create a connect failure.
    pub fn connect_failure(msg: impl Into<String>) -> Self {
        Self::ConnectFailure(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an object not found error.
    pub fn object_not_found(object_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            object_type: object_type.into(),
            name: name.into(),
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a query execution error.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: None,
        }
    }

    /// Create a query execution error with the SQL Server error number.
    pub fn query_error_with_code(msg: impl Into<String>, code: i32) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: Some(code),
        }
    }

    /// Create a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout {
            timeout_seconds: seconds,
        }
    }

    /// Create a tool input error.
    pub fn tool_input(msg: impl Into<String>) -> Self {
        Self::ToolInput(msg.into())
    }

    /// Create a schema introspection error from both failure messages.
    pub fn schema_introspection(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self::SchemaIntrospection {
            primary: primary.into(),
            fallback: fallback.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error means the underlying connection itself is gone.
    ///
    /// Pools raise their fault signal on these so the session is evicted.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check your environment variables and configuration"),
            Self::NotInitialized => Some("Connect to a database before running queries"),
            Self::Connection { .. } | Self::ConnectionTest(_) => {
                Some("Check server hostname, port, and network connectivity")
            }
            Self::Authentication(_) => Some("Verify your username and password are correct"),
            Self::ObjectNotFound { .. } => Some("Check the object name and schema"),
            Self::PermissionDenied(_) => {
                Some("Request appropriate permissions from your database administrator")
            }
            Self::Timeout { .. } => Some("Try a simpler query or add a more selective filter"),
            Self::ConstraintViolation(_) => {
                Some("Check the constraint definition and your data values")
            }
            Self::ToolInput(_) => Some("Check the tool arguments against its input schema"),
            _ => None,
        }
    }
}

/// Map SQL Server error codes to semantic ServerError types.
pub fn from_sql_error(code: i32, message: &str) -> ServerError {
    match code {
        // Authentication errors
        18456 => ServerError::auth(format!("Login failed: {}", message)),

        // Database could not be opened
        4060 => ServerError::connection(format!("Cannot open database: {}", message)),

        // Object not found errors
        208 => ServerError::object_not_found("Object", message),
        2812 => ServerError::object_not_found("Stored procedure", message),

        // Permission errors
        229 | 230 => ServerError::permission_denied(message),
        262 => ServerError::permission_denied(format!("CREATE permission denied: {}", message)),

        // Timeout
        -2 => ServerError::timeout(0),

        // Constraint violations
        547 => ServerError::ConstraintViolation(message.to_string()),
        2601 | 2627 => ServerError::ConstraintViolation(format!("Duplicate key: {}", message)),

        // Syntax errors
        102 | 156 => {
            ServerError::query_error_with_code(format!("Syntax error: {}", message), code)
        }

        // Invalid column/object
        207 => ServerError::query_error_with_code(format!("Invalid column: {}", message), code),

        // Deadlock
        1205 => ServerError::query_error_with_code(
            "Transaction was deadlocked and has been rolled back",
            code,
        ),

        // Default: generic query error
        _ => ServerError::query_error_with_code(message, code),
    }
}

impl From<tiberius::error::Error> for ServerError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match &e {
            Error::Server(token) => from_sql_error(token.code() as i32, token.message()),
            Error::Io { .. } => ServerError::connection_with_source("IO error", e),
            Error::Tls(_) => ServerError::connection_with_source("TLS error", e),
            Error::Routing { host, port } => {
                ServerError::connection(format!("Server requested routing to {}:{}", host, port))
            }
            _ => ServerError::query_error(e.to_string()),
        }
    }
}

impl From<bb8_tiberius::Error> for ServerError {
    fn from(e: bb8_tiberius::Error) -> Self {
        match e {
            bb8_tiberius::Error::Tiberius(e) => ServerError::from(e),
            bb8_tiberius::Error::Io(e) => ServerError::connection_with_source("IO error", e),
        }
    }
}

impl From<bb8::RunError<bb8_tiberius::Error>> for ServerError {
    fn from(e: bb8::RunError<bb8_tiberius::Error>) -> Self {
        match e {
            // Exhaustion or an unreachable server both surface as an acquire timeout.
            bb8::RunError::TimedOut => {
                ServerError::query_error("Timed out waiting for a pooled connection")
            }
            bb8::RunError::User(e) => ServerError::from(e),
        }
    }
}
