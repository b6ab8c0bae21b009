//! Centralized constants for the gateway.
//!
//! Timeouts, pool bounds and the fixed texts handed to the agent live here so
//! they are easy to find and change in one place.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Connect timeout for the throwaway pool used by connection tests, in seconds.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 10;

/// Connect timeout for the session pool, in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 15;

/// Statement timeout, in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Connection test timeout as Duration.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS);

/// Session pool connect timeout as Duration.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration =
    Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS);

/// Statement timeout as Duration.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);

// =============================================================================
// Connection Pool Constants
// =============================================================================

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Default maximum connections in the session pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// The throwaway test pool never needs more than one connection.
pub const TEST_POOL_MAX_CONNECTIONS: u32 = 1;

/// Application name sent to SQL Server.
pub const APPLICATION_NAME: &str = "mssql-agent-gateway";

// =============================================================================
// Queries
// =============================================================================

/// Liveness query used by connection tests.
pub const LIVENESS_QUERY: &str = "SELECT 1 AS test";

/// Maximum SQL length echoed into log lines.
pub const LOG_SQL_MAX_LEN: usize = 200;

// =============================================================================
// Tool Bridge
// =============================================================================

/// Name of the single query tool exposed to the agent.
pub const QUERY_TOOL_NAME: &str = "get_from_db";

/// Error text returned when a tool call carries no SQL.
pub const NO_SQL_ERROR: &str = "No SQL query provided";

/// Summary line returned alongside [`NO_SQL_ERROR`].
pub const NO_SQL_MESSAGE: &str = "Please provide a valid SQL query to execute.";

/// Reply used when a conversation turn arrives without an active session.
pub const CONNECT_FIRST_MESSAGE: &str = "Please connect to a database first before asking questions. \
     Use the connect operation to establish a connection.";

/// T-SQL usage guidelines appended to the schema document.
pub const SCHEMA_GUIDELINES: &[&str] = &[
    "Use TOP N instead of LIMIT N (e.g., SELECT TOP 10 * FROM dbo.table)",
    "Reference tables as schema.table (e.g., dbo.customers)",
    "Use square brackets for names with spaces or reserved words (e.g., [order])",
    "Use single quotes for string literals",
    "Use OFFSET ... FETCH NEXT ... ROWS ONLY with ORDER BY for paging",
    "Only reference the tables and columns listed above",
];

/// T-SQL syntax guidance appended to the tool description.
pub const TOOL_SYNTAX_GUIDANCE: &[&str] = &[
    "Use TOP N instead of LIMIT N (e.g., \"SELECT TOP 10 * FROM table\")",
    "Use square brackets [table_name] for tables/columns with spaces or special characters",
    "Use proper schema.table notation (e.g., dbo.customers)",
    "Date functions: GETDATE(), DATEPART(), DATEDIFF(), etc.",
    "String functions: LEN(), SUBSTRING(), CHARINDEX(), etc.",
    "Use single quotes for string literals",
    "For pagination: use OFFSET and FETCH NEXT (SQL Server 2012+)",
    "Common data types: VARCHAR, NVARCHAR, INT, BIGINT, DECIMAL, DATETIME, BIT",
];
