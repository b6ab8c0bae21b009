//! The `get_from_db` tool: the bridge between an agent loop and the executor.
//!
//! Input is validated before the database is touched, and every outcome is
//! folded into a [`ToolEnvelope`] whose JSON the agent reads on its next step.

use crate::constants::{NO_SQL_ERROR, NO_SQL_MESSAGE, QUERY_TOOL_NAME, TOOL_SYNTAX_GUIDANCE};
use crate::database::{QueryResult, ResultRow, SchemaDocument};
use crate::lifecycle::ConnectionManager;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use tracing::debug;

/// Input of the `get_from_db` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetFromDbInput {
    /// A complete, valid SQL Server (T-SQL) query to execute against the connected
    /// database. Use the exact table and column names from the schema above.
    pub sql: String,
}

/// Name, description and input schema of a tool, independent of any protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Map<String, Value>,
}

/// JSON envelope returned for every tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolEnvelope {
    Success {
        data: Vec<ResultRow>,
        #[serde(rename = "rowsAffected")]
        rows_affected: u64,
        success: bool,
        query: String,
        message: String,
    },
    Failure {
        error: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        message: String,
    },
}

impl ToolEnvelope {
    /// Envelope for a call that carried no usable SQL.
    pub fn no_sql() -> Self {
        Self::Failure {
            error: NO_SQL_ERROR.to_string(),
            success: false,
            query: None,
            message: NO_SQL_MESSAGE.to_string(),
        }
    }

    /// Wrap an executor result.
    pub fn from_result(result: QueryResult) -> Self {
        let rows_affected = result.rows_affected();
        match result {
            QueryResult::Success { rows, query, .. } => {
                let message = if rows.is_empty() {
                    format!(
                        "Query executed successfully. {} row(s) affected.",
                        rows_affected
                    )
                } else {
                    format!(
                        "Query executed successfully. Returned {} row(s).",
                        rows.len()
                    )
                };
                Self::Success {
                    data: rows,
                    rows_affected,
                    success: true,
                    query,
                    message,
                }
            }
            QueryResult::Failure { error, query } => Self::Failure {
                message: format!("Query execution failed: {}", error),
                error,
                success: false,
                query: Some(query),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The one-line summary.
    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Failure { message, .. } => message,
        }
    }

    /// Serialize to the JSON text handed to the agent.
    pub fn to_json(&self) -> String {
        // Rows hold only JSON-representable values, so this cannot fail in practice.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"error":"Failed to serialize result: {}","success":false}}"#,
                e
            )
        })
    }
}

/// The schema-aware query tool over a shared session.
#[derive(Clone)]
pub struct SqlToolBridge {
    manager: ConnectionManager,
}

impl SqlToolBridge {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn name(&self) -> &'static str {
        QUERY_TOOL_NAME
    }

    /// Run one tool call. Never fails; malformed input yields a failure envelope
    /// without reaching the database.
    pub async fn invoke(&self, arguments: &Value) -> ToolEnvelope {
        let Some(sql) = extract_sql(arguments) else {
            debug!("Rejecting {} call without SQL", QUERY_TOOL_NAME);
            return ToolEnvelope::no_sql();
        };

        ToolEnvelope::from_result(self.manager.execute(sql).await)
    }

    /// Definition with the live schema embedded in the description.
    pub async fn definition(&self) -> ToolDefinition {
        let schema = self.manager.schema().await.ok();
        definition_for(schema.as_ref())
    }
}

/// Definition of `get_from_db` for a given schema document.
pub fn definition_for(schema: Option<&SchemaDocument>) -> ToolDefinition {
    ToolDefinition {
        name: QUERY_TOOL_NAME.to_string(),
        description: describe(schema),
        input_schema: input_schema::<GetFromDbInput>(),
    }
}

/// `sql` as a non-blank string, or nothing.
fn extract_sql(arguments: &Value) -> Option<&str> {
    arguments
        .get("sql")
        .and_then(Value::as_str)
        .filter(|sql| !sql.trim().is_empty())
}

/// Tool description for a given schema document.
pub fn describe(schema: Option<&SchemaDocument>) -> String {
    let mut out = String::from("Execute SQL queries on the connected SQL Server database.\n\n");

    out.push_str("Current Database Schema:\n");
    match schema {
        Some(schema) => out.push_str(schema.as_str()),
        None => out.push_str("No database connected. Connect to a database first.\n"),
    }

    out.push_str("\nIMPORTANT SQL Server Guidelines:\n");
    for line in TOOL_SYNTAX_GUIDANCE {
        let _ = writeln!(out, "- {}", line);
    }
    out.push_str(
        "\nAlways generate syntactically correct T-SQL queries based on the actual schema provided above.",
    );
    out
}

/// JSON Schema of a tool input type as a JSON object.
pub fn input_schema<T: JsonSchema>() -> Map<String, Value> {
    match serde_json::to_value(schemars::schema_for!(T)) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
