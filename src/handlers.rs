//! ServerHandler implementation for the gateway.
//!
//! Tools are listed and dispatched by hand rather than through a router macro
//! because the `get_from_db` description changes with every connect.

use crate::config::ConnectionConfig;
use crate::database::SchemaDocument;
use crate::error::ServerError;
use crate::server::GatewayServer;
use crate::tools::{definition_for, input_schema, ToolDefinition};
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Tools that take no arguments.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArguments {}

impl ServerHandler for GatewayServer {
    /// Server identification - called during initialization handshake.
    fn get_info(&self) -> ServerInfo {
        info!("MCP client requesting server info");

        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                title: Some("SQL Server Agent Gateway".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(build_instructions()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let schema = self.manager.schema().await.ok();
        let tools = build_tool_list(schema.as_ref());
        debug!("Listing {} tools", tools.len());
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch(&request.name, request.arguments).await
    }
}

impl GatewayServer {
    /// Route one tool call by name.
    pub(crate) async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, ErrorData> {
        let arguments = Value::Object(arguments.unwrap_or_default());
        debug!("Tool call: {}", name);

        match name {
            "connect" => {
                let config = connection_config(arguments)?;
                json_result(&self.manager.connect(config).await)
            }
            "test_connection" => {
                let config = connection_config(arguments)?;
                json_result(&self.manager.test_connection(&config).await)
            }
            "status" => json_result(&self.manager.status().await),
            "disconnect" => json_result(&self.manager.disconnect().await),
            name if name == self.bridge.name() => {
                let envelope = self.bridge.invoke(&arguments).await;
                Ok(CallToolResult::success(vec![Content::text(
                    envelope.to_json(),
                )]))
            }
            other => Err(ErrorData::invalid_params(
                format!("Unknown tool: {}", other),
                None,
            )),
        }
    }
}

/// Every tool the server exposes, with `get_from_db` described for `schema`.
pub fn build_tool_list(schema: Option<&SchemaDocument>) -> Vec<Tool> {
    let connection_schema = input_schema::<ConnectionConfig>();
    let no_arguments = input_schema::<NoArguments>();

    let definitions = vec![
        ToolDefinition {
            name: "connect".to_string(),
            description: "Connect to a SQL Server database, replacing any existing connection. \
                 Tests the connection first and returns the database schema on success."
                .to_string(),
            input_schema: connection_schema.clone(),
        },
        ToolDefinition {
            name: "test_connection".to_string(),
            description: "Check that a SQL Server connection config works without connecting."
                .to_string(),
            input_schema: connection_schema,
        },
        ToolDefinition {
            name: "status".to_string(),
            description: "Report whether a database is connected, and which one.".to_string(),
            input_schema: no_arguments.clone(),
        },
        ToolDefinition {
            name: "disconnect".to_string(),
            description: "Close the current database connection, if any.".to_string(),
            input_schema: no_arguments,
        },
        definition_for(schema),
    ];

    definitions.into_iter().map(to_tool).collect()
}

fn to_tool(definition: ToolDefinition) -> Tool {
    Tool::new(
        definition.name,
        definition.description,
        Arc::new(definition.input_schema),
    )
}

fn connection_config(arguments: Value) -> Result<ConnectionConfig, ErrorData> {
    serde_json::from_value(arguments).map_err(|e| {
        let error = ServerError::tool_input(format!("Invalid connection config: {}", e));
        ErrorData::invalid_params(error.to_string(), None)
    })
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string(value)
        .map_err(|e| ErrorData::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// Server instructions shown to the client on initialization.
fn build_instructions() -> String {
    let mut instructions = String::new();

    instructions.push_str("# SQL Server Agent Gateway\n\n");
    instructions.push_str("This server lets an agent query one Microsoft SQL Server database.\n\n");
    instructions.push_str("## Workflow\n");
    instructions.push_str("1. `connect` with server, database, user and password\n");
    instructions.push_str("2. Read the schema in the `get_from_db` description\n");
    instructions.push_str("3. Run T-SQL with `get_from_db`; failures come back as data\n");
    instructions.push_str("4. `disconnect` when done\n\n");
    instructions.push_str("Use `status` to check the connection at any time.\n");

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn server() -> GatewayServer {
        GatewayServer::new(Config::from_lookup(|_| None).unwrap())
    }

    fn text_of(result: &CallToolResult) -> Value {
        let json = serde_json::to_value(result).unwrap();
        let text = json["content"][0]["text"].as_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_tool_list() {
        let tools = build_tool_list(None);
        let names: Vec<&str> = tools.iter().map(|t| &*t.name).collect();
        assert_eq!(
            names,
            vec!["connect", "test_connection", "status", "disconnect", "get_from_db"]
        );

        let get_from_db = &tools[4];
        assert!(get_from_db
            .description
            .as_deref()
            .unwrap()
            .contains("No database connected"));
        assert_eq!(get_from_db.input_schema["required"], json!(["sql"]));
    }

    #[test]
    fn test_connect_schema_requires_credentials() {
        let tools = build_tool_list(None);
        let required = &tools[0].input_schema["required"];
        for field in ["server", "database", "user", "password"] {
            assert!(required.as_array().unwrap().contains(&json!(field)));
        }
    }

    #[tokio::test]
    async fn test_status_when_disconnected() {
        let result = server().dispatch("status", None).await.unwrap();
        assert_eq!(text_of(&result), json!({"connected": false}));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = server();
        for _ in 0..2 {
            let result = server.dispatch("disconnect", None).await.unwrap();
            let json = text_of(&result);
            assert_eq!(json["success"], true);
            assert_eq!(json["message"], "No active database connection");
        }
    }

    #[tokio::test]
    async fn test_get_from_db_without_sql() {
        let result = server()
            .dispatch("get_from_db", Some(JsonObject::new()))
            .await
            .unwrap();
        let json = text_of(&result);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "No SQL query provided");
    }

    #[tokio::test]
    async fn test_get_from_db_when_disconnected() {
        let mut args = JsonObject::new();
        args.insert("sql".to_string(), json!("SELECT 1"));
        let result = server().dispatch("get_from_db", Some(args)).await.unwrap();
        let json = text_of(&result);
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        assert!(server().dispatch("drop_database", None).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_config() {
        let mut args = JsonObject::new();
        args.insert("server".to_string(), json!("localhost"));
        assert!(server().dispatch("connect", Some(args)).await.is_err());
    }
}
