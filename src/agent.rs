//! Contract between the gateway and an external, tool-calling agent loop.
//!
//! The gateway does not reason or generate text. A conversation turn is handed
//! to an [`AgentLoop`] together with a system prompt and the `get_from_db`
//! tool; the loop calls the tool as often as it likes and returns one final
//! message.

use crate::config::AgentConfig;
use crate::constants::CONNECT_FIRST_MESSAGE;
use crate::lifecycle::ConnectionManager;
use crate::tools::{definition_for, SqlToolBridge, ToolDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a loop gets for one turn.
pub struct AgentTurn<'a> {
    pub system_prompt: String,
    pub history: &'a [ChatMessage],
    /// `get_from_db` with the session schema in its description
    pub tool_definition: ToolDefinition,
    /// Executes tool calls against the session
    pub tool: &'a SqlToolBridge,
    pub config: &'a AgentConfig,
}

/// A reasoning engine that may call `get_from_db` any number of times before
/// answering.
///
/// Implementations pass the JSON of each [`crate::tools::ToolEnvelope`] back to
/// the model verbatim and decide on their own when to stop.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    async fn run(&self, turn: AgentTurn<'_>) -> anyhow::Result<String>;
}

/// Answers conversation turns against the current session.
#[derive(Clone)]
pub struct ConversationService {
    manager: ConnectionManager,
    bridge: SqlToolBridge,
    agent: Arc<dyn AgentLoop>,
    config: AgentConfig,
}

impl ConversationService {
    pub fn new(manager: ConnectionManager, agent: Arc<dyn AgentLoop>, config: AgentConfig) -> Self {
        let bridge = SqlToolBridge::new(manager.clone());
        Self {
            manager,
            bridge,
            agent,
            config,
        }
    }

    /// Produce the assistant's reply to the last message of `history`.
    ///
    /// Never fails: a missing session or a loop error becomes the reply text.
    pub async fn message(&self, history: &[ChatMessage]) -> String {
        let status = self.manager.status().await;
        let (Some(server), Some(database)) = (status.server, status.database) else {
            return CONNECT_FIRST_MESSAGE.to_string();
        };

        let schema = match self.manager.schema().await {
            Ok(schema) => schema,
            Err(e) => {
                return format!(
                    "Error retrieving database schema: {}. Please check your database connection and try reconnecting.",
                    e
                )
            }
        };

        let turn = AgentTurn {
            system_prompt: system_prompt(&server, &database),
            history,
            tool_definition: definition_for(Some(&schema)),
            tool: &self.bridge,
            config: &self.config,
        };

        info!("Running agent loop over {} message(s)", history.len());
        match self.agent.run(turn).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Agent loop failed: {:#}", e);
                format!(
                    "An error occurred while processing your request: {}. Please try again or check your database connection.",
                    e
                )
            }
        }
    }
}

/// System prompt for a session on `server`/`database`.
pub fn system_prompt(server: &str, database: &str) -> String {
    format!(
        "You are an expert SQL Server database assistant. Your role is to help users query and understand their SQL Server database.

CORE RESPONSIBILITIES:
1. Understand user questions about their data
2. Generate accurate SQL Server (T-SQL) queries using the get_from_db tool
3. Analyze and explain query results clearly
4. Provide insights and suggestions based on the data

SQL SERVER SYNTAX RULES:
- Use TOP N instead of LIMIT N (e.g., SELECT TOP 10 * FROM table)
- Use square brackets for identifiers with spaces or reserved words: [Order Details]
- Use schema.table notation (e.g., dbo.customers)
- Date functions: GETDATE(), DATEADD(), DATEDIFF(), FORMAT()
- String concatenation uses + or CONCAT()
- Pagination: ORDER BY ... OFFSET N ROWS FETCH NEXT M ROWS ONLY

RESPONSE FORMAT:
- Briefly state what you are going to look up
- Run the query with the get_from_db tool
- Present the results clearly, using tables for tabular data
- Explain what the results mean for the user's question
- If a query fails, read the error, fix the query and try again

BEST PRACTICES:
- Only use tables and columns that exist in the schema
- Limit large result sets with TOP
- Never modify data unless the user explicitly asks for it
- Ask for clarification when a question is ambiguous

Current database connection: {server}/{database}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_names_connection() {
        let prompt = system_prompt("db.local", "sales");
        assert!(prompt.contains("Current database connection: db.local/sales"));
        assert!(prompt.contains("TOP N instead of LIMIT N"));
        assert!(prompt.contains("get_from_db"));
    }

    #[test]
    fn test_chat_message_serializes_lowercase_role() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));

        let message: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"ok"}"#).unwrap();
        assert_eq!(message, ChatMessage::assistant("ok"));
    }
}
