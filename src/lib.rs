//! # SQL Server Agent Gateway
//!
//! Lets a tool-calling LLM agent query one Microsoft SQL Server database.
//!
//! This crate provides:
//! - **Lifecycle**: one session per gateway, driven through
//!   `Disconnected -> Testing -> Connected` by [`ConnectionManager`]
//! - **Schema**: a text rendering of tables, columns and keys captured at connect
//! - **Executor**: arbitrary T-SQL with a statement timeout; failures are data
//! - **Tool bridge**: `get_from_db`, the single tool an agent calls
//! - **Agent contract**: [`agent::AgentLoop`], implemented outside this crate
//!
//! ## Architecture
//!
//! The `mssql-agent-gateway` binary exposes the lifecycle operations and
//! `get_from_db` as MCP tools over stdio. Library users can drive a
//! [`agent::ConversationService`] directly instead.

pub mod agent;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod state;
pub mod tools;

pub use config::Config;
pub use error::ServerError;
pub use lifecycle::ConnectionManager;
pub use server::GatewayServer;
