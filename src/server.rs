//! MCP server struct definition and initialization.

use crate::config::Config;
use crate::lifecycle::{ConnectResponse, ConnectionManager};
use crate::tools::SqlToolBridge;
use std::sync::Arc;
use tracing::{info, warn};

/// The gateway's MCP server.
///
/// Cloned per request; the session behind `manager` is shared by every clone.
#[derive(Clone)]
pub struct GatewayServer {
    /// Owner of the single database session.
    pub(crate) manager: ConnectionManager,

    /// `get_from_db` over the same session.
    pub(crate) bridge: SqlToolBridge,

    /// Configuration.
    pub(crate) config: Arc<Config>,
}

impl GatewayServer {
    /// Create a server over the SQL Server driver. Does not connect.
    pub fn new(config: Config) -> Self {
        let manager = ConnectionManager::with_tds(config.session.clone());
        Self::with_manager(config, manager)
    }

    /// Create a server over an existing manager.
    pub fn with_manager(config: Config, manager: ConnectionManager) -> Self {
        let bridge = SqlToolBridge::new(manager.clone());
        Self {
            manager,
            bridge,
            config: Arc::new(config),
        }
    }

    /// Open the startup connection from the environment, if one is configured.
    ///
    /// A failure is logged and leaves the server disconnected; clients can
    /// still connect later through the `connect` tool.
    pub async fn connect_on_startup(&self) -> Option<ConnectResponse> {
        let config = self.config.startup_connection.clone()?;
        let response = self.manager.connect(config).await;
        if response.success {
            info!("{}", response.message);
        } else {
            warn!("Startup connection failed: {}", response.message);
        }
        Some(response)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn bridge(&self) -> &SqlToolBridge {
        &self.bridge
    }
}
