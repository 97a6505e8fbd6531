use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ServerConfig;

/// Trait for configuration sources feeding routing-table rebuilds.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Human readable description of where the configuration comes from.
    fn source(&self) -> String;

    /// Load the current configuration.
    async fn load_config(&self) -> Result<ServerConfig>;

    /// Return a channel that signals when the configuration has changed.
    /// Each signal should trigger `load_config` followed by a routing-table update.
    fn watch(&self) -> mpsc::Receiver<()>;
}
