use std::sync::Arc;

use super::ipc::IpcClient;
use crate::connection::ConnectionStrategy;
use crate::error::Result;

/// Keeps the local Discord IPC socket alive; health is a PING/PONG round trip.
pub struct DiscordConnectionStrategy {
    client: Arc<IpcClient>,
}

impl DiscordConnectionStrategy {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

impl ConnectionStrategy for DiscordConnectionStrategy {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn connect(&self) -> Result<()> {
        self.client.connect()
    }

    fn disconnect(&self) {
        self.client.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn health_check(&self) -> Result<()> {
        self.client.send_ping()
    }
}
