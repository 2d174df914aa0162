//! Notifications handled by the engine itself.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::container::EngineInner;
use crate::Result;
use crate::domain::{ChangeType, DeviceCommand, NotificationEvent};
use crate::notification::NotificationListener;

/// Turns content updates into forced syncs and runs device commands.
pub(super) struct EngineListener {
    engine: Weak<EngineInner>,
}

impl EngineListener {
    pub(super) fn new(engine: Weak<EngineInner>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NotificationListener for EngineListener {
    async fn on_notification(&self, event: NotificationEvent) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        match event.change_type {
            ChangeType::ContentUpdate => {
                debug!("Content update notification, forcing sync");
                engine.sync.force_sync();
                Ok(())
            }
            ChangeType::DeviceCommand => match event.device_command() {
                Some(command) => engine.execute(command).await,
                None => {
                    warn!(payload = %event.payload, "Ignoring unknown device command");
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }
}

impl EngineInner {
    pub(super) async fn execute(&self, command: DeviceCommand) -> Result<()> {
        info!(?command, "Executing device command");
        match command {
            DeviceCommand::SyncContent => self.sync.force_sync(),
            DeviceCommand::ClearCache => self.clear_cache().await?,
            DeviceCommand::RestartContent => self.playback.restart()?,
            DeviceCommand::Restart => self.request_restart("remote restart command"),
            DeviceCommand::HealthCheck => self.supervisor.request_probe(),
        }
        Ok(())
    }
}
