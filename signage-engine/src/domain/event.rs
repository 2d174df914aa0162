//! Change notifications pushed or polled from the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a backend notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Schedules, playlists or media changed.
    ContentUpdate,
    /// Remote command addressed to this device.
    DeviceCommand,
    /// Keep-alive.
    Heartbeat,
    /// Stream handshake acknowledgement.
    Connected,
    #[serde(other)]
    Other,
}

impl ChangeType {
    /// Classify an event name. Schedule/playlist/media change names used by older
    /// backends count as content updates.
    pub fn classify(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "content_update" | "schedule_change" | "playlist_change" | "media_change" => {
                Self::ContentUpdate
            }
            "device_command" | "command" => Self::DeviceCommand,
            "heartbeat" | "ping" | "keepalive" => Self::Heartbeat,
            "connected" | "ack" => Self::Connected,
            _ => Self::Other,
        }
    }

    /// Whether listeners should see this event.
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Self::ContentUpdate | Self::DeviceCommand)
    }
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(alias = "change_type", alias = "type", deserialize_with = "de_change_type")]
    pub change_type: ChangeType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn de_change_type<'de, D>(deserializer: D) -> std::result::Result<ChangeType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(ChangeType::classify(&raw))
}

impl NotificationEvent {
    pub fn new(change_type: ChangeType, payload: serde_json::Value) -> Self {
        Self {
            change_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The remote command carried by a `device_command` notification.
    pub fn device_command(&self) -> Option<DeviceCommand> {
        if self.change_type != ChangeType::DeviceCommand {
            return None;
        }
        let name = self
            .payload
            .get("command")
            .or_else(|| self.payload.get("commandType"))
            .or_else(|| self.payload.get("command_type"))
            .and_then(|v| v.as_str())?;
        DeviceCommand::parse(name)
    }
}

/// Remote commands the engine executes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Force a sync cycle.
    SyncContent,
    /// Wipe the media cache, then force a sync.
    ClearCache,
    /// Restart the playlist from its first item.
    RestartContent,
    /// Clean process restart through the supervisor.
    Restart,
    /// Post a health report now.
    HealthCheck,
}

impl DeviceCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync_content" => Some(Self::SyncContent),
            "clear_cache" => Some(Self::ClearCache),
            "restart_content" => Some(Self::RestartContent),
            "restart" => Some(Self::Restart),
            "health_check" => Some(Self::HealthCheck),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ChangeType::classify("content_update"), ChangeType::ContentUpdate);
        assert_eq!(ChangeType::classify("Heartbeat"), ChangeType::Heartbeat);
        assert_eq!(ChangeType::classify("connected"), ChangeType::Connected);
        assert_eq!(ChangeType::classify("weather"), ChangeType::Other);
        assert!(!ChangeType::Heartbeat.is_forwarded());
    }

    #[test]
    fn test_parse_notification_with_command() {
        let json = r#"{"type":"device_command","payload":{"command":"clear_cache"}}"#;
        let event: NotificationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.change_type, ChangeType::DeviceCommand);
        assert_eq!(event.device_command(), Some(DeviceCommand::ClearCache));

        let json = r#"{"changeType":"schedule_change","timestamp":"2026-10-14T10:00:00Z"}"#;
        let event: NotificationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.change_type, ChangeType::ContentUpdate);
        assert_eq!(event.device_command(), None);
    }
}
