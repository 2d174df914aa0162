//! Server-sent-event strategy.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelShared, ChannelState};
use crate::domain::{ChangeType, NotificationEvent};
use crate::transport::{SseFrame, StreamSignal};
use crate::utils::backoff::exponential_backoff;

/// Convert a frame into a notification.
///
/// The JSON body wins when it names a known change type; otherwise the SSE event name
/// decides. Non-JSON bodies are kept as a string payload.
pub(super) fn parse_frame(frame: &SseFrame) -> NotificationEvent {
    let by_name = ChangeType::classify(&frame.event);
    let payload: serde_json::Value = serde_json::from_str(&frame.data)
        .unwrap_or_else(|_| serde_json::Value::String(frame.data.clone()));

    match serde_json::from_value::<NotificationEvent>(payload.clone()) {
        Ok(mut event) => {
            if event.change_type == ChangeType::Other {
                event.change_type = by_name;
            }
            event
        }
        Err(_) => NotificationEvent::new(by_name, payload),
    }
}

pub(super) async fn run(shared: Arc<ChannelShared>, cancel: CancellationToken) {
    let config = &shared.config;
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ChannelState::Connecting, attempts, None);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.connector.connect() => result,
        };

        match connected {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(StreamSignal::Open)) => {
                        info!("Notification stream connected");
                        attempts = 0;
                        shared.set_state(ChannelState::Connected, 0, None);
                    }
                    Some(Ok(StreamSignal::Frame(frame))) => {
                        attempts = 0;
                        shared.set_state(ChannelState::Connected, 0, None);
                        let event = parse_frame(&frame);
                        if event.change_type == ChangeType::Connected {
                            debug!("Notification stream acknowledged");
                        }
                        shared.deliver(event);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Notification stream failed");
                        break;
                    }
                    None => {
                        info!("Notification stream closed by server");
                        break;
                    }
                }
            },
            Err(e) => warn!(error = %e, "Notification stream connect failed"),
        }

        attempts = attempts.saturating_add(1);
        if attempts > config.stream_max_attempts {
            error!(
                attempts = attempts - 1,
                "Notification stream reconnect attempts exhausted"
            );
            shared.set_state(ChannelState::Degraded, attempts - 1, None);
            return;
        }

        let delay = exponential_backoff(
            config.stream_backoff_base,
            attempts,
            config.stream_backoff_max,
        );
        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Reconnecting notification stream");
        shared.set_state(ChannelState::Backoff, attempts, Some(delay));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.into(),
            data: data.into(),
        }
    }

    #[test]
    fn test_parse_frame_json_body() {
        let event = parse_frame(&frame(
            "message",
            r#"{"type":"content_update","payload":{"scheduleId":"s1"}}"#,
        ));
        assert_eq!(event.change_type, ChangeType::ContentUpdate);
        assert_eq!(event.payload["scheduleId"], "s1");
    }

    #[test]
    fn test_parse_frame_falls_back_to_event_name() {
        let event = parse_frame(&frame("heartbeat", "ping"));
        assert_eq!(event.change_type, ChangeType::Heartbeat);
        assert_eq!(event.payload, serde_json::Value::String("ping".into()));

        let event = parse_frame(&frame("device_command", r#"{"command":"clear_cache"}"#));
        assert_eq!(event.change_type, ChangeType::DeviceCommand);
        assert!(event.device_command().is_some());
    }

    #[test]
    fn test_parse_frame_unknown_is_not_forwarded() {
        let event = parse_frame(&frame("message", r#"{"type":"weather"}"#));
        assert_eq!(event.change_type, ChangeType::Other);
        assert!(!event.change_type.is_forwarded());
    }
}
