//! Adaptive polling strategy.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{ChannelShared, ChannelState};
use crate::config::NotificationConfig;
use crate::domain::{ChangeType, NotificationEvent};
use crate::utils::backoff::exponential_backoff;

/// Computes the wait before the next poll.
///
/// Successful polls adopt the server's recommended interval, clamped to
/// `[poll_min_interval, poll_max_interval]`; emergency mode polls at the finest cadence.
/// Failures back off from `poll_error_base` up to `poll_error_ceiling` for as long as
/// they last, and the next success returns to the last scheduled interval.
#[derive(Debug, Clone)]
pub struct PollingSchedule {
    min: Duration,
    max: Duration,
    error_base: Duration,
    error_ceiling: Duration,
    scheduled: Duration,
    emergency: bool,
    consecutive_failures: u32,
}

impl PollingSchedule {
    pub fn new(config: &NotificationConfig) -> Self {
        let min = config.poll_min_interval;
        let max = config.poll_max_interval.max(min);
        Self {
            min,
            max,
            error_base: config.poll_error_base,
            error_ceiling: config.poll_error_ceiling,
            scheduled: config.poll_interval.clamp(min, max),
            emergency: false,
            consecutive_failures: 0,
        }
    }

    pub fn on_success(&mut self, recommended_secs: Option<u64>, emergency: bool) -> Duration {
        self.consecutive_failures = 0;
        self.emergency = emergency;
        if let Some(secs) = recommended_secs.filter(|s| *s > 0) {
            self.scheduled = Duration::from_secs(secs).clamp(self.min, self.max);
        }
        self.current()
    }

    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current()
    }

    pub fn current(&self) -> Duration {
        if self.consecutive_failures > 0 {
            exponential_backoff(self.error_base, self.consecutive_failures, self.error_ceiling)
        } else if self.emergency {
            self.min
        } else {
            self.scheduled
        }
    }

    /// Last known-good interval, unaffected by failures and emergency mode.
    pub fn scheduled(&self) -> Duration {
        self.scheduled
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub(super) async fn run(shared: Arc<ChannelShared>, cancel: CancellationToken) {
    let mut schedule = PollingSchedule::new(&shared.config);

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.api.poll_notifications() => result,
        };

        let delay = match polled {
            Ok(response) => {
                let forwarded = response.notifications.iter().any(|n| n.change_type.is_forwarded());
                for event in response.notifications {
                    shared.deliver(event);
                }
                if response.has_updates && !forwarded {
                    shared.deliver(NotificationEvent::new(
                        ChangeType::ContentUpdate,
                        serde_json::Value::Null,
                    ));
                }
                let delay =
                    schedule.on_success(response.recommended_interval_seconds, response.emergency);
                if response.emergency {
                    debug!("Emergency mode, polling at finest cadence");
                }
                shared.set_state(ChannelState::Connected, 0, Some(delay));
                delay
            }
            Err(e) => {
                let delay = schedule.on_failure();
                warn!(
                    error = %e,
                    failures = schedule.consecutive_failures(),
                    retry_in_secs = delay.as_secs(),
                    "Notification poll failed"
                );
                shared.set_state(ChannelState::Backoff, schedule.consecutive_failures(), Some(delay));
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_failures_back_off_then_revert_to_recommended() {
        let mut schedule = PollingSchedule::new(&NotificationConfig::default());
        assert_eq!(schedule.current(), secs(60));

        assert_eq!(schedule.on_success(Some(900), false), secs(900));
        assert_eq!(schedule.on_failure(), secs(30));
        assert_eq!(schedule.on_failure(), secs(60));
        assert_eq!(schedule.on_failure(), secs(120));
        assert_eq!(schedule.scheduled(), secs(900));

        // No recommendation on the recovering poll: keep the last scheduled interval.
        assert_eq!(schedule.on_success(None, false), secs(900));
        assert_eq!(schedule.consecutive_failures(), 0);
    }

    #[test]
    fn test_failure_backoff_is_capped() {
        let mut schedule = PollingSchedule::new(&NotificationConfig::default());
        let delays: Vec<Duration> = (0..8).map(|_| schedule.on_failure()).collect();
        assert_eq!(delays[4], secs(480));
        assert_eq!(delays[5], secs(600));
        assert_eq!(delays[7], secs(600));
    }

    #[test]
    fn test_recommendation_is_clamped_and_emergency_is_finest() {
        let mut schedule = PollingSchedule::new(&NotificationConfig::default());
        assert_eq!(schedule.on_success(Some(1), false), secs(5));
        assert_eq!(schedule.on_success(Some(100_000), false), secs(3600));
        assert_eq!(schedule.on_success(Some(300), true), secs(5));
        assert_eq!(schedule.on_success(None, false), secs(300));
    }
}
