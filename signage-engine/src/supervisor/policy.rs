//! Rolling-window error accounting and the crash-loop guard.
//!
//! Both structures are plain data so they can be persisted in device state and survive
//! a process restart. Timestamps are wall-clock for the same reason.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classify::{ErrorCategory, ErrorSource};
use crate::config::SupervisorConfig;

/// What the supervisor should do after recording an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ignore,
    /// Component errors crossed the alert threshold.
    Alert { count: usize },
    /// Critical errors or crashes crossed the restart threshold.
    Restart { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub critical: VecDeque<DateTime<Utc>>,
    pub component: VecDeque<DateTime<Utc>>,
    /// Top-level crashes, seeded from the crash journal on start.
    pub crashes: VecDeque<DateTime<Utc>>,
    /// Crashes at or before this instant were already acted upon.
    pub crashes_cleared_at: Option<DateTime<Utc>>,
}

impl ErrorCounters {
    pub fn record(
        &mut self,
        source: ErrorSource,
        category: ErrorCategory,
        at: DateTime<Utc>,
        config: &SupervisorConfig,
    ) -> Verdict {
        self.prune(at, config.window);
        match category {
            ErrorCategory::Network | ErrorCategory::OutOfMemory => Verdict::Ignore,
            ErrorCategory::Component => {
                self.component.push_back(at);
                let count = self.component.len();
                if count >= config.transient_alert_threshold {
                    self.component.clear();
                    Verdict::Alert { count }
                } else {
                    Verdict::Ignore
                }
            }
            ErrorCategory::Critical => {
                if source == ErrorSource::Crash {
                    self.record_crash(at);
                } else {
                    self.critical.push_back(at);
                }
                self.restart_verdict(config)
            }
        }
    }

    /// Add a crash unless it is already counted or was acted upon.
    pub fn record_crash(&mut self, at: DateTime<Utc>) -> bool {
        if self.crashes_cleared_at.is_some_and(|cleared| at <= cleared) || self.crashes.contains(&at) {
            return false;
        }
        let pos = self.crashes.partition_point(|t| *t <= at);
        self.crashes.insert(pos, at);
        true
    }

    pub fn restart_verdict(&self, config: &SupervisorConfig) -> Verdict {
        if self.crashes.len() >= config.crash_threshold {
            return Verdict::Restart {
                reason: format!("{} crashes within the window", self.crashes.len()),
            };
        }
        if self.critical.len() >= config.critical_threshold {
            return Verdict::Restart {
                reason: format!("{} critical errors within the window", self.critical.len()),
            };
        }
        Verdict::Ignore
    }

    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return;
        };
        for deque in [&mut self.critical, &mut self.component, &mut self.crashes] {
            while deque.front().is_some_and(|t| *t < cutoff) {
                deque.pop_front();
            }
        }
    }

    /// Forget everything that led to a restart decision.
    pub fn clear_for_restart(&mut self, at: DateTime<Utc>) {
        self.critical.clear();
        self.crashes.clear();
        self.crashes_cleared_at = Some(at);
    }
}

/// Restarts performed recently, for the crash-loop guard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartHistory {
    pub restarts: VecDeque<DateTime<Utc>>,
}

impl RestartHistory {
    pub fn recent(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.restarts
            .iter()
            .filter(|t| now.signed_duration_since(**t) < window)
            .count()
    }

    /// Whether another restart keeps us within `max` per `window`.
    pub fn allows(&self, now: DateTime<Utc>, max: usize, window: Duration) -> bool {
        self.recent(now, window) < max
    }

    pub fn record(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.restarts
            .retain(|t| now.signed_duration_since(*t) < window);
        self.restarts.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_network_and_oom_never_counted() {
        let config = SupervisorConfig::default();
        let mut counters = ErrorCounters::default();
        for i in 0..100 {
            assert_eq!(
                counters.record(ErrorSource::Sync, ErrorCategory::Network, at(i), &config),
                Verdict::Ignore
            );
            assert_eq!(
                counters.record(ErrorSource::Playback, ErrorCategory::OutOfMemory, at(i), &config),
                Verdict::Ignore
            );
        }
        assert_eq!(counters, ErrorCounters::default());
    }

    #[test]
    fn test_fifth_critical_requests_restart() {
        let config = SupervisorConfig::default();
        let mut counters = ErrorCounters::default();
        for i in 0..4 {
            assert_eq!(
                counters.record(ErrorSource::Cache, ErrorCategory::Critical, at(i), &config),
                Verdict::Ignore
            );
        }
        assert!(matches!(
            counters.record(ErrorSource::Cache, ErrorCategory::Critical, at(4), &config),
            Verdict::Restart { .. }
        ));
    }

    #[test]
    fn test_window_expires_old_errors() {
        let config = SupervisorConfig::default();
        let mut counters = ErrorCounters::default();
        for i in 0..4 {
            counters.record(ErrorSource::Cache, ErrorCategory::Critical, at(i), &config);
        }
        // Six minutes later the earlier four have aged out.
        assert_eq!(
            counters.record(ErrorSource::Cache, ErrorCategory::Critical, at(360), &config),
            Verdict::Ignore
        );
        assert_eq!(counters.critical.len(), 1);
    }

    #[test]
    fn test_component_alert_then_reset() {
        let config = SupervisorConfig::default();
        let mut counters = ErrorCounters::default();
        for i in 0..9 {
            counters.record(ErrorSource::Download, ErrorCategory::Component, at(i), &config);
        }
        assert_eq!(
            counters.record(ErrorSource::Download, ErrorCategory::Component, at(9), &config),
            Verdict::Alert { count: 10 }
        );
        assert!(counters.component.is_empty());
    }

    #[test]
    fn test_crashes_deduplicated_and_cleared() {
        let config = SupervisorConfig::default();
        let mut counters = ErrorCounters::default();
        assert!(counters.record_crash(at(1)));
        assert!(!counters.record_crash(at(1)));
        counters.record(ErrorSource::Crash, ErrorCategory::Critical, at(2), &config);
        assert!(matches!(
            counters.record(ErrorSource::Crash, ErrorCategory::Critical, at(3), &config),
            Verdict::Restart { .. }
        ));

        counters.clear_for_restart(at(3));
        assert!(!counters.record_crash(at(2)));
        assert!(counters.record_crash(at(4)));
    }

    #[test]
    fn test_restart_history_guard() {
        let window = Duration::from_secs(3600);
        let mut history = RestartHistory::default();
        for i in 0..3 {
            assert!(history.allows(at(i * 60), 3, window));
            history.record(at(i * 60), window);
        }
        assert!(!history.allows(at(200), 3, window));
        assert!(history.allows(at(3601), 3, window));
    }
}
