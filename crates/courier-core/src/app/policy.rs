//! Stop-condition policy.
//!
//! Evaluated once per Idle -> Claiming transition, in a fixed priority order:
//! target reached, then no work available, then idle timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::SessionCounters;
use crate::config::WorkerSettings;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    NoWorkAvailable,
    IdleTimeout,
    Cancelled,
    InfrastructureFailure,
}

impl StopReason {
    pub fn description(self) -> &'static str {
        match self {
            StopReason::TargetReached => "target reached",
            StopReason::NoWorkAvailable => "no work available",
            StopReason::IdleTimeout => "idle timeout",
            StopReason::Cancelled => "cancelled",
            StopReason::InfrastructureFailure => "infrastructure failure",
        }
    }

    /// Graceful stops exit with status 0.
    pub fn is_graceful(self) -> bool {
        !matches!(self, StopReason::InfrastructureFailure)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_work_orders: u32,
    pub max_consecutive_failures: u32,
    pub max_idle: Duration,
}

impl StopPolicy {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            max_work_orders: settings.max_work_orders,
            max_consecutive_failures: settings.max_consecutive_failures,
            max_idle: settings.max_idle,
        }
    }

    /// First threshold that trips, if any.
    pub fn evaluate(
        &self,
        counters: &SessionCounters,
        idle_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<StopReason> {
        if counters.completed >= self.max_work_orders {
            return Some(StopReason::TargetReached);
        }
        if counters.consecutive_no_work >= self.max_consecutive_failures {
            return Some(StopReason::NoWorkAvailable);
        }
        // a clock that went backwards counts as zero idle time
        let idle = (now - idle_since).to_std().unwrap_or(Duration::ZERO);
        if idle >= self.max_idle {
            return Some(StopReason::IdleTimeout);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn policy() -> StopPolicy {
        StopPolicy {
            max_work_orders: 3,
            max_consecutive_failures: 5,
            max_idle: Duration::from_secs(3600),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn counters(completed: u32, no_work: u32) -> SessionCounters {
        SessionCounters {
            completed,
            consecutive_no_work: no_work,
            ..SessionCounters::default()
        }
    }

    #[rstest]
    #[case::fresh(0, 0, 0, None)]
    #[case::target(3, 0, 0, Some(StopReason::TargetReached))]
    #[case::no_work(0, 5, 0, Some(StopReason::NoWorkAvailable))]
    #[case::idle(0, 0, 3600, Some(StopReason::IdleTimeout))]
    #[case::almost_idle(2, 4, 3599, None)]
    // priority: target > no work > idle
    #[case::target_beats_all(3, 5, 7200, Some(StopReason::TargetReached))]
    #[case::no_work_beats_idle(0, 5, 7200, Some(StopReason::NoWorkAvailable))]
    fn thresholds_in_priority_order(
        #[case] completed: u32,
        #[case] no_work: u32,
        #[case] idle_secs: i64,
        #[case] expected: Option<StopReason>,
    ) {
        assert_eq!(
            policy().evaluate(&counters(completed, no_work), t(0), t(idle_secs)),
            expected
        );
    }

    #[test]
    fn clock_skew_does_not_trip_idle_timeout() {
        assert_eq!(policy().evaluate(&counters(0, 0), t(100), t(0)), None);
    }

    #[test]
    fn only_infrastructure_failure_is_not_graceful() {
        assert!(StopReason::Cancelled.is_graceful());
        assert!(StopReason::IdleTimeout.is_graceful());
        assert!(!StopReason::InfrastructureFailure.is_graceful());
        assert_eq!(StopReason::TargetReached.to_string(), "target reached");
    }
}
