// src/health/status.rs
//! Backend lifecycle states and the counter-driven transition rules.
//!
//! Every probe bumps exactly one of two saturating counters and resets the
//! other; the new state is then picked from an ordered rule list where the
//! first matching rule wins.

use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    NewlyOnboarded,
    Healthy,
    Failing,
    Failed,
    Recovering,
    /// Reserved for administrative control; never entered by probing.
    Disabled,
    /// Reserved for administrative control; never entered by probing.
    Removed,
}

impl HealthState {
    /// Whether a backend in this state may receive traffic.
    ///
    /// `Failing` stays eligible so a single blip does not evict a backend;
    /// `Recovering` is held back until it fully re-qualifies.
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            HealthState::Healthy | HealthState::Failing | HealthState::NewlyOnboarded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::NewlyOnboarded => "newly_onboarded",
            HealthState::Healthy => "healthy",
            HealthState::Failing => "failing",
            HealthState::Failed => "failed",
            HealthState::Recovering => "recovering",
            HealthState::Disabled => "disabled",
            HealthState::Removed => "removed",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub max_failures: u32,
    pub min_successes: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_failures: 3,
            min_successes: 2,
        }
    }
}

/// Mutable health record of one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStatus {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_checked_on: Option<DateTime<Utc>>,
}

impl HealthStatus {
    /// Folds one probe outcome into the counters and returns the new state.
    ///
    /// Counters stay within `[0, threshold]`.
    pub fn record(
        &mut self,
        outcome: ProbeOutcome,
        thresholds: HealthThresholds,
        checked_on: DateTime<Utc>,
    ) -> HealthState {
        self.last_checked_on = Some(checked_on);

        match outcome {
            ProbeOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self
                    .consecutive_failures
                    .saturating_add(1)
                    .min(thresholds.max_failures);
            }
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self
                    .consecutive_successes
                    .saturating_add(1)
                    .min(thresholds.min_successes);
            }
        }

        self.state = self.next_state(thresholds);
        self.state
    }

    fn next_state(&self, thresholds: HealthThresholds) -> HealthState {
        if self.consecutive_failures >= thresholds.max_failures {
            HealthState::Failed
        } else if self.consecutive_failures > 0 {
            HealthState::Failing
        } else if self.consecutive_successes >= thresholds.min_successes {
            HealthState::Healthy
        } else if self.consecutive_successes > 0 {
            match self.state {
                HealthState::Failed | HealthState::Failing | HealthState::Recovering => {
                    HealthState::Recovering
                }
                _ => HealthState::Healthy,
            }
        } else {
            self.state
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn outcomes() -> impl Strategy<Value = Vec<ProbeOutcome>> {
        prop::collection::vec(
            prop_oneof![Just(ProbeOutcome::Success), Just(ProbeOutcome::Failure)],
            0..64,
        )
    }

    proptest! {
        #[test]
        fn counters_stay_within_thresholds(
            outcomes in outcomes(),
            max_failures in 1u32..=10,
            min_successes in 1u32..=10,
        ) {
            let thresholds = HealthThresholds { max_failures, min_successes };
            let mut status = HealthStatus::default();
            for outcome in outcomes {
                status.record(outcome, thresholds, Utc::now());
                prop_assert!(status.consecutive_failures <= max_failures);
                prop_assert!(status.consecutive_successes <= min_successes);
            }
        }

        #[test]
        fn failed_exactly_when_failure_threshold_reached(
            outcomes in outcomes(),
            max_failures in 1u32..=10,
            min_successes in 1u32..=10,
        ) {
            let thresholds = HealthThresholds { max_failures, min_successes };
            let mut status = HealthStatus::default();
            for outcome in outcomes {
                let state = status.record(outcome, thresholds, Utc::now());
                prop_assert_eq!(
                    state == HealthState::Failed,
                    status.consecutive_failures >= max_failures
                );
                prop_assert!(status.consecutive_failures == 0 || status.consecutive_successes == 0);
            }
        }
    }
}
