use crate::state::ServiceState;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFlags {
    pub initialized: bool,
    pub running: bool,
    pub calibrated: bool,
    pub has_gaze: bool,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: Health,
    pub service: ServiceFlags,
}

/// Classify a snapshot. `now` is passed in so callers and tests control time.
pub fn classify(state: &ServiceState, now: Instant, freshness_window: Duration) -> Health {
    if !state.initialized || !state.running {
        return Health::Unavailable;
    }
    let fresh = state
        .last_sample
        .as_ref()
        .is_some_and(|sample| sample.age(now) <= freshness_window);
    if state.calibrated && fresh {
        Health::Healthy
    } else {
        Health::Degraded
    }
}

impl HealthReport {
    pub fn from_state(state: &ServiceState, now: Instant, freshness_window: Duration) -> Self {
        Self {
            status: classify(state, now, freshness_window),
            service: ServiceFlags {
                initialized: state.initialized,
                running: state.running,
                calibrated: state.calibrated,
                has_gaze: state.has_gaze(),
            },
        }
    }
}
