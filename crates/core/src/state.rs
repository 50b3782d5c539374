use crate::calibration::CalibrationProfile;
use crate::sample::{GazePayload, Sample};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    Uninitialized,
    Initializing,
    Running,
    Calibrating,
    Stopped,
}

/// Point-in-time record of the service. Published as an immutable `Arc`.
#[derive(Debug, Clone)]
pub struct ServiceState {
    /// Bus publication counter; increases with every committed update.
    pub version: u64,
    pub phase: ServicePhase,
    pub initialized: bool,
    pub running: bool,
    pub calibrated: bool,
    pub last_sample: Option<Sample>,
    pub profile: CalibrationProfile,
    pub samples_published: u64,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rejected state update: {0}")]
pub struct InvariantViolation(pub &'static str);

impl ServiceState {
    pub fn uninitialized() -> Self {
        Self {
            version: 0,
            phase: ServicePhase::Uninitialized,
            initialized: false,
            running: false,
            calibrated: false,
            last_sample: None,
            profile: CalibrationProfile::identity(),
            samples_published: 0,
            started_at: None,
        }
    }

    pub fn has_gaze(&self) -> bool {
        self.last_sample.is_some()
    }

    /// Latest published gaze, only once the service has initialized.
    pub fn gaze(&self) -> Option<GazePayload> {
        if !self.initialized {
            return None;
        }
        self.last_sample.as_ref().map(Sample::payload)
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.calibrated && !self.initialized {
            return Err(InvariantViolation("calibrated requires initialized"));
        }
        if self.running && !self.initialized {
            return Err(InvariantViolation("running requires initialized"));
        }
        if self.last_sample.is_some() && !self.initialized {
            return Err(InvariantViolation("sample present before initialization"));
        }
        let profile = &self.profile;
        if profile.scale_x == 0.0 || profile.scale_y == 0.0 {
            return Err(InvariantViolation("calibration scale must be non-zero"));
        }
        Ok(())
    }
}

/// Holder of the one shared `ServiceState`.
///
/// Readers clone an `Arc` out of a watch channel, so a read only contends with
/// the writer for the duration of a pointer swap. Updates are copy-on-write and
/// validated before they become visible.
pub struct GazeStateBus {
    version: AtomicU64,
    state_tx: watch::Sender<Arc<ServiceState>>,
    state_rx: watch::Receiver<Arc<ServiceState>>,
}

impl Default for GazeStateBus {
    fn default() -> Self {
        Self::new()
    }
}

impl GazeStateBus {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(Arc::new(ServiceState::uninitialized()));
        Self {
            version: AtomicU64::new(0),
            state_tx,
            state_rx,
        }
    }

    pub fn snapshot(&self) -> Arc<ServiceState> {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<Arc<ServiceState>> {
        self.state_rx.clone()
    }

    /// Apply `mutate` to a copy of the current state and commit it if it still
    /// satisfies the state invariants. A rejected update leaves the bus untouched.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<ServiceState>, InvariantViolation>
    where
        F: FnOnce(&mut ServiceState),
    {
        let mut outcome = Err(InvariantViolation("update not applied"));
        self.state_tx.send_if_modified(|current| {
            let mut next = (**current).clone();
            mutate(&mut next);
            if let Err(violation) = next.validate() {
                outcome = Err(violation);
                return false;
            }
            next.version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            outcome = Ok(next);
            true
        });
        outcome
    }

    /// Reset every field and mark the service stopped.
    pub fn teardown(&self) -> Arc<ServiceState> {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let next = Arc::new(ServiceState {
            version,
            phase: ServicePhase::Stopped,
            ..ServiceState::uninitialized()
        });
        self.state_tx.send_replace(Arc::clone(&next));
        next
    }
}
