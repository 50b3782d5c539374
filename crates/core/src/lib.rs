//! Core gaze pipeline types: samples, calibration, the shared state bus,
//! health classification and the subscriber fan-out.

pub mod broadcast;
pub mod calibration;
pub mod health;
pub mod sample;
pub mod source;
pub mod state;

pub use broadcast::{StreamBroadcaster, StreamItem, Subscription};
pub use calibration::{
    CalibrationError, CalibrationPoint, CalibrationProfile, CalibrationSession, CalibrationState,
    MIN_CALIBRATION_POINTS, calibrate,
};
pub use health::{Health, HealthReport, ServiceFlags, classify};
pub use sample::{GazePayload, RawSample, Sample};
pub use source::{SampleSource, SourceUnavailable};
pub use state::{GazeStateBus, InvariantViolation, ServicePhase, ServiceState};
