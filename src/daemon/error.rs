use gazer_core::{CalibrationError, ServicePhase};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("no gaze sample has been published yet")]
    NotInitialized,
    #[error("service is stopped")]
    Stopped,
    #[error("operation requires the service to be {expected:?}, but it is {actual:?}")]
    InvalidPhase {
        expected: ServicePhase,
        actual: ServicePhase,
    },
    #[error("no raw sample has arrived since calibration started")]
    NoRawSample,
    #[error("invalid calibration point: {0}")]
    InvalidPoint(&'static str),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("ingress loop did not answer within {0:?}")]
    Timeout(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code used in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotInitialized => "not_initialized",
            ServiceError::Stopped => "service_stopped",
            ServiceError::InvalidPhase { .. } => "invalid_phase",
            ServiceError::NoRawSample => "no_raw_sample",
            ServiceError::InvalidPoint(_) => "invalid_point",
            ServiceError::Calibration(CalibrationError::InsufficientPoints { .. }) => {
                "insufficient_points"
            }
            ServiceError::Calibration(CalibrationError::DegenerateGeometry(_)) => {
                "degenerate_geometry"
            }
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Internal(_) => "internal",
        }
    }
}
