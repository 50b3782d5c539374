use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A position estimate as emitted by a sample source, in source space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub x: f64,
    pub y: f64,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl RawSample {
    pub fn new(x: f64, y: f64, confidence: f64) -> Self {
        Self { x, y, confidence }
    }

    /// Coordinates must be finite to be published; confidence is clamped instead.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One published gaze sample. Immutable once built by the ingress loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Publish sequence number, strictly increasing per service instance.
    pub seq: u64,
    pub x: f64,
    pub y: f64,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// Monotonic capture instant, used for freshness checks.
    pub captured_at: Instant,
    /// Wall-clock capture time in seconds since the UNIX epoch, used on the wire.
    pub wall_secs: f64,
}

impl Sample {
    pub fn from_raw(raw: &RawSample, seq: u64, captured_at: Instant, wall_secs: f64) -> Self {
        Self {
            seq,
            x: raw.x,
            y: raw.y,
            confidence: clamp_confidence(raw.confidence),
            captured_at,
            wall_secs,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    pub fn payload(&self) -> GazePayload {
        GazePayload {
            x: self.x,
            y: self.y,
            confidence: self.confidence,
            timestamp: self.wall_secs,
        }
    }
}

/// Wire shape shared by `GET /gaze` and every stream message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazePayload {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
    pub timestamp: f64,
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
