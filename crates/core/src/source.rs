use crate::sample::RawSample;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The source has ended and will not produce more samples.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("sample source '{source_name}' unavailable: {reason}")]
pub struct SourceUnavailable {
    pub source_name: String,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Producer of raw gaze estimates.
///
/// `next_sample` may block for at most `timeout`. `Ok(None)` means nothing was
/// available this tick (including transient read failures); `Err` is terminal.
pub trait SampleSource: Send {
    fn name(&self) -> &str;

    fn next_sample(&mut self, timeout: Duration) -> Result<Option<RawSample>, SourceUnavailable>;
}

/// Source fed through a crossbeam channel. All senders dropping ends the stream.
pub struct ChannelSource {
    name: String,
    rx: Receiver<RawSample>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, rx: Receiver<RawSample>) -> Self {
        Self {
            name: name.into(),
            rx,
        }
    }
}

impl SampleSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_sample(&mut self, timeout: Duration) -> Result<Option<RawSample>, SourceUnavailable> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SourceUnavailable::new(
                self.name.clone(),
                "channel disconnected",
            )),
        }
    }
}

/// Deterministic Lissajous gaze path in normalized `[0, 1]` space, paced at `rate_hz`.
pub struct SimulatedSource {
    period: Duration,
    tick: u64,
    next_due: Instant,
    limit: Option<u64>,
}

impl SimulatedSource {
    pub fn new(rate_hz: f64) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 {
            rate_hz
        } else {
            60.0
        };
        Self {
            period: Duration::from_secs_f64(1.0 / rate_hz),
            tick: 0,
            next_due: Instant::now(),
            limit: None,
        }
    }

    /// End the stream after `limit` samples.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn point_at(tick: u64, period: Duration) -> RawSample {
        let t = tick as f64 * period.as_secs_f64();
        RawSample {
            x: 0.5 + 0.4 * (2.0 * PI * 0.13 * t).sin(),
            y: 0.5 + 0.4 * (2.0 * PI * 0.17 * t + PI / 3.0).sin(),
            confidence: 0.85 + 0.1 * (0.5 * t).sin(),
        }
    }
}

impl SampleSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn next_sample(&mut self, timeout: Duration) -> Result<Option<RawSample>, SourceUnavailable> {
        if self.limit.is_some_and(|limit| self.tick >= limit) {
            return Err(SourceUnavailable::new("simulated", "sample limit reached"));
        }
        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        let sample = Self::point_at(self.tick, self.period);
        self.tick += 1;
        // Do not try to catch up after a long stall.
        self.next_due = (self.next_due + self.period).max(Instant::now());
        Ok(Some(sample))
    }
}
