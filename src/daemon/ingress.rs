//! The ingress loop: the only producer of published samples.
//!
//! It runs on its own thread, pulls raw samples from the source, applies the
//! active calibration profile and publishes into the state bus and the stream
//! broadcaster. Calibration commands are executed on this thread as well, so
//! profile swaps are totally ordered with sample publication.

use crate::daemon::error::ServiceError;
use crate::util::logging::{debug, info, trace, warn};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use gazer_core::sample::wall_clock_secs;
use gazer_core::{
    CalibrationPoint, CalibrationProfile, CalibrationSession, CalibrationState, GazeStateBus,
    RawSample, Sample, SampleSource, ServicePhase, SourceUnavailable, StreamBroadcaster,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Ingress side of a control command's answer. Exactly one of
/// [`Reply::claim`] and the caller's timeout wins, so a command the caller
/// gave up on is never executed.
pub struct Reply<T> {
    tx: Sender<Result<T, ServiceError>>,
    ticket: Arc<AtomicU8>,
}

/// Caller side of a [`Reply`].
pub struct PendingReply<T> {
    rx: Receiver<Result<T, ServiceError>>,
    ticket: Arc<AtomicU8>,
}

impl<T> Reply<T> {
    pub fn channel() -> (Reply<T>, PendingReply<T>) {
        let (tx, rx) = bounded(1);
        let ticket = Arc::new(AtomicU8::new(PENDING));
        (
            Reply {
                tx,
                ticket: Arc::clone(&ticket),
            },
            PendingReply { rx, ticket },
        )
    }

    fn claim(&self) -> bool {
        self.ticket
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn answer(self, run: impl FnOnce() -> Result<T, ServiceError>) {
        if !self.claim() {
            debug!("Skipping control command abandoned by its caller");
            return;
        }
        let _ = self.tx.send(run());
    }
}

impl<T> PendingReply<T> {
    /// Wait for the answer. On timeout the command is abandoned unless the
    /// ingress thread already claimed it, in which case its answer is awaited
    /// for one more `timeout`.
    pub fn wait(self, timeout: Duration) -> Result<T, ServiceError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Disconnected) => return Err(ServiceError::Stopped),
            Err(RecvTimeoutError::Timeout) => {}
        }
        let abandoned = self
            .ticket
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if abandoned {
            return Err(ServiceError::Timeout(timeout));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ServiceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ServiceError::Stopped),
        }
    }
}

/// Operator requests handled between source polls.
pub enum ControlCommand {
    BeginCalibration {
        reply: Reply<()>,
    },
    /// Pair the most recent raw sample with a screen target.
    CapturePoint {
        target_x: f64,
        target_y: f64,
        reply: Reply<(CalibrationPoint, usize)>,
    },
    AddPoint {
        point: CalibrationPoint,
        reply: Reply<usize>,
    },
    FinishCalibration {
        reply: Reply<CalibrationProfile>,
    },
    AbortCalibration {
        reply: Reply<()>,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngressExit {
    Stopped,
    SourceEnded(SourceUnavailable),
}

enum Flow {
    Continue,
    Stop,
}

pub struct IngressLoop {
    source: Box<dyn SampleSource>,
    bus: Arc<GazeStateBus>,
    broadcaster: StreamBroadcaster,
    control_rx: Receiver<ControlCommand>,
    source_timeout: Duration,
    profile: CalibrationProfile,
    session: Option<CalibrationSession>,
    latest_raw: Option<RawSample>,
    last_seq: u64,
}

impl IngressLoop {
    pub fn new(
        source: Box<dyn SampleSource>,
        bus: Arc<GazeStateBus>,
        broadcaster: StreamBroadcaster,
        control_rx: Receiver<ControlCommand>,
        source_timeout: Duration,
        profile: CalibrationProfile,
    ) -> Self {
        Self {
            source,
            bus,
            broadcaster,
            control_rx,
            source_timeout,
            profile,
            session: None,
            latest_raw: None,
            last_seq: 0,
        }
    }

    pub fn run(mut self) -> IngressExit {
        info!(
            "Ingress loop started (source={}, timeout={:?})",
            self.source.name(),
            self.source_timeout
        );
        loop {
            if let Flow::Stop = self.drain_control() {
                info!("Ingress loop stopping on request");
                return IngressExit::Stopped;
            }
            match self.source.next_sample(self.source_timeout) {
                Ok(Some(raw)) => self.on_raw(raw),
                Ok(None) => trace!("No sample this tick"),
                Err(e) => {
                    warn!("Sample source ended: {}", e);
                    self.commit(|s| {
                        s.running = false;
                        s.phase = ServicePhase::Stopped;
                    });
                    return IngressExit::SourceEnded(e);
                }
            }
        }
    }

    fn drain_control(&mut self) -> Flow {
        loop {
            match self.control_rx.try_recv() {
                Ok(ControlCommand::Stop) => return Flow::Stop,
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => return Flow::Continue,
                // Service handle dropped without an explicit stop.
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn on_raw(&mut self, raw: RawSample) {
        if !raw.is_finite() {
            debug!("Skipping non-finite raw sample ({}, {})", raw.x, raw.y);
            return;
        }
        self.latest_raw = Some(raw);
        if self.session.is_some() {
            return;
        }

        let seq = self.last_seq + 1;
        let sample = Sample::from_raw(&raw, seq, Instant::now(), wall_clock_secs());
        let sample = if self.profile.is_calibrated() {
            self.profile.apply(&sample)
        } else {
            sample
        };
        let calibrated = self.profile.is_calibrated();

        let committed = self.bus.update(|s| {
            if !s.initialized {
                s.started_at = Some(chrono::Utc::now());
            }
            s.initialized = true;
            s.running = true;
            if s.phase == ServicePhase::Initializing {
                s.phase = ServicePhase::Running;
            }
            s.calibrated = calibrated;
            s.last_sample = Some(sample);
            s.samples_published += 1;
        });
        match committed {
            Ok(state) => {
                self.last_seq = seq;
                if state.samples_published == 1 {
                    info!("First sample acquired; service running");
                }
                self.broadcaster.publish(&sample);
            }
            Err(e) => warn!("Dropping sample {}: {}", seq, e),
        }
    }

    fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::BeginCalibration { reply } => {
                reply.answer(|| self.begin_calibration());
            }
            ControlCommand::CapturePoint {
                target_x,
                target_y,
                reply,
            } => {
                reply.answer(|| self.capture_point(target_x, target_y));
            }
            ControlCommand::AddPoint { point, reply } => {
                reply.answer(|| self.add_point(point));
            }
            ControlCommand::FinishCalibration { reply } => {
                reply.answer(|| self.finish_calibration());
            }
            ControlCommand::AbortCalibration { reply } => {
                reply.answer(|| self.abort_calibration());
            }
            ControlCommand::Stop => {}
        }
    }

    fn begin_calibration(&mut self) -> Result<(), ServiceError> {
        let phase = self.bus.snapshot().phase;
        if phase != ServicePhase::Running {
            return Err(ServiceError::InvalidPhase {
                expected: ServicePhase::Running,
                actual: phase,
            });
        }
        self.session = Some(CalibrationSession::new());
        self.latest_raw = None;
        let calibrating = self.profile.with_state(CalibrationState::Calibrating);
        self.commit(|s| {
            s.phase = ServicePhase::Calibrating;
            s.profile = calibrating;
        });
        info!("Calibration started");
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut CalibrationSession, ServiceError> {
        let phase = self.bus.snapshot().phase;
        self.session.as_mut().ok_or(ServiceError::InvalidPhase {
            expected: ServicePhase::Calibrating,
            actual: phase,
        })
    }

    fn capture_point(
        &mut self,
        target_x: f64,
        target_y: f64,
    ) -> Result<(CalibrationPoint, usize), ServiceError> {
        if !(target_x.is_finite() && target_y.is_finite()) {
            return Err(ServiceError::InvalidPoint("target is not finite"));
        }
        let latest_raw = self.latest_raw;
        let session = self.session_mut()?;
        let raw = latest_raw.ok_or(ServiceError::NoRawSample)?;
        let point = CalibrationPoint::new(raw.x, raw.y, target_x, target_y);
        let count = session.add_point(point);
        debug!(
            "Captured calibration point {} raw=({:.4}, {:.4}) target=({}, {})",
            count, raw.x, raw.y, target_x, target_y
        );
        Ok((point, count))
    }

    fn add_point(&mut self, point: CalibrationPoint) -> Result<usize, ServiceError> {
        if !point.is_finite() {
            return Err(ServiceError::InvalidPoint("coordinates are not finite"));
        }
        let session = self.session_mut()?;
        Ok(session.add_point(point))
    }

    fn finish_calibration(&mut self) -> Result<CalibrationProfile, ServiceError> {
        let fitted = self.session_mut()?.finish();
        // Success or failure, the session ends here and the service resumes.
        self.session = None;
        match fitted {
            Ok(profile) => {
                self.profile = profile;
                self.commit(|s| {
                    s.phase = ServicePhase::Running;
                    s.profile = profile;
                    s.calibrated = s.initialized;
                });
                info!(
                    "Calibration complete: scale=({:.3}, {:.3}) offset=({:.3}, {:.3}) rms={:.3}",
                    profile.scale_x,
                    profile.scale_y,
                    profile.offset_x,
                    profile.offset_y,
                    profile.rms_error
                );
                Ok(profile)
            }
            Err(e) => {
                warn!("Calibration failed, keeping previous profile: {}", e);
                self.restore_profile();
                Err(e.into())
            }
        }
    }

    fn abort_calibration(&mut self) -> Result<(), ServiceError> {
        self.session_mut()?;
        self.session = None;
        self.restore_profile();
        info!("Calibration aborted, previous profile kept");
        Ok(())
    }

    fn restore_profile(&mut self) {
        let profile = self.profile;
        self.commit(|s| {
            s.phase = ServicePhase::Running;
            s.profile = profile;
        });
    }

    fn commit<F>(&self, mutate: F)
    where
        F: FnOnce(&mut gazer_core::ServiceState),
    {
        if let Err(e) = self.bus.update(mutate) {
            warn!("State update rejected: {}", e);
        }
    }
}
