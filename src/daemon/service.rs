//! Lifecycle owner for one service instance: `new → start → stop`.
//!
//! Components receive the bus and broadcaster from here; nothing is global.

use crate::daemon::error::ServiceError;
use crate::daemon::ingress::{ControlCommand, IngressExit, IngressLoop, Reply};
use crate::util::config::AppConfig;
use crate::util::logging::{error, info, warn};
use crate::util::threading::{WorkerHandle, WorkerRegistry};
use anyhow::{Context, Result, bail};
use crossbeam_channel::{Sender, unbounded};
use gazer_core::broadcast::SubscriberInfo;
use gazer_core::{
    CalibrationPoint, CalibrationProfile, GazeStateBus, HealthReport, SampleSource, ServicePhase,
    ServiceState, StreamBroadcaster, Subscription,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const INGRESS_WORKER: &str = "gaze-ingress";

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub freshness_window: Duration,
    pub source_timeout: Duration,
    pub stream_buffer: usize,
    pub stream_stall_limit: u32,
    pub min_confidence: f64,
    pub initial_profile: CalibrationProfile,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_millis(500),
            source_timeout: Duration::from_millis(100),
            stream_buffer: gazer_core::broadcast::DEFAULT_STREAM_BUFFER,
            stream_stall_limit: gazer_core::broadcast::DEFAULT_STALL_LIMIT,
            min_confidence: 0.0,
            initial_profile: CalibrationProfile::identity(),
        }
    }
}

impl ServiceSettings {
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        let initial_profile = match config.calibration_override() {
            Some(o) => CalibrationProfile::from_overrides(o.offset_x, o.offset_y, o.scale_x, o.scale_y)
                .context("invalid calibration override")?,
            None => CalibrationProfile::identity(),
        };
        Ok(Self {
            freshness_window: config.freshness_window(),
            source_timeout: config.source_timeout(),
            stream_buffer: config.stream_buffer,
            stream_stall_limit: config.stream_stall_limit,
            min_confidence: config.min_confidence,
            initial_profile,
        })
    }
}

#[derive(Default)]
struct Runtime {
    control_tx: Option<Sender<ControlCommand>>,
    ingress: Option<WorkerHandle>,
    started: bool,
    stopped: bool,
}

pub struct GazeService {
    settings: ServiceSettings,
    bus: Arc<GazeStateBus>,
    broadcaster: StreamBroadcaster,
    workers: WorkerRegistry,
    runtime: Mutex<Runtime>,
}

impl GazeService {
    pub fn new(settings: ServiceSettings, workers: WorkerRegistry) -> Self {
        let broadcaster = StreamBroadcaster::new(settings.stream_buffer, settings.stream_stall_limit);
        let bus = Arc::new(GazeStateBus::new());
        let initial_profile = settings.initial_profile;
        // Coefficients are visible before the first sample; `calibrated` waits for it.
        if let Err(e) = bus.update(|s| s.profile = initial_profile) {
            warn!("Ignoring initial calibration profile: {}", e);
        }
        Self {
            settings,
            bus,
            broadcaster,
            workers,
            runtime: Mutex::new(Runtime::default()),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Spawn the ingress loop over `source`. A service starts at most once.
    pub fn start(&self, source: Box<dyn SampleSource>) -> Result<()> {
        let mut rt = self.runtime();
        if rt.stopped {
            bail!("service instance is stopped; create a new one to restart");
        }
        if rt.started {
            bail!("service already started");
        }

        let source_name = source.name().to_string();
        self.bus
            .update(|s| s.phase = ServicePhase::Initializing)
            .context("enter initializing phase")?;

        let (control_tx, control_rx) = unbounded();
        let ingress = IngressLoop::new(
            source,
            Arc::clone(&self.bus),
            self.broadcaster.clone(),
            control_rx,
            self.settings.source_timeout,
            self.settings.initial_profile,
        );
        let broadcaster = self.broadcaster.clone();
        let handle = self
            .workers
            .spawn(INGRESS_WORKER, move || match ingress.run() {
                IngressExit::Stopped => {}
                IngressExit::SourceEnded(e) => {
                    error!("Ingress loop exited: {}", e);
                    broadcaster.close_all();
                }
            })
            .context("spawn ingress loop")?;

        rt.control_tx = Some(control_tx);
        rt.ingress = Some(handle);
        rt.started = true;
        info!("Gaze service started with source '{}'", source_name);
        Ok(())
    }

    /// Cooperative shutdown: signal the ingress loop, wait for it, reset state,
    /// then close every stream subscriber. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let (control_tx, ingress) = {
            let mut rt = self.runtime();
            if rt.stopped {
                return Ok(());
            }
            rt.stopped = true;
            (rt.control_tx.take(), rt.ingress.take())
        };

        if let Some(tx) = control_tx {
            // The loop may already have exited on source end.
            let _ = tx.send(ControlCommand::Stop);
        }
        if let Some(handle) = ingress {
            if handle.join().is_err() {
                error!("Ingress loop panicked before shutdown");
            }
        }
        self.bus.teardown();
        self.broadcaster.close_all();
        info!("Gaze service stopped");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<ServiceState> {
        self.bus.snapshot()
    }

    pub fn watch_state(&self) -> watch::Receiver<Arc<ServiceState>> {
        self.bus.watch_state()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_state(&self.snapshot(), Instant::now(), self.settings.freshness_window)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.broadcaster.subscribers()
    }

    pub fn evicted_subscribers(&self) -> u64 {
        self.broadcaster.evicted_total()
    }

    pub fn begin_calibration(&self) -> Result<(), ServiceError> {
        self.request(|reply| ControlCommand::BeginCalibration { reply })
    }

    pub fn capture_point(
        &self,
        target_x: f64,
        target_y: f64,
    ) -> Result<(CalibrationPoint, usize), ServiceError> {
        self.request(|reply| ControlCommand::CapturePoint {
            target_x,
            target_y,
            reply,
        })
    }

    pub fn add_point(&self, point: CalibrationPoint) -> Result<usize, ServiceError> {
        self.request(|reply| ControlCommand::AddPoint { point, reply })
    }

    pub fn finish_calibration(&self) -> Result<CalibrationProfile, ServiceError> {
        self.request(|reply| ControlCommand::FinishCalibration { reply })
    }

    pub fn abort_calibration(&self) -> Result<(), ServiceError> {
        self.request(|reply| ControlCommand::AbortCalibration { reply })
    }

    /// Send a command to the ingress thread and block for its answer.
    fn request<T, F>(&self, build: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Reply<T>) -> ControlCommand,
    {
        let control_tx = {
            let rt = self.runtime();
            if rt.stopped {
                return Err(ServiceError::Stopped);
            }
            match &rt.control_tx {
                Some(tx) => tx.clone(),
                None => return Err(ServiceError::NotInitialized),
            }
        };
        let state = self.snapshot();
        if state.phase == ServicePhase::Stopped {
            return Err(ServiceError::Stopped);
        }

        let (reply, pending) = Reply::channel();
        if control_tx.send(build(reply)).is_err() {
            return Err(ServiceError::Stopped);
        }
        // One source poll plus slack for the command itself.
        pending.wait(self.settings.source_timeout + Duration::from_secs(1))
    }
}

impl Drop for GazeService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop gaze service on drop: {}", e);
        }
    }
}
