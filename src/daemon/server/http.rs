use crate::daemon::error::ServiceError;
use crate::daemon::server::rate_limit::{Decision, RateLimiter};
use crate::daemon::service::GazeService;
use crate::util::config::{AppConfig, SourceKind};
use crate::util::logging::{debug, info, warn};
use crate::util::threading::{WorkerHandle, WorkerRegistry};
use anyhow::{Context, Result, anyhow};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use gazer_core::{
    CalibrationPoint, CalibrationProfile, CalibrationError, GazePayload, Health, HealthReport,
    ServicePhase, StreamItem,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Effective settings echoed on `/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub source: String,
    pub freshness_window_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub stream_buffer: usize,
    pub stream_stall_limit: u32,
    pub min_confidence: f64,
}

impl ConfigSummary {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let source = match config.source {
            SourceKind::Simulated => "simulated",
            SourceKind::Stdin => "stdin",
        };
        Self {
            source: source.to_string(),
            freshness_window_ms: config.freshness_window_ms,
            rate_limit_max: config.rate_limit_max,
            rate_limit_window_ms: config.rate_limit_window_ms,
            stream_buffer: config.stream_buffer,
            stream_stall_limit: config.stream_stall_limit,
            min_confidence: config.min_confidence,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GazeService>,
    pub limiter: Arc<RateLimiter>,
    pub config: ConfigSummary,
}

impl AppState {
    pub fn new(service: Arc<GazeService>, config: &AppConfig) -> Self {
        Self {
            service,
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window(),
            )),
            config: ConfigSummary::from_app_config(config),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
}

fn error_response(status: StatusCode, code: &str, reason: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: code.to_string(),
        reason: reason.into(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotInitialized | ServiceError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::InvalidPhase { .. } | ServiceError::NoRawSample => StatusCode::CONFLICT,
            ServiceError::InvalidPoint(_) => StatusCode::BAD_REQUEST,
            ServiceError::Calibration(CalibrationError::InsufficientPoints { .. })
            | ServiceError::Calibration(CalibrationError::DegenerateGeometry(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.code(), self.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberView {
    pub id: u64,
    pub connected_at: DateTime<Utc>,
    pub queued: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub phase: ServicePhase,
    pub health: Health,
    pub initialized: bool,
    pub running: bool,
    pub calibrated: bool,
    pub has_gaze: bool,
    pub gaze: Option<GazePayload>,
    pub sample_age_ms: Option<u64>,
    pub samples_published: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub profile: CalibrationProfile,
    pub subscribers: Vec<SubscriberView>,
    pub evicted_subscribers: u64,
    pub workers: Vec<WorkerView>,
    pub config: ConfigSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub method: String,
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBody {
    pub service: String,
    pub version: String,
    pub description: String,
    pub endpoints: Vec<EndpointInfo>,
    pub notes: Vec<String>,
}

const ENDPOINTS: &[(&str, &str, &str)] = &[
    ("GET", "/", "service metadata and endpoint list"),
    ("GET", "/gaze", "latest calibrated gaze sample"),
    ("GET", "/health", "health classification with service flags"),
    ("GET", "/status", "detailed service status"),
    ("GET", "/stream", "server-sent events stream of gaze samples"),
    ("POST", "/calibration/start", "begin a calibration session"),
    ("POST", "/calibration/point", "record a calibration point"),
    ("POST", "/calibration/finish", "fit and apply the calibration profile"),
    ("POST", "/calibration/abort", "discard the calibration session"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PointRequest {
    pub target_x: f64,
    pub target_y: f64,
    #[serde(default)]
    pub raw_x: Option<f64>,
    #[serde(default)]
    pub raw_y: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseBody {
    pub phase: ServicePhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PointBody {
    pub point: CalibrationPoint,
    pub points_collected: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinishBody {
    pub profile: CalibrationProfile,
}

pub fn router(state: AppState) -> Router {
    let polled = Router::new()
        .route("/", get(index_handler))
        .route("/gaze", get(gaze_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/stream", get(stream_handler))
        .route("/calibration/start", post(calibration_start))
        .route("/calibration/point", post(calibration_point))
        .route("/calibration/finish", post(calibration_finish))
        .route("/calibration/abort", post(calibration_abort))
        .merge(polled)
        .fallback(not_found)
        .with_state(state)
}

async fn rate_limit(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let client = connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    match state.limiter.check(client, Instant::now()) {
        Decision::Allow => next.run(request).await,
        Decision::Limited(retry_after) => {
            debug!("Rate limited {} on {}", client, request.uri().path());
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!(
                    "more than {} requests within {} ms",
                    state.limiter.max_requests(),
                    state.limiter.window().as_millis()
                ),
            );
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
            response
        }
    }
}

async fn index_handler(State(state): State<AppState>) -> Json<IndexBody> {
    Json(IndexBody {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Real-time gaze coordinate service".to_string(),
        endpoints: ENDPOINTS
            .iter()
            .map(|(method, path, description)| EndpointInfo {
                method: method.to_string(),
                path: path.to_string(),
                description: description.to_string(),
            })
            .collect(),
        notes: vec![format!(
            "min_confidence {} is informational: samples below it are still published \
             with their confidence, consumers decide whether to use them",
            state.config.min_confidence
        )],
    })
}

async fn gaze_handler(State(state): State<AppState>) -> Result<Json<GazePayload>, ServiceError> {
    state
        .service
        .snapshot()
        .gaze()
        .map(Json)
        .ok_or(ServiceError::NotInitialized)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.health())
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusBody>, ServiceError> {
    let snapshot = state.service.snapshot();
    if !snapshot.initialized {
        return Err(ServiceError::NotInitialized);
    }
    let now = Instant::now();
    let health = HealthReport::from_state(&snapshot, now, state.service.settings().freshness_window);
    let subscribers = state
        .service
        .subscribers()
        .into_iter()
        .map(|s| SubscriberView {
            id: s.id,
            connected_at: s.connected_at,
            queued: s.queued,
            dropped: s.dropped_total,
        })
        .collect();
    let workers = state
        .service
        .workers()
        .snapshot()
        .into_iter()
        .map(|w| WorkerView {
            name: w.name,
            status: w.status.as_str().to_string(),
        })
        .collect();

    Ok(Json(StatusBody {
        phase: snapshot.phase,
        health: health.status,
        initialized: snapshot.initialized,
        running: snapshot.running,
        calibrated: snapshot.calibrated,
        has_gaze: snapshot.has_gaze(),
        gaze: snapshot.gaze(),
        sample_age_ms: snapshot
            .last_sample
            .map(|s| u64::try_from(s.age(now).as_millis()).unwrap_or(u64::MAX)),
        samples_published: snapshot.samples_published,
        started_at: snapshot.started_at,
        profile: snapshot.profile,
        subscribers,
        evicted_subscribers: state.service.evicted_subscribers(),
        workers,
        config: state.config.clone(),
    }))
}

fn stream_event(item: StreamItem) -> Event {
    match item {
        StreamItem::Sample(sample) => {
            let data = serde_json::to_string(&sample.payload()).unwrap_or_else(|_| "{}".into());
            Event::default().data(data)
        }
        StreamItem::Dropped(dropped) => Event::default()
            .event("dropped")
            .data(serde_json::json!({ "dropped": dropped }).to_string()),
    }
}

async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.service.subscribe();
    debug!("Stream subscriber {} connected", subscription.id());
    let stream = stream::unfold(subscription, |mut subscription| async move {
        let item = subscription.recv().await?;
        Some((Ok(stream_event(item)), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// Calibration commands block on the ingress thread's reply.
async fn blocking<T, F>(service: Arc<GazeService>, call: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&GazeService) -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&service))
        .await
        .unwrap_or_else(|e| Err(ServiceError::Internal(e.to_string())))
}

async fn calibration_start(State(state): State<AppState>) -> Result<Json<PhaseBody>, ServiceError> {
    blocking(state.service, |service| service.begin_calibration()).await?;
    info!("Calibration session started over HTTP");
    Ok(Json(PhaseBody {
        phase: ServicePhase::Calibrating,
    }))
}

async fn calibration_point(
    State(state): State<AppState>,
    payload: Result<Json<PointRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "bad_request", rejection.body_text());
        }
    };
    let outcome = match (request.raw_x, request.raw_y) {
        (Some(raw_x), Some(raw_y)) => {
            let point = CalibrationPoint::new(raw_x, raw_y, request.target_x, request.target_y);
            blocking(state.service, move |service| service.add_point(point))
                .await
                .map(|points_collected| PointBody {
                    point,
                    points_collected,
                })
        }
        (None, None) => blocking(state.service, move |service| {
            service.capture_point(request.target_x, request.target_y)
        })
        .await
        .map(|(point, points_collected)| PointBody {
            point,
            points_collected,
        }),
        _ => Err(ServiceError::InvalidPoint(
            "raw_x and raw_y must be given together",
        )),
    };
    match outcome {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn calibration_finish(
    State(state): State<AppState>,
) -> Result<Json<FinishBody>, ServiceError> {
    let profile = blocking(state.service, |service| service.finish_calibration()).await?;
    info!(
        "Calibration applied over HTTP ({} points, rms {:.4})",
        profile.points_used, profile.rms_error
    );
    Ok(Json(FinishBody { profile }))
}

async fn calibration_abort(State(state): State<AppState>) -> Result<Json<PhaseBody>, ServiceError> {
    blocking(state.service, |service| service.abort_calibration()).await?;
    Ok(Json(PhaseBody {
        phase: ServicePhase::Running,
    }))
}

async fn not_found(request: Request) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {} {}", request.method(), request.uri().path()),
    )
}

/// Running HTTP listener; dropping it without `stop` leaves the thread detached.
pub struct HttpServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<WorkerHandle>,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("HTTP server thread panicked during shutdown");
            }
        }
    }
}

pub fn spawn_http_server(
    addr: SocketAddr,
    state: AppState,
    workers: &WorkerRegistry,
) -> Result<HttpServerHandle> {
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<SocketAddr, String>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(state);

    let worker = workers
        .spawn("http-server", move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("http-worker")
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("build runtime: {e}")));
                    return;
                }
            };
            rt.block_on(serve(addr, app, ready_tx, shutdown_rx));
        })
        .context("spawn HTTP server thread")?;

    match ready_rx.recv_timeout(READY_TIMEOUT) {
        Ok(Ok(local_addr)) => Ok(HttpServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        }),
        Ok(Err(msg)) => {
            let _ = worker.join();
            Err(anyhow!("HTTP server failed to start: {msg}"))
        }
        Err(_) => Err(anyhow!(
            "HTTP server failed to signal readiness within {}ms",
            READY_TIMEOUT.as_millis()
        )),
    }
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    ready_tx: crossbeam_channel::Sender<Result<SocketAddr, String>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("bind {addr}: {e}")));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("resolve local address: {e}")));
            return;
        }
    };
    ready_tx.send(Ok(local_addr)).ok();
    info!("HTTP server listening on http://{}", local_addr);

    loop {
        let (stream, remote) = tokio::select! {
            _ = &mut shutdown_rx => {
                info!("HTTP server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let service = app.clone().layer(Extension(ConnectInfo(remote)));

        tokio::task::spawn(async move {
            let hyper_service = TowerToHyperService::new(service);
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, hyper_service)
                .await
            {
                // Stream consumers routinely hang up mid-response.
                if err.is_incomplete_message() {
                    debug!("Client {} disconnected mid-stream", remote);
                } else {
                    warn!("Error serving connection from {}: {}", remote, err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::service::ServiceSettings;
    use axum::body::Body;
    use crossbeam_channel::Sender;
    use gazer_core::RawSample;
    use gazer_core::source::ChannelSource;
    use std::io::{Read, Write};
    use tower::ServiceExt;

    fn test_state(rate_limit_max: u32) -> AppState {
        let service = Arc::new(GazeService::new(
            ServiceSettings::default(),
            WorkerRegistry::new(),
        ));
        let config = AppConfig {
            rate_limit_max,
            ..AppConfig::default()
        };
        AppState::new(service, &config)
    }

    fn started_state() -> (AppState, Sender<RawSample>) {
        let state = test_state(1000);
        let (tx, rx) = crossbeam_channel::unbounded();
        state
            .service
            .start(Box::new(ChannelSource::new("test", rx)))
            .expect("start service");
        (state, tx)
    }

    fn wait_for(state: &AppState, pred: impl Fn(&gazer_core::ServiceState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred(&state.service.snapshot()) {
            assert!(Instant::now() < deadline, "state never reached expectation");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get_req(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn gaze_before_first_sample_is_not_initialized() {
        let app = router(test_state(100));
        let (status, body) = send(&app, get_req("/gaze")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "not_initialized");
        assert!(body.get("x").is_none());

        let (status, body) = send(&app, get_req("/status")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "not_initialized");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn health_is_always_ok_and_reports_flags() {
        let app = router(test_state(100));
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "unavailable");
        assert_eq!(body["service"]["initialized"], false);
        assert_eq!(body["service"]["has_gaze"], false);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn gaze_and_status_after_sample() {
        let (state, tx) = started_state();
        tx.send(RawSample::new(0.25, 0.75, 0.8)).unwrap();
        wait_for(&state, |s| s.initialized);
        let app = router(state.clone());

        let (status, body) = send(&app, get_req("/gaze")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["x"], 0.25);
        assert_eq!(body["y"], 0.75);
        assert_eq!(body["confidence"], 0.8);
        assert!(body["timestamp"].as_f64().unwrap() > 0.0);

        let (status, body) = send(&app, get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "running");
        assert_eq!(body["samples_published"], 1);
        assert_eq!(body["config"]["source"], "simulated");
        assert!(
            body["workers"]
                .as_array()
                .unwrap()
                .iter()
                .any(|w| w["name"] == "gaze-ingress")
        );
        state.service.stop().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn poll_routes_are_rate_limited() {
        let app = router(test_state(2));
        assert_eq!(send(&app, get_req("/health")).await.0, StatusCode::OK);
        assert_eq!(send(&app, get_req("/health")).await.0, StatusCode::OK);

        let response = app.clone().oneshot(get_req("/gaze")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "rate_limited");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn calibration_round_trip_over_http() {
        let (state, tx) = started_state();
        tx.send(RawSample::new(0.5, 0.5, 1.0)).unwrap();
        wait_for(&state, |s| s.initialized);
        let app = router(state.clone());

        let (status, body) = send(&app, post_json("/calibration/start", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "calibrating");

        let (status, body) = send(&app, post_json("/calibration/finish", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "insufficient_points");

        // A failed fit ends the session.
        let (status, _) = send(&app, post_json("/calibration/start", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);

        let pairs = [
            (0.0, 0.0, 10.0, 20.0),
            (1.0, 0.0, 12.0, 20.0),
            (0.0, 1.0, 10.0, 23.0),
            (1.0, 1.0, 12.0, 23.0),
        ];
        for (i, (raw_x, raw_y, target_x, target_y)) in pairs.iter().enumerate() {
            let (status, body) = send(
                &app,
                post_json(
                    "/calibration/point",
                    serde_json::json!({
                        "raw_x": raw_x,
                        "raw_y": raw_y,
                        "target_x": target_x,
                        "target_y": target_y,
                    }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["points_collected"], i + 1);
        }

        let (status, body) = send(&app, post_json("/calibration/finish", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let profile: CalibrationProfile = serde_json::from_value(body["profile"].clone()).unwrap();
        assert!((profile.scale_x - 2.0).abs() < 1e-9);
        assert!((profile.scale_y - 3.0).abs() < 1e-9);
        assert!((profile.offset_x - 10.0).abs() < 1e-9);
        assert!((profile.offset_y - 20.0).abs() < 1e-9);

        tx.send(RawSample::new(0.5, 0.5, 1.0)).unwrap();
        wait_for(&state, |s| s.calibrated && s.samples_published >= 2);
        let (_, body) = send(&app, get_req("/gaze")).await;
        assert!((body["x"].as_f64().unwrap() - 11.0).abs() < 1e-9);
        assert!((body["y"].as_f64().unwrap() - 21.5).abs() < 1e-9);
        state.service.stop().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn calibration_point_rejects_bad_bodies() {
        let (state, tx) = started_state();
        tx.send(RawSample::new(0.5, 0.5, 1.0)).unwrap();
        wait_for(&state, |s| s.initialized);
        let app = router(state.clone());

        let malformed = axum::http::Request::post("/calibration/point")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, body) = send(
            &app,
            post_json(
                "/calibration/point",
                serde_json::json!({"raw_x": 1.0, "target_x": 1.0, "target_y": 1.0}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_point");

        // Outside a calibration session.
        let (status, body) = send(
            &app,
            post_json("/calibration/point", serde_json::json!({"target_x": 1.0, "target_y": 1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_phase");
        state.service.stop().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn calibration_on_stopped_service_is_unavailable() {
        let (state, _tx) = started_state();
        state.service.stop().unwrap();
        let app = router(state);
        let (status, body) = send(&app, post_json("/calibration/start", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service_stopped");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn index_lists_endpoints_and_unknown_routes_404() {
        let app = router(test_state(100));
        let (status, body) = send(&app, get_req("/")).await;
        assert_eq!(status, StatusCode::OK);
        let endpoints = body["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), ENDPOINTS.len());
        assert!(endpoints.iter().any(|e| e["path"] == "/stream"));
        let note = body["notes"][0].as_str().unwrap();
        assert!(note.starts_with("min_confidence"));
        assert!(note.contains("informational"));

        let (status, body) = send(&app, get_req("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_handler_registers_subscriber_until_dropped() {
        let state = test_state(100);
        let sse = stream_handler(State(state.clone())).await;
        let response = sse.into_response();
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .map(|v| v.to_str().unwrap()),
            Some("text/event-stream"),
        );
        assert_eq!(state.service.subscribers().len(), 1);
        drop(response);
        assert!(state.service.subscribers().is_empty());
    }

    #[test]
    fn server_answers_over_tcp_and_stops() {
        let state = test_state(100);
        let workers = WorkerRegistry::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = spawn_http_server(addr, state, &workers).expect("spawn server");
        let local = handle.local_addr();
        assert_ne!(local.port(), 0);

        let mut conn = std::net::TcpStream::connect(local).expect("connect");
        conn.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"unavailable\""));

        handle.stop();
        assert!(workers.active_names().is_empty());
    }

    #[test]
    fn bind_failure_is_reported() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap();
        let err = spawn_http_server(taken, test_state(100), &WorkerRegistry::new())
            .err()
            .expect("bind should fail");
        assert!(err.to_string().contains("failed to start"));
    }
}
