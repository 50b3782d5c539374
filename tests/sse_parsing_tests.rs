use gazer::client::{GazeClient, SseFrame, SseParser};
use gazer::core::source::SimulatedSource;
use gazer::core::GazePayload;
use gazer::daemon::server::http::{AppState, spawn_http_server};
use gazer::daemon::service::{GazeService, ServiceSettings};
use gazer::util::config::AppConfig;
use gazer::util::threading::WorkerRegistry;
use std::sync::Arc;
use std::time::Duration;

fn assemble_sse_payload(json: &str) -> String {
    format!("data: {}\n\n", json)
}

fn frames_from(payload: &str) -> Vec<SseFrame> {
    let mut parser = SseParser::new();
    payload
        .lines()
        .filter_map(|line| parser.feed_line(line))
        .collect()
}

#[test]
fn parses_single_sse_event_into_payload() {
    let gaze = GazePayload {
        x: 0.25,
        y: 0.5,
        confidence: 0.9,
        timestamp: 1_700_000_000.5,
    };
    let json = serde_json::to_string(&gaze).unwrap();
    let frames = frames_from(&assemble_sse_payload(&json));
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event, None);
    let parsed: GazePayload = serde_json::from_str(&frames[0].data).unwrap();
    assert_eq!(parsed, gaze);
}

#[test]
fn parses_multiple_events_with_drop_notice() {
    let mut payload = String::new();
    for i in 0..3u32 {
        let gaze = GazePayload {
            x: f64::from(i),
            y: 0.0,
            confidence: 1.0,
            timestamp: f64::from(i),
        };
        payload.push_str(&assemble_sse_payload(&serde_json::to_string(&gaze).unwrap()));
        if i == 1 {
            payload.push_str("event: dropped\ndata: {\"dropped\":5}\n\n");
        }
    }
    payload.push_str(":\n\n");

    let frames = frames_from(&payload);
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[2].event.as_deref(), Some("dropped"));
    let notice: serde_json::Value = serde_json::from_str(&frames[2].data).unwrap();
    assert_eq!(notice["dropped"], 5);
    let last: GazePayload = serde_json::from_str(&frames[3].data).unwrap();
    assert_eq!(last.x, 2.0);
}

#[test]
fn client_follows_live_stream() {
    let workers = WorkerRegistry::new();
    let settings = ServiceSettings {
        source_timeout: Duration::from_millis(10),
        ..ServiceSettings::default()
    };
    let service = Arc::new(GazeService::new(settings, workers.clone()));
    let config = AppConfig::default();
    let server = spawn_http_server(
        "127.0.0.1:0".parse().unwrap(),
        AppState::new(Arc::clone(&service), &config),
        &workers,
    )
    .expect("spawn server");
    let client = GazeClient::new(server.local_addr());

    let gaze = client.get("/gaze").unwrap();
    assert_eq!(gaze.status, 503);

    service
        .start(Box::new(SimulatedSource::new(200.0)))
        .expect("start service");

    let mut frames = Vec::new();
    client
        .stream(|frame| {
            frames.push(frame);
            frames.len() < 5
        })
        .expect("stream");
    assert_eq!(frames.len(), 5);
    let mut last_ts = 0.0;
    for frame in &frames {
        assert_eq!(frame.event, None);
        let payload: GazePayload = serde_json::from_str(&frame.data).unwrap();
        assert!(payload.timestamp >= last_ts);
        assert!((0.0..=1.0).contains(&payload.x));
        last_ts = payload.timestamp;
    }

    let gaze = client.get("/gaze").unwrap();
    assert_eq!(gaze.status, 200);
    let payload: GazePayload = gaze.json().unwrap();
    assert!((0.0..=1.0).contains(&payload.confidence));

    let body = serde_json::json!({ "raw_x": 0.1, "raw_y": 0.1, "target_x": 1.0, "target_y": 1.0 });
    let rejected = client.post_json("/calibration/point", &body).unwrap();
    assert_eq!(rejected.status, 409);

    service.stop().unwrap();
    server.stop();
}
