use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use gazer::client::{GazeClient, Response, SseFrame};
use gazer::core::GazePayload;
use gazer::util::config::AppConfig;
use log::debug;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gazerctl", about = "Query and calibrate a running gazerd", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon address; defaults to host/port from configuration.
    #[arg(long, global = true)]
    addr: Option<String>,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Latest calibrated gaze sample.
    Gaze,
    Health,
    Status,
    /// Follow the sample stream.
    Watch {
        /// Stop after this many samples.
        #[arg(long)]
        count: Option<usize>,
        /// One compact line per sample instead of raw JSON.
        #[arg(long)]
        pretty: bool,
    },
    Calibrate {
        #[command(subcommand)]
        action: CalibrateAction,
    },
}

#[derive(Subcommand)]
enum CalibrateAction {
    Start,
    /// Record a point; without --raw-x/--raw-y the latest raw sample is captured.
    #[command(allow_negative_numbers = true)]
    Point {
        target_x: f64,
        target_y: f64,
        #[arg(long, requires = "raw_y")]
        raw_x: Option<f64>,
        #[arg(long, requires = "raw_x")]
        raw_y: Option<f64>,
    },
    Finish,
    Abort,
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn resolve_addr(cli: &Cli) -> Result<SocketAddr> {
    match &cli.addr {
        Some(addr) => addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {addr}"))?
            .next()
            .ok_or_else(|| anyhow!("{addr} did not resolve to any address")),
        None => AppConfig::load(cli.config.as_deref())?.socket_addr(),
    }
}

/// Print the body; non-2xx answers become errors carrying the server's reason.
fn print_response(resp: Response) -> Result<()> {
    let value: serde_json::Value = resp
        .json()
        .unwrap_or_else(|_| serde_json::Value::String(resp.body.clone()));
    if resp.is_success() {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    let code = value["error"].as_str().unwrap_or("http_error");
    let reason = value["reason"].as_str().unwrap_or(resp.body.as_str());
    Err(anyhow!("{} ({}): {}", code, resp.status, reason))
}

/// Returns whether the frame carried a sample.
fn print_frame(frame: &SseFrame, pretty: bool) -> bool {
    match frame.event.as_deref() {
        Some("dropped") => {
            eprintln!("stream lagged: {}", frame.data);
            false
        }
        _ if pretty => match serde_json::from_str::<GazePayload>(&frame.data) {
            Ok(g) => {
                println!(
                    "t={:.3} x={:.4} y={:.4} confidence={:.2}",
                    g.timestamp, g.x, g.y, g.confidence
                );
                true
            }
            Err(e) => {
                debug!("Skipping unparseable frame: {}", e);
                false
            }
        },
        _ => {
            println!("{}", frame.data);
            true
        }
    }
}

fn watch(client: &GazeClient, count: Option<usize>, pretty: bool) -> Result<()> {
    let mut seen = 0usize;
    client.stream(|frame| {
        if print_frame(&frame, pretty) {
            seen += 1;
        }
        count.is_none_or(|limit| seen < limit)
    })?;
    if count.is_none_or(|limit| seen < limit) {
        return Err(anyhow!("stream closed by gazerd after {seen} samples"));
    }
    Ok(())
}

fn calibrate(client: &GazeClient, action: CalibrateAction) -> Result<()> {
    let resp = match action {
        CalibrateAction::Start => client.post_json("/calibration/start", &serde_json::json!({}))?,
        CalibrateAction::Point {
            target_x,
            target_y,
            raw_x,
            raw_y,
        } => {
            let mut body = serde_json::json!({ "target_x": target_x, "target_y": target_y });
            if let (Some(raw_x), Some(raw_y)) = (raw_x, raw_y) {
                body["raw_x"] = raw_x.into();
                body["raw_y"] = raw_y.into();
            }
            client.post_json("/calibration/point", &body)?
        }
        CalibrateAction::Finish => client.post_json("/calibration/finish", &serde_json::json!({}))?,
        CalibrateAction::Abort => client.post_json("/calibration/abort", &serde_json::json!({}))?,
    };
    print_response(resp)
}

fn run(cli: Cli) -> Result<()> {
    let addr = resolve_addr(&cli)?;
    let client = GazeClient::new(addr);
    debug!("Talking to gazerd at {}", client.addr());
    match cli.command {
        Commands::Gaze => print_response(client.get("/gaze")?),
        Commands::Health => print_response(client.get("/health")?),
        Commands::Status => print_response(client.get("/status")?),
        Commands::Watch { count, pretty } => watch(&client, count, pretty),
        Commands::Calibrate { action } => calibrate(&client, action),
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
