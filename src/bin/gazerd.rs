use clap::Parser;
use gazer::core::ServicePhase;
use gazer::daemon::server::http::{AppState, spawn_http_server};
use gazer::daemon::service::{GazeService, ServiceSettings};
use gazer::daemon::source::build_source;
use gazer::util::config::AppConfig;
use gazer::util::logging::{self, error, info};
use gazer::util::threading::WorkerRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

#[derive(Parser)]
#[command(name = "gazerd", about = "Real-time gaze coordinate service", version)]
struct Args {
    /// TOML configuration file; `GAZER_*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum Shutdown {
    Interrupted,
    SourceEnded,
}

fn fail(context: &str, e: anyhow::Error) -> ! {
    eprintln!("{context}: {e:#}");
    std::process::exit(1);
}

async fn wait_for_shutdown(service: &GazeService) -> Shutdown {
    let mut states = WatchStream::new(service.watch_state());
    let source_ended = async {
        while let Some(state) = states.next().await {
            if state.phase == ServicePhase::Stopped {
                break;
            }
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            Shutdown::Interrupted
        }
        _ = source_ended => Shutdown::SourceEnded,
    }
}

fn main() {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| fail("Failed to load configuration", e));
    let _log_guard = logging::init(config.log_dir.as_deref(), args.verbose)
        .unwrap_or_else(|e| fail("Failed to initialize logging", e));
    logging::set_run_id(logging::new_run_id());

    info!("Starting gaze service (gazerd {})", env!("CARGO_PKG_VERSION"));

    let settings = ServiceSettings::from_app_config(&config)
        .unwrap_or_else(|e| fail("Invalid service settings", e));
    let workers = WorkerRegistry::new();
    let service = Arc::new(GazeService::new(settings, workers.clone()));

    let configured = build_source(&config, &workers)
        .unwrap_or_else(|e| fail("Failed to open gaze source", e));
    if let Err(e) = service.start(configured.source) {
        fail("Failed to start gaze service", e);
    }

    let bind_addr = config
        .socket_addr()
        .unwrap_or_else(|e| fail("Invalid listen address", e));
    let http = spawn_http_server(bind_addr, AppState::new(Arc::clone(&service), &config), &workers)
        .unwrap_or_else(|e| fail("Failed to start HTTP server", e));
    info!("Serving gaze data on http://{}", http.local_addr());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fail("Failed to build signal runtime", e.into()));
    let shutdown = runtime.block_on(wait_for_shutdown(&service));

    match shutdown {
        Shutdown::Interrupted => info!("Interrupt received, shutting down"),
        Shutdown::SourceEnded => error!("Gaze source ended, shutting down"),
    }
    if let Err(e) = service.stop() {
        error!("Error while stopping gaze service: {}", e);
    }
    http.stop();
    // A stdin reader blocked on input cannot be joined; it dies with the process.
    drop(configured.reader);

    let lingering = workers.active_names();
    if !lingering.is_empty() {
        info!("Exiting with workers still running: {:?}", lingering);
    }
    if matches!(shutdown, Shutdown::SourceEnded) {
        std::process::exit(1);
    }
}
