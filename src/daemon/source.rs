use crate::util::config::{AppConfig, SourceKind};
use crate::util::logging::{debug, info, warn};
use crate::util::threading::{WorkerHandle, WorkerRegistry};
use anyhow::{Context, Result};
use gazer_core::RawSample;
use gazer_core::SampleSource;
use gazer_core::source::{ChannelSource, SimulatedSource};
use std::io::{BufRead, BufReader};

// Lines waiting for the ingress loop; a stuck estimator cannot grow memory unbounded.
const LINE_READER_BACKLOG: usize = 256;

/// Source selected by configuration, plus the reader worker when there is one.
pub struct ConfiguredSource {
    pub source: Box<dyn SampleSource>,
    pub reader: Option<WorkerHandle>,
}

pub fn build_source(config: &AppConfig, workers: &WorkerRegistry) -> Result<ConfiguredSource> {
    match config.source {
        SourceKind::Simulated => {
            info!("Using simulated gaze source at {} Hz", config.simulated_rate_hz);
            Ok(ConfiguredSource {
                source: Box::new(SimulatedSource::new(config.simulated_rate_hz)),
                reader: None,
            })
        }
        SourceKind::Stdin => {
            info!("Reading newline-delimited JSON samples from stdin");
            let (source, reader) = spawn_line_reader("stdin", BufReader::new(std::io::stdin()), workers)?;
            Ok(ConfiguredSource {
                source: Box::new(source),
                reader: Some(reader),
            })
        }
    }
}

/// Parse one `{"x": .., "y": .., "confidence": ..}` line. Blank lines yield `None`.
pub fn parse_sample_line(line: &str) -> Result<Option<RawSample>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let raw: RawSample =
        serde_json::from_str(trimmed).with_context(|| format!("malformed sample line '{trimmed}'"))?;
    Ok(Some(raw))
}

/// Feed lines from `reader` into a channel source on a dedicated worker.
/// End of input (or a read error) ends the source.
pub fn spawn_line_reader<R>(
    name: &str,
    reader: R,
    workers: &WorkerRegistry,
) -> Result<(ChannelSource, WorkerHandle)>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(LINE_READER_BACKLOG);
    let label = name.to_string();
    let handle = workers
        .spawn(format!("{name}-reader"), move || {
            let mut accepted = 0u64;
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Read error on {}: {}", label, e);
                        break;
                    }
                };
                match parse_sample_line(&line) {
                    Ok(Some(raw)) => {
                        if tx.send(raw).is_err() {
                            debug!("Ingress loop gone; {} reader exiting", label);
                            return;
                        }
                        accepted += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Skipping sample line: {:#}", e),
                }
            }
            info!("{} reached end of input after {} samples", label, accepted);
        })
        .with_context(|| format!("spawn {name} reader"))?;
    Ok((ChannelSource::new(name, rx), handle))
}
