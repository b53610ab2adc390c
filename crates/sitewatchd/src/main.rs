use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use sitewatch_core::VerifyOutcome;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use sitewatchd::config::Config;
use sitewatchd::coordinator::Coordinator;
use sitewatchd::ingest::FrameRecord;
use sitewatchd::sink::{EventSink, JsonlSink, TracingSink};
use sitewatchd::stream::StreamError;
use sitewatchd::verifier::{StaticBackend, VerifierPool};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var_os("SITEWATCH_CONFIG").map(PathBuf::from);
    let config =
        Config::load(config_path.as_deref()).context("refusing to start on bad configuration")?;
    tracing::info!(config = ?config_path, "sitewatchd starting");

    let pool = build_pool(&config)?;
    let sink: Arc<Mutex<dyn EventSink>> = match &config.events_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "appending events to file");
            Arc::new(Mutex::new(JsonlSink::open(path)?))
        }
        None => Arc::new(Mutex::new(TracingSink)),
    };
    let mut coordinator = Coordinator::new(config, pool, sink);

    tracing::info!("sitewatchd ready, reading frame records from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            line = lines.next_line() => {
                match line.context("failed to read frame records")? {
                    Some(line) => handle_line(&mut coordinator, &line),
                    None => {
                        tracing::info!("frame input closed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(streams = coordinator.live_streams(), "sitewatchd shutting down");
    Ok(())
}

/// One ingest line, enqueued fire-and-forget so a slow stream never
/// holds up the others. Malformed records and dropped frames are logged;
/// neither stops the daemon.
fn handle_line(coordinator: &mut Coordinator, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let record = match FrameRecord::parse(line) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed frame record");
            return;
        }
    };
    match coordinator.dispatch_record(&record) {
        Ok(()) => {}
        Err(StreamError::Overloaded) => {
            tracing::warn!(stream = %record.stream, "stream queue full, dropping frame");
        }
        Err(err) => {
            tracing::error!(stream = %record.stream, error = %err, "stream failure");
        }
    }
}

fn build_pool(config: &Config) -> Result<VerifierPool> {
    if !config.verifier.enabled {
        tracing::info!("secondary verifier disabled");
        return Ok(VerifierPool::disabled());
    }
    match config.verifier.backend.as_str() {
        "static" => {
            let outcome = match config.verifier.static_outcome.as_str() {
                "present" => VerifyOutcome::Present,
                "absent" => VerifyOutcome::Absent,
                "unknown" => VerifyOutcome::Unknown,
                other => bail!("invalid static verifier outcome '{other}'"),
            };
            tracing::info!(
                workers = config.verifier.workers,
                queue_depth = config.verifier.queue_depth,
                timeout_ms = config.verifier.timeout_ms,
                "starting static verifier pool"
            );
            Ok(VerifierPool::spawn(
                move |_| StaticBackend::new(outcome),
                config.verifier.workers,
                config.verifier.queue_depth,
                config.verifier_timeout(),
            ))
        }
        other => bail!("unknown verifier backend '{other}'"),
    }
}
