use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sitewatch_core::{DecisionPath, DisabledVerifier, Pipeline};
use sitewatchd::config::Config;
use sitewatchd::ingest::FrameRecord;

#[derive(Parser)]
#[command(name = "sitewatch", about = "SiteWatch PPE compliance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a captured detection file through the decision pipeline
    Replay {
        /// Capture file, one JSON frame record per line
        file: PathBuf,
        /// Daemon config supplying thresholds; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print only the summary, not each emitted event
        #[arg(long)]
        quiet: bool,
    },
    /// Validate a daemon configuration file
    CheckConfig {
        /// Config file to validate
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Replay {
            file,
            config,
            quiet,
        } => replay(&file, config.as_deref(), quiet),
        Commands::CheckConfig { file } => check_config(&file),
    }
}

/// Offline replay: one pipeline per stream, secondary verifier disabled,
/// so every rescue-path candidate is ruled by the fallback policy.
fn replay(file: &Path, config: Option<&Path>, quiet: bool) -> Result<()> {
    let config = Config::load(config)?;
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("failed to open {}", file.display()))?,
    );

    let mut pipelines: BTreeMap<String, Pipeline> = BTreeMap::new();
    let mut frames = 0usize;
    let mut malformed = 0usize;
    let mut stale = 0usize;
    let mut persons = 0usize;
    let mut violations = 0usize;
    let mut emitted = 0usize;
    let mut verifier_activations = 0usize;
    let mut path_counts = [0usize; 5];

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match FrameRecord::parse(&line) {
            Ok(record) => record,
            Err(err) => {
                malformed += 1;
                eprintln!("line {}: {err}", number + 1);
                continue;
            }
        };
        let pipeline = pipelines.entry(record.stream.clone()).or_insert_with(|| {
            Pipeline::new(
                record.stream.clone(),
                config.router_config(),
                config.tracker_config(),
            )
        });
        match pipeline.process_frame(&record.frame(), &DisabledVerifier) {
            Ok(output) => {
                frames += 1;
                persons += output.stats.persons;
                violations += output.stats.violations;
                verifier_activations += output.stats.verifier_activations;
                for (slot, count) in path_counts.iter_mut().zip(output.stats.path_counts) {
                    *slot += count;
                }
                for event in &output.events {
                    emitted += 1;
                    if !quiet {
                        println!("{}", serde_json::to_string(event)?);
                    }
                }
            }
            Err(err) => {
                stale += 1;
                eprintln!("line {}: {err}", number + 1);
            }
        }
    }

    println!();
    println!("frames processed:  {frames}");
    println!("frames rejected:   {stale} stale, {malformed} malformed");
    println!("persons observed:  {persons}");
    println!("violations seen:   {violations}");
    println!("events emitted:    {emitted}");
    if persons > 0 {
        let bypass = (persons - verifier_activations) as f32 / persons as f32;
        println!("bypass rate:       {:.1}%", bypass * 100.0);
    }
    println!("path distribution:");
    for (path, count) in DecisionPath::ALL.iter().zip(path_counts) {
        println!("  {path:?}: {count}");
    }
    for (stream, pipeline) in &pipelines {
        let stats = pipeline.tracker_stats();
        println!(
            "stream {stream}: {} tracks spawned, {} emitted, {} suppressed",
            stats.tracks_spawned, stats.emitted, stats.suppressed
        );
    }
    Ok(())
}

fn check_config(file: &Path) -> Result<()> {
    let config = Config::load(Some(file))
        .with_context(|| format!("configuration {} rejected", file.display()))?;
    println!("configuration ok");
    println!("  tau_primary:       {}", config.tau_primary);
    println!("  iou_threshold:     {}", config.iou_threshold);
    println!("  cooldown_secs:     {}", config.cooldown_secs);
    println!("  track_timeout:     {}s", config.track_timeout_secs);
    println!(
        "  verifier:          {} ({} workers, {}ms timeout)",
        if config.verifier.enabled {
            config.verifier.backend.as_str()
        } else {
            "disabled"
        },
        config.verifier.workers,
        config.verifier.timeout_ms
    );
    Ok(())
}
