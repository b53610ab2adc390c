//! Event sinks.
//!
//! Emitted events are append-only: each carries the UUID minted by the
//! tracker, so a consumer replaying the file can deduplicate on
//! `(stream, track_id, id)` after a crash mid-write.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sitewatch_core::DeduplicatedEvent;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to open event sink {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write event: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait EventSink: Send {
    fn append(&mut self, event: &DeduplicatedEvent) -> Result<(), SinkError>;
}

/// Wire record: the event plus the wall-clock time it was written.
#[derive(Serialize)]
struct SinkRecord<'a> {
    recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a DeduplicatedEvent,
}

/// One JSON object per line, appended and flushed per event so a crash
/// loses at most the event being written.
pub struct JsonlSink<W: Write + Send> {
    writer: W,
}

impl JsonlSink<BufWriter<File>> {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> EventSink for JsonlSink<W> {
    fn append(&mut self, event: &DeduplicatedEvent) -> Result<(), SinkError> {
        let record = SinkRecord {
            recorded_at: Utc::now(),
            event,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Fallback sink when no events file is configured: structured log only.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn append(&mut self, event: &DeduplicatedEvent) -> Result<(), SinkError> {
        info!(
            id = %event.id,
            stream = %event.stream,
            track_id = event.track_id,
            verdict = ?event.verdict,
            path = ?event.path,
            reason = ?event.reason,
            confidence = event.confidence,
            "violation event"
        );
        Ok(())
    }
}
