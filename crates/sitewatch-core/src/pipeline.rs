//! Per-stream frame pipeline: router, then tracker, in timestamp order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::{FrameStats, Router, RouterConfig, SecondaryVerifier};
use crate::tracker::{Tracker, TrackerConfig, TrackerStats};
use crate::types::{DeduplicatedEvent, Detection};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Track state is order-sensitive; frames must arrive in
    /// non-decreasing timestamp order within a stream.
    #[error("stale frame for stream {stream}: {received:?} precedes {last:?}")]
    StaleFrame {
        stream: String,
        received: Duration,
        last: Duration,
    },
}

/// One frame's worth of primary-detector output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Offset from the stream epoch.
    pub timestamp: Duration,
    pub detections: Vec<Detection>,
}

/// Everything one frame produced.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub events: Vec<DeduplicatedEvent>,
    pub stats: FrameStats,
}

/// Decision state for a single stream.
///
/// Pure call-in/state-out: no I/O beyond the verifier capability handed
/// to `process_frame`. One pipeline must be mutated by exactly one worker
/// at a time; streams never share pipelines.
#[derive(Debug)]
pub struct Pipeline {
    stream: String,
    router: Router,
    tracker: Tracker,
    last_timestamp: Option<Duration>,
}

impl Pipeline {
    pub fn new(
        stream: impl Into<String>,
        router_config: RouterConfig,
        tracker_config: TrackerConfig,
    ) -> Self {
        let stream = stream.into();
        Self {
            router: Router::new(router_config),
            tracker: Tracker::new(stream.clone(), tracker_config),
            stream,
            last_timestamp: None,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracker.live_tracks()
    }

    /// Route one frame, update track state, and return the deduplicated
    /// events it produced.
    ///
    /// An out-of-order frame is rejected whole with `StaleFrame` and
    /// mutates nothing; the caller may drop or re-request it.
    pub fn process_frame<V: SecondaryVerifier>(
        &mut self,
        frame: &Frame,
        verifier: &V,
    ) -> Result<FrameOutput, PipelineError> {
        if let Some(last) = self.last_timestamp {
            if frame.timestamp < last {
                return Err(PipelineError::StaleFrame {
                    stream: self.stream.clone(),
                    received: frame.timestamp,
                    last,
                });
            }
        }

        let (candidates, stats) = self
            .router
            .route_frame(&frame.detections, frame.timestamp, verifier);
        let events = self.tracker.observe(&candidates, frame.timestamp);
        self.last_timestamp = Some(frame.timestamp);

        tracing::debug!(
            stream = %self.stream,
            timestamp = ?frame.timestamp,
            persons = stats.persons,
            violations = stats.violations,
            emitted = events.len(),
            verifier_activations = stats.verifier_activations,
            live_tracks = self.tracker.live_tracks(),
            "frame processed"
        );

        Ok(FrameOutput { events, stats })
    }
}
