//! Per-stream pipeline workers.
//!
//! Each camera stream gets one dedicated OS thread that owns its
//! [`Pipeline`] outright. Frames for a stream are therefore processed
//! strictly in submission order, and no pipeline state is ever shared.
//! The worker also appends its own emitted events to the sink, so one
//! stream's slow verification never delays another stream's ingestion
//! or event output.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sitewatch_core::{Frame, FrameOutput, Pipeline, PipelineError, RouterConfig, TrackerConfig};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::sink::EventSink;
use crate::verifier::{FrameVerifier, VerifierPool};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream worker is gone")]
    WorkerGone,
    #[error("stream queue is full, frame dropped")]
    Overloaded,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

struct FrameRequest {
    frame: Frame,
    /// Frame image for the verifier, when the ingest side has one.
    image: Option<PathBuf>,
    /// Absent for fire-and-forget submissions; the worker then logs
    /// rejections itself.
    reply: Option<oneshot::Sender<Result<FrameOutput, PipelineError>>>,
}

/// Handle to one stream's worker thread. Cheap to clone; dropping every
/// handle shuts the worker down.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<FrameRequest>,
}

impl StreamHandle {
    /// Enqueue a frame without waiting for its result. Never blocks: a
    /// full queue drops the frame and reports `Overloaded`, bounding how
    /// far a stalled stream can fall behind.
    pub fn submit(&self, frame: Frame, image: Option<PathBuf>) -> Result<(), StreamError> {
        let request = FrameRequest {
            frame,
            image,
            reply: None,
        };
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => StreamError::Overloaded,
            TrySendError::Closed(_) => StreamError::WorkerGone,
        })
    }

    /// Enqueue a frame and wait for its output.
    pub async fn process_frame(
        &self,
        frame: Frame,
        image: Option<PathBuf>,
    ) -> Result<FrameOutput, StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = FrameRequest {
            frame,
            image,
            reply: Some(reply_tx),
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| StreamError::WorkerGone)?;
        let result = reply_rx.await.map_err(|_| StreamError::WorkerGone)?;
        Ok(result?)
    }
}

/// Spawn the worker thread owning the pipeline for `stream`.
pub fn spawn_stream_worker(
    stream: String,
    router: RouterConfig,
    tracker: TrackerConfig,
    pool: VerifierPool,
    queue_depth: usize,
    sink: Arc<Mutex<dyn EventSink>>,
) -> StreamHandle {
    let (tx, rx) = mpsc::channel(queue_depth);
    info!(stream = %stream, "starting stream worker");
    std::thread::Builder::new()
        .name(format!("sw-stream-{stream}"))
        .spawn(move || worker_loop(stream, router, tracker, pool, rx, sink))
        .expect("failed to spawn stream worker");
    StreamHandle { tx }
}

fn worker_loop(
    stream: String,
    router: RouterConfig,
    tracker: TrackerConfig,
    pool: VerifierPool,
    mut rx: mpsc::Receiver<FrameRequest>,
    sink: Arc<Mutex<dyn EventSink>>,
) {
    let mut pipeline = Pipeline::new(stream.clone(), router, tracker);
    while let Some(request) = rx.blocking_recv() {
        let verifier = FrameVerifier::new(&pool, &stream, request.image.as_deref());
        let result = pipeline.process_frame(&request.frame, &verifier);

        match &result {
            Ok(output) => sink_events(&sink, &stream, output),
            Err(err) if request.reply.is_none() => {
                warn!(stream = %stream, error = %err, "frame rejected");
            }
            Err(_) => {}
        }

        if let Some(reply) = request.reply {
            // Fails only when the caller stopped waiting; state already
            // advanced, so nothing to roll back.
            let _ = reply.send(result);
        }
    }
    let stats = pipeline.tracker_stats();
    debug!(
        stream = %stream,
        emitted = stats.emitted,
        suppressed = stats.suppressed,
        "stream worker exiting"
    );
}

/// Sink failures are logged, never fatal: one bad write must not take the
/// stream down, and the event stays visible in the log.
fn sink_events(sink: &Arc<Mutex<dyn EventSink>>, stream: &str, output: &FrameOutput) {
    if output.events.is_empty() {
        return;
    }
    let mut sink = match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for event in &output.events {
        if let Err(err) = sink.append(event) {
            error!(stream, id = %event.id, error = %err, "failed to sink event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sitewatch_core::{BBox, Detection, ObjectClass, Verdict};

    use crate::sink::TracingSink;

    fn person_only_frame(at_secs: u64) -> Frame {
        Frame {
            timestamp: Duration::from_secs(at_secs),
            detections: vec![Detection {
                class: ObjectClass::Person,
                confidence: 0.9,
                bbox: BBox {
                    x_min: 100.0,
                    y_min: 100.0,
                    x_max: 300.0,
                    y_max: 600.0,
                },
            }],
        }
    }

    fn worker(stream: &str) -> StreamHandle {
        spawn_stream_worker(
            stream.to_string(),
            RouterConfig::default(),
            TrackerConfig::default(),
            VerifierPool::disabled(),
            4,
            Arc::new(Mutex::new(TracingSink)),
        )
    }

    #[tokio::test]
    async fn test_worker_processes_frames_in_order() {
        let handle = worker("cam-1");

        // Person with no equipment signal and no verifier: the fallback
        // policy rules both items missing and a violation is emitted once.
        let first = handle
            .process_frame(person_only_frame(0), None)
            .await
            .unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].verdict, Verdict::MissingBoth);

        let second = handle
            .process_frame(person_only_frame(5), None)
            .await
            .unwrap();
        assert!(second.events.is_empty(), "cooldown must suppress");
    }

    #[tokio::test]
    async fn test_stale_frame_surfaces_as_error_without_side_effects() {
        let handle = worker("cam-1");
        handle
            .process_frame(person_only_frame(10), None)
            .await
            .unwrap();

        let err = handle
            .process_frame(person_only_frame(3), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Pipeline(PipelineError::StaleFrame { .. })
        ));

        // The rejected frame advanced nothing: the next in-order frame is
        // still inside the cooldown window of the first.
        let output = handle
            .process_frame(person_only_frame(20), None)
            .await
            .unwrap();
        assert!(output.events.is_empty());
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let a = worker("cam-a");
        let b = worker("cam-b");

        let ea = a.process_frame(person_only_frame(0), None).await.unwrap();
        let eb = b.process_frame(person_only_frame(0), None).await.unwrap();
        assert_eq!(ea.events.len(), 1);
        assert_eq!(eb.events.len(), 1, "cam-a state must not leak into cam-b");
        assert_eq!(ea.events[0].stream, "cam-a");
        assert_eq!(eb.events[0].stream, "cam-b");
        assert_eq!(ea.events[0].track_id, eb.events[0].track_id, "ids are per stream");
    }

    #[tokio::test]
    async fn test_submit_enqueues_in_order_without_waiting() {
        let handle = worker("cam-1");

        // Fire-and-forget both frames, then wait on a third: the worker
        // drains the queue in order, so the first frame has emitted and
        // the later ones are suppressed by its cooldown.
        handle.submit(person_only_frame(0), None).unwrap();
        handle.submit(person_only_frame(1), None).unwrap();
        let third = handle
            .process_frame(person_only_frame(2), None)
            .await
            .unwrap();
        assert!(third.events.is_empty(), "first frame already reported");
    }
}
