//! Stream coordinator.
//!
//! Owns the map of live stream workers, spawning one lazily the first
//! time a stream id appears. Ingest is fire-and-forget: `dispatch`
//! enqueues the frame on its stream's worker and returns immediately,
//! so a stalled verification on one stream never delays ingestion for
//! the others. The workers sink their own events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sitewatch_core::{Frame, FrameOutput};
use tracing::{info, warn};

use crate::config::Config;
use crate::ingest::FrameRecord;
use crate::sink::EventSink;
use crate::stream::{spawn_stream_worker, StreamError, StreamHandle};
use crate::verifier::VerifierPool;

pub struct Coordinator {
    config: Config,
    pool: VerifierPool,
    sink: Arc<Mutex<dyn EventSink>>,
    streams: HashMap<String, StreamHandle>,
}

impl Coordinator {
    pub fn new(config: Config, pool: VerifierPool, sink: Arc<Mutex<dyn EventSink>>) -> Self {
        Self {
            config,
            pool,
            sink,
            streams: HashMap::new(),
        }
    }

    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    /// Enqueue one ingest record on its stream's worker without waiting
    /// for the result. Results and rejections surface through the sink
    /// and the log.
    pub fn dispatch_record(&mut self, record: &FrameRecord) -> Result<(), StreamError> {
        self.dispatch(&record.stream, record.frame(), record.image.clone())
    }

    pub fn dispatch(
        &mut self,
        stream: &str,
        frame: Frame,
        image: Option<PathBuf>,
    ) -> Result<(), StreamError> {
        let handle = self.handle_for(stream);
        match handle.submit(frame, image) {
            Err(StreamError::WorkerGone) => {
                // The worker thread is dead; forget it so the next frame
                // for this stream starts fresh.
                warn!(stream, "stream worker lost, discarding handle");
                self.streams.remove(stream);
                Err(StreamError::WorkerGone)
            }
            other => other,
        }
    }

    /// Enqueue one frame and wait for its output. Offline callers only;
    /// the live ingest path uses [`Coordinator::dispatch`].
    pub async fn process_frame(
        &mut self,
        stream: &str,
        frame: Frame,
        image: Option<PathBuf>,
    ) -> Result<FrameOutput, StreamError> {
        let handle = self.handle_for(stream);
        match handle.process_frame(frame, image).await {
            Err(StreamError::WorkerGone) => {
                warn!(stream, "stream worker lost, discarding handle");
                self.streams.remove(stream);
                Err(StreamError::WorkerGone)
            }
            other => other,
        }
    }

    /// Drop a stream's worker. Its tracks and cooldown state go with it.
    pub fn stop_stream(&mut self, stream: &str) -> bool {
        let removed = self.streams.remove(stream).is_some();
        if removed {
            info!(stream, "stopping stream worker");
        }
        removed
    }

    fn handle_for(&mut self, stream: &str) -> StreamHandle {
        if let Some(handle) = self.streams.get(stream) {
            return handle.clone();
        }
        let handle = spawn_stream_worker(
            stream.to_string(),
            self.config.router_config(),
            self.config.tracker_config(),
            self.pool.clone(),
            self.config.stream_queue_depth,
            Arc::clone(&self.sink),
        );
        self.streams.insert(stream.to_string(), handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use sitewatch_core::{
        BBox, DeduplicatedEvent, Detection, ObjectClass, PipelineError, Verdict, VerifyOutcome,
    };

    use crate::sink::SinkError;
    use crate::verifier::{VerifierBackend, VerifyJob};

    #[derive(Clone, Default)]
    struct MemorySink {
        events: Arc<Mutex<Vec<DeduplicatedEvent>>>,
    }

    impl MemorySink {
        fn stream_count(&self, stream: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.stream == stream)
                .count()
        }
    }

    impl EventSink for MemorySink {
        fn append(&mut self, event: &DeduplicatedEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn person(bbox: BBox) -> Detection {
        Detection {
            class: ObjectClass::Person,
            confidence: 0.9,
            bbox,
        }
    }

    fn record(stream: &str, at_ms: u64) -> FrameRecord {
        FrameRecord {
            stream: stream.to_string(),
            timestamp_ms: at_ms,
            detections: vec![person(BBox::new(100.0, 100.0, 300.0, 600.0))],
            image: None,
        }
    }

    fn coordinator(sink: &MemorySink) -> Coordinator {
        Coordinator::new(
            Config::default(),
            VerifierPool::disabled(),
            Arc::new(Mutex::new(sink.clone())),
        )
    }

    #[tokio::test]
    async fn test_streams_spawn_lazily() {
        let sink = MemorySink::default();
        let mut coordinator = coordinator(&sink);
        assert_eq!(coordinator.live_streams(), 0);

        let r = record("cam-1", 0);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        let r = record("cam-2", 0);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        let r = record("cam-1", 100);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        assert_eq!(coordinator.live_streams(), 2);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2, "one first-sight violation per stream");
        assert!(events.iter().all(|e| e.verdict == Verdict::MissingBoth));
    }

    #[tokio::test]
    async fn test_stale_frame_on_one_stream_leaves_others_alone() {
        let sink = MemorySink::default();
        let mut coordinator = coordinator(&sink);

        let r = record("cam-1", 5000);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        let r = record("cam-1", 1000);
        let err = coordinator
            .process_frame(&r.stream, r.frame(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Pipeline(PipelineError::StaleFrame { .. })
        ));

        // The other stream is untouched and still emits normally.
        let r = record("cam-2", 0);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_stream_forgets_cooldown_state() {
        let sink = MemorySink::default();
        let mut coordinator = coordinator(&sink);

        let r = record("cam-1", 0);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        assert!(coordinator.stop_stream("cam-1"));
        assert!(!coordinator.stop_stream("cam-1"));

        // A restarted stream has no memory of earlier tracks, so the same
        // person alerts again immediately.
        let r = record("cam-1", 1000);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_reach_the_sink_with_stream_identity() {
        let sink = MemorySink::default();
        let mut coordinator = coordinator(&sink);
        let r = record("gate-7", 0);
        coordinator.process_frame(&r.stream, r.frame(), None).await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, "gate-7");
        assert_eq!(events[0].timestamp, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dispatched_records_emit_through_the_sink() {
        let sink = MemorySink::default();
        let mut coordinator = coordinator(&sink);
        coordinator.dispatch_record(&record("cam-1", 0)).unwrap();

        // Drain the queue: by the time the awaited frame returns, the
        // dispatched one has been processed and sunk.
        let r = record("cam-1", 100);
        let out = coordinator
            .process_frame(&r.stream, r.frame(), None)
            .await
            .unwrap();
        assert!(out.events.is_empty(), "second frame is inside cooldown");
        assert_eq!(sink.stream_count("cam-1"), 1);
    }

    /// Backend that blocks on a channel until the test releases it.
    struct BlockingBackend {
        gate: mpsc::Receiver<()>,
    }

    impl VerifierBackend for BlockingBackend {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn verify(&mut self, _job: &VerifyJob) -> VerifyOutcome {
            let _ = self.gate.recv();
            VerifyOutcome::Absent
        }
    }

    #[tokio::test]
    async fn test_blocked_verification_on_one_stream_does_not_stall_another() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let gates = Mutex::new(vec![gate_rx]);
        let pool = VerifierPool::spawn(
            move |_| BlockingBackend {
                gate: gates.lock().unwrap().pop().unwrap(),
            },
            1,
            2,
            Duration::from_secs(10),
        );
        let sink = MemorySink::default();
        let mut coordinator = Coordinator::new(
            Config::default(),
            pool,
            Arc::new(Mutex::new(sink.clone())),
        );

        // cam-1: no equipment signal, so the worker enters the verifier
        // and parks on the gate.
        coordinator.dispatch_record(&record("cam-1", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // cam-2: explicit no-helmet fast-fails without the verifier, and
        // must complete while cam-1 is still stuck.
        let person_box = BBox::new(100.0, 100.0, 300.0, 600.0);
        let frame = Frame {
            timestamp: Duration::ZERO,
            detections: vec![
                person(person_box),
                Detection {
                    class: ObjectClass::NoHelmet,
                    confidence: 0.9,
                    bbox: BBox::new(150.0, 110.0, 250.0, 220.0),
                },
            ],
        };
        let out = coordinator.process_frame("cam-2", frame, None).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].verdict, Verdict::MissingHelmet);
        assert_eq!(sink.stream_count("cam-1"), 0, "cam-1 must still be in flight");

        // Release both of cam-1's ROI checks and wait for its event.
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        for _ in 0..100 {
            if sink.stream_count("cam-1") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sink.stream_count("cam-1"), 1);
        assert_eq!(sink.stream_count("cam-2"), 1);
    }
}
