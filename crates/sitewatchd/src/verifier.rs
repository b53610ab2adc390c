//! Bounded secondary-verifier pool.
//!
//! The verifier is the expensive resource in the system, so it sits behind
//! a fixed worker pool with a bounded request queue. Overload never blocks
//! a stream worker: a full queue or a slow backend degrades the answer to
//! [`VerifyOutcome::Unknown`] and the fallback policy rules the candidate.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitewatch_core::{BBox, SecondaryVerifier, VerifyOutcome, VerifyRequest, VerifyTarget};
use tracing::{debug, warn};

/// One unit of work for a backend: an ROI in a specific frame image.
#[derive(Debug, Clone)]
pub struct VerifyJob {
    pub stream: String,
    /// Frame image on disk, when the ingest side provides one.
    pub image: Option<PathBuf>,
    pub roi: BBox,
    pub target: VerifyTarget,
}

/// A semantic verification backend. One instance per worker thread;
/// backends hold their model state behind `&mut self`.
pub trait VerifierBackend: Send + 'static {
    fn name(&self) -> &'static str;
    fn verify(&mut self, job: &VerifyJob) -> VerifyOutcome;
}

/// Built-in backend that answers every request with a fixed outcome.
/// Used for wiring tests and for deployments that run the router and
/// tracker before a real verifier is integrated.
#[derive(Debug, Clone, Copy)]
pub struct StaticBackend {
    outcome: VerifyOutcome,
}

impl StaticBackend {
    pub fn new(outcome: VerifyOutcome) -> Self {
        Self { outcome }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let outcome = match name {
            "present" => VerifyOutcome::Present,
            "absent" => VerifyOutcome::Absent,
            "unknown" => VerifyOutcome::Unknown,
            _ => return None,
        };
        Some(Self::new(outcome))
    }
}

impl VerifierBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn verify(&mut self, _job: &VerifyJob) -> VerifyOutcome {
        self.outcome
    }
}

struct PoolRequest {
    job: VerifyJob,
    reply: SyncSender<VerifyOutcome>,
}

/// Handle to the worker pool. Cheap to clone; dropping the last handle
/// shuts the workers down.
#[derive(Clone)]
pub struct VerifierPool {
    tx: Option<SyncSender<PoolRequest>>,
    timeout: Duration,
}

impl VerifierPool {
    /// A pool with no backend. Every check answers `Unknown`.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            timeout: Duration::ZERO,
        }
    }

    /// Spawn `workers` backend threads sharing a queue of at most
    /// `queue_depth` pending requests.
    pub fn spawn<B, F>(factory: F, workers: usize, queue_depth: usize, timeout: Duration) -> Self
    where
        B: VerifierBackend,
        F: Fn(usize) -> B,
    {
        let (tx, rx) = mpsc::sync_channel::<PoolRequest>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let backend = factory(index);
            debug!(index, backend = backend.name(), "starting verifier worker");
            std::thread::Builder::new()
                .name(format!("sw-verify-{index}"))
                .spawn(move || worker_loop(rx, backend))
                .expect("failed to spawn verifier worker");
        }
        Self {
            tx: Some(tx),
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Submit a job and wait for its answer, bounded by the pool timeout.
    /// Saturation, timeout and worker loss all degrade to `Unknown`.
    pub fn check(&self, job: VerifyJob) -> VerifyOutcome {
        let Some(tx) = &self.tx else {
            debug!(stream = %job.stream, target = ?job.target, "verifier disabled");
            return VerifyOutcome::Unknown;
        };
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let request = PoolRequest {
            job,
            reply: reply_tx,
        };
        match tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                warn!(
                    stream = %request.job.stream,
                    target = ?request.job.target,
                    "verifier queue saturated, rejecting request"
                );
                return VerifyOutcome::Unknown;
            }
            Err(TrySendError::Disconnected(request)) => {
                warn!(stream = %request.job.stream, "verifier workers are gone");
                return VerifyOutcome::Unknown;
            }
        }
        match reply_rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                // Dropping reply_rx cancels the request: the worker's
                // late answer has nowhere to land and is discarded.
                warn!(timeout_ms = self.timeout.as_millis() as u64, "verification timed out");
                VerifyOutcome::Unknown
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("verifier worker died mid-request");
                VerifyOutcome::Unknown
            }
        }
    }
}

fn worker_loop<B: VerifierBackend>(rx: Arc<Mutex<Receiver<PoolRequest>>>, mut backend: B) {
    loop {
        let request = {
            let guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(request) = request else {
            // All pool handles dropped.
            break;
        };
        let outcome = backend.verify(&request.job);
        // Fails when the caller already timed out; nothing to do.
        let _ = request.reply.send(outcome);
    }
    debug!(backend = backend.name(), "verifier worker exiting");
}

/// Binds a pool to one stream's frame context so the runtime-free router
/// can ask for verification without knowing about images or pools.
pub struct FrameVerifier<'a> {
    pool: &'a VerifierPool,
    stream: &'a str,
    image: Option<&'a Path>,
}

impl<'a> FrameVerifier<'a> {
    pub fn new(pool: &'a VerifierPool, stream: &'a str, image: Option<&'a Path>) -> Self {
        Self {
            pool,
            stream,
            image,
        }
    }
}

impl SecondaryVerifier for FrameVerifier<'_> {
    fn check(&self, request: &VerifyRequest) -> VerifyOutcome {
        self.pool.check(VerifyJob {
            stream: self.stream.to_string(),
            image: self.image.map(Path::to_path_buf),
            roi: request.roi,
            target: request.target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(target: VerifyTarget) -> VerifyJob {
        VerifyJob {
            stream: "cam-1".to_string(),
            image: None,
            roi: BBox {
                x_min: 0.0,
                y_min: 0.0,
                x_max: 50.0,
                y_max: 50.0,
            },
            target,
        }
    }

    /// Backend that blocks on a channel until the test releases it.
    struct GatedBackend {
        gate: Receiver<()>,
        outcome: VerifyOutcome,
    }

    impl VerifierBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn verify(&mut self, _job: &VerifyJob) -> VerifyOutcome {
            let _ = self.gate.recv();
            self.outcome
        }
    }

    #[test]
    fn test_disabled_pool_answers_unknown() {
        let pool = VerifierPool::disabled();
        assert!(!pool.is_enabled());
        assert_eq!(pool.check(job(VerifyTarget::Helmet)), VerifyOutcome::Unknown);
    }

    #[test]
    fn test_static_backend_round_trip() {
        let pool = VerifierPool::spawn(
            |_| StaticBackend::new(VerifyOutcome::Absent),
            2,
            4,
            Duration::from_secs(1),
        );
        assert_eq!(pool.check(job(VerifyTarget::Vest)), VerifyOutcome::Absent);
        assert_eq!(pool.check(job(VerifyTarget::Helmet)), VerifyOutcome::Absent);
    }

    #[test]
    fn test_static_backend_names() {
        assert!(StaticBackend::from_name("present").is_some());
        assert!(StaticBackend::from_name("absent").is_some());
        assert!(StaticBackend::from_name("unknown").is_some());
        assert!(StaticBackend::from_name("sam").is_none());
    }

    #[test]
    fn test_slow_backend_times_out_to_unknown() {
        // Gate never opens within the timeout.
        let (gate_tx, gate_rx) = mpsc::channel();
        let gates = Mutex::new(vec![gate_rx]);
        let pool = VerifierPool::spawn(
            move |_| GatedBackend {
                gate: gates.lock().unwrap().pop().unwrap(),
                outcome: VerifyOutcome::Present,
            },
            1,
            1,
            Duration::from_millis(50),
        );
        assert_eq!(pool.check(job(VerifyTarget::Helmet)), VerifyOutcome::Unknown);
        drop(gate_tx);
    }

    #[test]
    fn test_saturated_queue_rejects_immediately() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let gates = Mutex::new(vec![gate_rx]);
        let pool = VerifierPool::spawn(
            move |_| GatedBackend {
                gate: gates.lock().unwrap().pop().unwrap(),
                outcome: VerifyOutcome::Present,
            },
            1,
            1,
            Duration::from_millis(200),
        );

        // Occupy the single worker, then fill the single queue slot.
        let occupied = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.check(job(VerifyTarget::Helmet)))
        };
        std::thread::sleep(Duration::from_millis(50));
        let queued = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.check(job(VerifyTarget::Vest)))
        };
        std::thread::sleep(Duration::from_millis(50));

        // Third request finds the queue full and degrades without waiting.
        assert_eq!(pool.check(job(VerifyTarget::Helmet)), VerifyOutcome::Unknown);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert_eq!(occupied.join().unwrap(), VerifyOutcome::Present);
        assert_eq!(queued.join().unwrap(), VerifyOutcome::Present);
    }

    #[test]
    fn test_frame_verifier_binds_stream_and_image() {
        struct CaptureBackend {
            seen: Arc<Mutex<Vec<VerifyJob>>>,
        }
        impl VerifierBackend for CaptureBackend {
            fn name(&self) -> &'static str {
                "capture"
            }
            fn verify(&mut self, job: &VerifyJob) -> VerifyOutcome {
                self.seen.lock().unwrap().push(job.clone());
                VerifyOutcome::Present
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let seen = Arc::clone(&seen);
            VerifierPool::spawn(
                move |_| CaptureBackend {
                    seen: Arc::clone(&seen),
                },
                1,
                2,
                Duration::from_secs(1),
            )
        };

        let image = PathBuf::from("/tmp/frame-000123.jpg");
        let verifier = FrameVerifier::new(&pool, "cam-7", Some(&image));
        let outcome = verifier.check(&VerifyRequest {
            roi: BBox {
                x_min: 10.0,
                y_min: 10.0,
                x_max: 60.0,
                y_max: 60.0,
            },
            target: VerifyTarget::Vest,
        });
        assert_eq!(outcome, VerifyOutcome::Present);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stream, "cam-7");
        assert_eq!(seen[0].image.as_deref(), Some(image.as_path()));
        assert_eq!(seen[0].target, VerifyTarget::Vest);
    }

    #[test]
    fn test_workers_share_the_queue() {
        let served = Arc::new(AtomicUsize::new(0));
        let pool = {
            let served = Arc::clone(&served);
            struct CountingBackend {
                served: Arc<AtomicUsize>,
            }
            impl VerifierBackend for CountingBackend {
                fn name(&self) -> &'static str {
                    "counting"
                }
                fn verify(&mut self, _job: &VerifyJob) -> VerifyOutcome {
                    self.served.fetch_add(1, Ordering::SeqCst);
                    VerifyOutcome::Absent
                }
            }
            VerifierPool::spawn(
                move |_| CountingBackend {
                    served: Arc::clone(&served),
                },
                3,
                8,
                Duration::from_secs(1),
            )
        };
        for _ in 0..10 {
            assert_eq!(pool.check(job(VerifyTarget::Helmet)), VerifyOutcome::Absent);
        }
        assert_eq!(served.load(Ordering::SeqCst), 10);
    }
}
