//! sitewatch-core — PPE compliance decision engine.
//!
//! Routes each detected person through a tiered bypass state machine that
//! avoids the expensive secondary verifier wherever primary-detector
//! evidence is conclusive, then deduplicates the resulting violations
//! across frames via spatial identity tracking with cooldown windows.

pub mod geometry;
pub mod pipeline;
pub mod router;
pub mod tracker;
pub mod types;

pub use pipeline::{Frame, FrameOutput, Pipeline, PipelineError};
pub use router::{
    DisabledVerifier, FrameStats, Router, RouterConfig, SecondaryVerifier, UnresolvedPolicy,
    VerifyOutcome, VerifyRequest, VerifyTarget,
};
pub use tracker::{Tracker, TrackerConfig, TrackerStats};
pub use types::{
    BBox, CandidateEvent, DecisionPath, DeduplicatedEvent, Detection, EmitReason, Evidence,
    ObjectClass, PersonCandidate, Verdict,
};
