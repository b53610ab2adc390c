use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Axis-aligned bounding box in `[x_min, y_min, x_max, y_max]` order.
///
/// Coordinates may be pixels or normalized values, as long as every box
/// within one frame uses the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// A box is valid when both sides have positive extent.
    pub fn is_valid(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0
    }
}

/// Closed class taxonomy of the primary detector.
///
/// `NoHelmet` / `NoVest` are explicit-absence classes: the detector saw
/// direct evidence that the item is missing, which is stronger than the
/// item simply not being detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Helmet,
    Vest,
    NoHelmet,
    NoVest,
}

/// One primary-detector output for one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    pub bbox: BBox,
    pub confidence: f32,
}

/// Direct evidence the primary detector produced for one equipment item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evidence {
    /// The item was detected at or above the primary confidence threshold.
    Present(f32),
    /// An explicit absence class (`no_helmet` / `no_vest`) fired at or
    /// above the threshold.
    AbsentExplicit(f32),
    /// No direct signal either way.
    AbsentImplicit,
}

/// A person detection plus the equipment evidence associated with it.
#[derive(Debug, Clone)]
pub struct PersonCandidate {
    pub bbox: BBox,
    pub confidence: f32,
    pub helmet: Evidence,
    pub vest: Evidence,
}

/// Which branch of the bypass logic produced a verdict.
///
/// Carried through for observability and deduplication only; it never
/// changes downstream semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    FastSafe,
    FastViolation,
    RescueHead,
    RescueBody,
    Critical,
}

impl DecisionPath {
    pub const ALL: [DecisionPath; 5] = [
        DecisionPath::FastSafe,
        DecisionPath::FastViolation,
        DecisionPath::RescueHead,
        DecisionPath::RescueBody,
        DecisionPath::Critical,
    ];
}

/// Compliance verdict for one person in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Compliant,
    MissingHelmet,
    MissingVest,
    MissingBoth,
}

impl Verdict {
    /// Derive the verdict from per-item presence.
    pub fn from_items(has_helmet: bool, has_vest: bool) -> Self {
        match (has_helmet, has_vest) {
            (true, true) => Verdict::Compliant,
            (false, true) => Verdict::MissingHelmet,
            (true, false) => Verdict::MissingVest,
            (false, false) => Verdict::MissingBoth,
        }
    }

    pub fn is_violation(self) -> bool {
        self != Verdict::Compliant
    }
}

/// Router output for one person in one frame. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub bbox: BBox,
    pub confidence: f32,
    pub verdict: Verdict,
    pub path: DecisionPath,
    /// Offset from the stream epoch, never a frame count.
    pub timestamp: Duration,
    /// Whether the secondary verifier was consulted for this verdict.
    pub verifier_used: bool,
}

/// Why the tracker approved an event for emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitReason {
    /// First violation ever reported for this track.
    NewViolation,
    /// A standing violation re-emitted after the cooldown elapsed.
    CooldownExpired,
    /// The violation type changed from the last report.
    VerdictChanged,
}

/// A candidate event the tracker approved for downstream emission.
///
/// Emitted at most once per track per cooldown window. Downstream sinks
/// must be idempotent on `(track_id, verdict, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicatedEvent {
    pub id: Uuid,
    pub stream: String,
    pub track_id: u64,
    pub verdict: Verdict,
    pub path: DecisionPath,
    pub bbox: BBox,
    pub confidence: f32,
    pub timestamp: Duration,
    pub reason: EmitReason,
}
