//! Five-path bypass router.
//!
//! For each person in a frame, decides COMPLIANT or VIOLATION with the
//! minimum number of secondary-verifier calls by exploiting the primary
//! detector's own signal strength. Branches are evaluated in fixed
//! priority order; high-confidence direct evidence always pre-empts
//! ambiguous cases.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::{self, GeometryError, RoiConfig};
use crate::types::{
    BBox, CandidateEvent, DecisionPath, Detection, Evidence, ObjectClass, PersonCandidate,
    Verdict,
};

/// Minimum fraction of an equipment box that must lie inside a person box
/// for the two to be associated.
const ASSOCIATION_CONTAINMENT: f32 = 0.5;

/// Which equipment item a secondary verification targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyTarget {
    Helmet,
    Vest,
}

impl VerifyTarget {
    /// Text prompts handed to the secondary verifier for this item.
    pub fn prompts(self) -> &'static [&'static str] {
        match self {
            VerifyTarget::Helmet => {
                &["helmet", "hard hat", "safety helmet", "construction helmet"]
            }
            VerifyTarget::Vest => {
                &["vest", "safety vest", "high visibility vest", "reflective vest"]
            }
        }
    }
}

/// ROI-scoped verification request. The frame image itself is bound by the
/// caller; the router only decides where to look and for what.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyRequest {
    pub roi: BBox,
    pub target: VerifyTarget,
}

/// Answer from the secondary verifier.
///
/// `Unknown` covers every non-answer: verifier disabled, timeout, pool
/// saturation, degenerate ROI. It is resolved through the configured
/// [`UnresolvedPolicy`], never treated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Present,
    Absent,
    Unknown,
}

/// Secondary semantic verification capability.
///
/// The only I/O-bound step in the pipeline; implementations must be
/// bounded in time and mockable for tests.
pub trait SecondaryVerifier {
    fn check(&self, request: &VerifyRequest) -> VerifyOutcome;
}

/// Verifier stand-in for deployments without the capability. Always
/// answers `Unknown`, leaving the decision to the fallback policy.
pub struct DisabledVerifier;

impl SecondaryVerifier for DisabledVerifier {
    fn check(&self, _request: &VerifyRequest) -> VerifyOutcome {
        VerifyOutcome::Unknown
    }
}

/// How to resolve an item the verifier could not decide on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Treat the item as missing. Favors false alarms over missed
    /// violations; the default.
    #[default]
    AssumeViolation,
    /// Treat the item as present.
    AssumeCompliant,
}

impl UnresolvedPolicy {
    fn item_present(self, outcome: VerifyOutcome) -> bool {
        match outcome {
            VerifyOutcome::Present => true,
            VerifyOutcome::Absent => false,
            VerifyOutcome::Unknown => self == UnresolvedPolicy::AssumeCompliant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Minimum primary-detector confidence for direct evidence.
    pub tau_primary: f32,
    pub roi: RoiConfig,
    pub unresolved: UnresolvedPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tau_primary: 0.25,
            roi: RoiConfig::default(),
            unresolved: UnresolvedPolicy::default(),
        }
    }
}

/// Per-frame routing statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub persons: usize,
    pub violations: usize,
    /// Persons for which at least one verifier call was issued.
    pub verifier_activations: usize,
    /// Detections dropped for malformed geometry.
    pub rejected_detections: usize,
    /// Counts indexed in [`DecisionPath::ALL`] order.
    pub path_counts: [usize; 5],
}

impl FrameStats {
    fn record(&mut self, path: DecisionPath, verdict: Verdict, verifier_used: bool) {
        self.persons += 1;
        if verdict.is_violation() {
            self.violations += 1;
        }
        if verifier_used {
            self.verifier_activations += 1;
        }
        let idx = DecisionPath::ALL
            .iter()
            .position(|p| *p == path)
            .unwrap_or(0);
        self.path_counts[idx] += 1;
    }

    /// Fraction of persons decided without the secondary verifier.
    pub fn bypass_rate(&self) -> f32 {
        if self.persons == 0 {
            return 1.0;
        }
        (self.persons - self.verifier_activations) as f32 / self.persons as f32
    }
}

/// The tiered bypass state machine. Stateless; all cross-frame memory
/// lives in the tracker.
#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Route every person in one frame's detections.
    ///
    /// Malformed detections are rejected individually; per-person verifier
    /// failures degrade to the fallback policy. Neither aborts the frame.
    pub fn route_frame<V: SecondaryVerifier>(
        &self,
        detections: &[Detection],
        timestamp: Duration,
        verifier: &V,
    ) -> (Vec<CandidateEvent>, FrameStats) {
        let mut stats = FrameStats::default();
        let candidates = self.build_candidates(detections, &mut stats);

        let events = candidates
            .iter()
            .map(|candidate| {
                let (verdict, path, verifier_used) = self.route_candidate(candidate, verifier);
                stats.record(path, verdict, verifier_used);
                CandidateEvent {
                    bbox: candidate.bbox,
                    confidence: candidate.confidence,
                    verdict,
                    path,
                    timestamp,
                    verifier_used,
                }
            })
            .collect();

        (events, stats)
    }

    /// Associate equipment detections with person detections.
    ///
    /// An equipment box belongs to the person box containing the largest
    /// fraction of it (at least [`ASSOCIATION_CONTAINMENT`]). Multiple
    /// detections of one class on one person collapse to the highest
    /// confidence. Detections below `tau_primary` are not direct evidence
    /// and are dropped here, so the affected item falls through to the
    /// rescue paths.
    fn build_candidates(
        &self,
        detections: &[Detection],
        stats: &mut FrameStats,
    ) -> Vec<PersonCandidate> {
        let mut persons: Vec<PersonCandidate> = Vec::new();
        let mut equipment: Vec<&Detection> = Vec::new();

        for det in detections {
            if !det.bbox.is_valid() {
                tracing::warn!(class = ?det.class, bbox = ?det.bbox, "rejecting malformed detection");
                stats.rejected_detections += 1;
                continue;
            }
            match det.class {
                ObjectClass::Person => persons.push(PersonCandidate {
                    bbox: det.bbox,
                    confidence: det.confidence,
                    helmet: Evidence::AbsentImplicit,
                    vest: Evidence::AbsentImplicit,
                }),
                _ => {
                    if det.confidence >= self.config.tau_primary {
                        equipment.push(det);
                    } else {
                        tracing::debug!(
                            class = ?det.class,
                            confidence = det.confidence,
                            "equipment detection below primary threshold, ignoring"
                        );
                    }
                }
            }
        }

        for item in equipment {
            let mut best: Option<(usize, f32)> = None;
            for (i, person) in persons.iter().enumerate() {
                // Both boxes were validated above.
                let overlap = geometry::containment(&item.bbox, &person.bbox).unwrap_or(0.0);
                if overlap >= ASSOCIATION_CONTAINMENT
                    && best.map_or(true, |(_, prev)| overlap > prev)
                {
                    best = Some((i, overlap));
                }
            }
            if let Some((i, _)) = best {
                apply_equipment(&mut persons[i], item.class, item.confidence);
            }
        }

        persons
    }

    /// Decide one person's verdict. Returns the verdict, the branch taken,
    /// and whether the secondary verifier was consulted.
    ///
    /// Exhaustive over all nine combinations of helmet × vest evidence;
    /// exactly one branch is reachable per combination.
    pub fn route_candidate<V: SecondaryVerifier>(
        &self,
        candidate: &PersonCandidate,
        verifier: &V,
    ) -> (Verdict, DecisionPath, bool) {
        use Evidence::{AbsentExplicit, AbsentImplicit, Present};

        match (candidate.helmet, candidate.vest) {
            // Both items directly detected: compliant, no verifier.
            (Present(_), Present(_)) => (Verdict::Compliant, DecisionPath::FastSafe, false),

            // An explicit absence signal is stronger evidence than
            // silence; it fast-fails without the verifier and reports
            // only the explicitly-missing item(s).
            (AbsentExplicit(_), AbsentExplicit(_)) => {
                (Verdict::MissingBoth, DecisionPath::FastViolation, false)
            }
            (AbsentExplicit(_), Present(_) | AbsentImplicit) => {
                (Verdict::MissingHelmet, DecisionPath::FastViolation, false)
            }
            (Present(_) | AbsentImplicit, AbsentExplicit(_)) => {
                (Verdict::MissingVest, DecisionPath::FastViolation, false)
            }

            // Vest seen, helmet silent: verify the head region.
            (AbsentImplicit, Present(_)) => {
                let has_helmet = self.verify_item(candidate, VerifyTarget::Helmet, verifier);
                (
                    Verdict::from_items(has_helmet, true),
                    DecisionPath::RescueHead,
                    true,
                )
            }

            // Helmet seen, vest silent: verify the torso region.
            (Present(_), AbsentImplicit) => {
                let has_vest = self.verify_item(candidate, VerifyTarget::Vest, verifier);
                (
                    Verdict::from_items(true, has_vest),
                    DecisionPath::RescueBody,
                    true,
                )
            }

            // No direct signal at all: verify both regions.
            (AbsentImplicit, AbsentImplicit) => {
                let has_helmet = self.verify_item(candidate, VerifyTarget::Helmet, verifier);
                let has_vest = self.verify_item(candidate, VerifyTarget::Vest, verifier);
                (
                    Verdict::from_items(has_helmet, has_vest),
                    DecisionPath::Critical,
                    true,
                )
            }
        }
    }

    /// Run one ROI-scoped verification and resolve it to item presence.
    ///
    /// A degenerate ROI is not fatal: it skips the call and resolves as
    /// `Unknown` through the fallback policy, for this person only.
    fn verify_item<V: SecondaryVerifier>(
        &self,
        candidate: &PersonCandidate,
        target: VerifyTarget,
        verifier: &V,
    ) -> bool {
        let roi = match target {
            VerifyTarget::Helmet => geometry::head_roi(&candidate.bbox, &self.config.roi),
            VerifyTarget::Vest => geometry::torso_roi(&candidate.bbox, &self.config.roi),
        };

        let outcome = match roi {
            Ok(roi) => verifier.check(&VerifyRequest { roi, target }),
            Err(err @ GeometryError::DegenerateRoi { .. }) => {
                tracing::warn!(?target, %err, "ROI too small to verify, using fallback policy");
                VerifyOutcome::Unknown
            }
            Err(err) => {
                tracing::warn!(?target, %err, "ROI extraction failed, using fallback policy");
                VerifyOutcome::Unknown
            }
        };

        if outcome == VerifyOutcome::Unknown {
            tracing::debug!(?target, policy = ?self.config.unresolved, "unresolved verification");
        }
        self.config.unresolved.item_present(outcome)
    }
}

/// Fold one associated equipment detection into a person's evidence.
///
/// Repeat detections of a class keep the highest confidence. When both a
/// presence and an explicit-absence class fire for the same item, the
/// higher-confidence signal wins; ties go to the absence signal.
fn apply_equipment(person: &mut PersonCandidate, class: ObjectClass, confidence: f32) {
    let slot = match class {
        ObjectClass::Helmet | ObjectClass::NoHelmet => &mut person.helmet,
        ObjectClass::Vest | ObjectClass::NoVest => &mut person.vest,
        ObjectClass::Person => return,
    };
    let incoming = match class {
        ObjectClass::Helmet | ObjectClass::Vest => Evidence::Present(confidence),
        _ => Evidence::AbsentExplicit(confidence),
    };

    *slot = match (*slot, incoming) {
        (Evidence::AbsentImplicit, new) => new,
        (Evidence::Present(a), Evidence::Present(b)) => Evidence::Present(a.max(b)),
        (Evidence::AbsentExplicit(a), Evidence::AbsentExplicit(b)) => {
            Evidence::AbsentExplicit(a.max(b))
        }
        (Evidence::Present(a), Evidence::AbsentExplicit(b)) if b >= a => {
            Evidence::AbsentExplicit(b)
        }
        (Evidence::AbsentExplicit(a), Evidence::Present(b)) if b > a => Evidence::Present(b),
        (current, _) => current,
    };
}
