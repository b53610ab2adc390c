//! Cross-frame identity and cooldown tracking.
//!
//! Matches each frame's candidate events to live tracks by spatial
//! overlap, then decides which violations are worth emitting downstream:
//! the first occurrence, a changed violation type, or a standing violation
//! whose cooldown has elapsed. Everything else is suppressed so one
//! physical violation does not alert on every frame.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry;
use crate::types::{BBox, CandidateEvent, DeduplicatedEvent, EmitReason, Verdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum IoU against a live track's last bbox to claim a candidate.
    pub iou_threshold: f32,
    /// Minimum time between repeated reports of the same standing
    /// violation on one track.
    pub cooldown: Duration,
    /// A track unmatched for this long is deleted.
    pub track_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            cooldown: Duration::from_secs(300),
            track_timeout: Duration::from_secs(30),
        }
    }
}

/// One tracked person. `bbox` is always the most recent matched
/// detection, never a smoothed or stale value.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub bbox: BBox,
    pub last_seen: Duration,
    /// Verdict and timestamp of the last emitted report, if any.
    /// A compliant frame never clears this; only a changed verdict or
    /// cooldown expiry triggers re-emission.
    pub last_report: Option<(Verdict, Duration)>,
}

/// Running deduplication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub observed_violations: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub tracks_spawned: u64,
}

/// Per-stream track table. Owned by exactly one worker at a time.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    stream: String,
    tracks: Vec<Track>,
    next_id: u64,
    stats: TrackerStats,
}

impl Tracker {
    pub fn new(stream: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            config,
            stream: stream.into(),
            tracks: Vec::new(),
            next_id: 0,
            stats: TrackerStats::default(),
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Process one frame's candidate events at stream time `now`.
    ///
    /// Expires stale tracks, greedily assigns candidates to tracks by
    /// descending IoU (ties toward the lowest track id; each side claims
    /// at most one partner), spawns tracks for unmatched candidates, and
    /// returns the events approved for emission, in observation order.
    pub fn observe(&mut self, events: &[CandidateEvent], now: Duration) -> Vec<DeduplicatedEvent> {
        self.expire_stale(now);

        let assignment = self.assign(events);
        let mut emitted = Vec::new();

        for (event_idx, event) in events.iter().enumerate() {
            let track_idx = match assignment[event_idx] {
                Some(idx) => {
                    let track = &mut self.tracks[idx];
                    track.bbox = event.bbox;
                    track.last_seen = now;
                    idx
                }
                None => self.spawn_track(event.bbox, now),
            };

            if let Some(out) = self.decide(track_idx, event, now) {
                emitted.push(out);
            }
        }

        emitted
    }

    fn expire_stale(&mut self, now: Duration) {
        let timeout = self.config.track_timeout;
        let before = self.tracks.len();
        self.tracks
            .retain(|t| now.saturating_sub(t.last_seen) < timeout);
        let removed = before - self.tracks.len();
        if removed > 0 {
            tracing::debug!(stream = %self.stream, removed, live = self.tracks.len(), "expired stale tracks");
        }
    }

    /// Greedy exclusive assignment: candidate index → track index.
    fn assign(&self, events: &[CandidateEvent]) -> Vec<Option<usize>> {
        // (iou, track id for tie-break, track index, event index)
        let mut pairs: Vec<(f32, u64, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (ei, event) in events.iter().enumerate() {
                let score = geometry::iou(&track.bbox, &event.bbox).unwrap_or(0.0);
                if score >= self.config.iou_threshold {
                    pairs.push((score, track.id, ti, ei));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut assignment = vec![None; events.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, _, ti, ei) in pairs {
            if assignment[ei].is_none() && !track_taken[ti] {
                assignment[ei] = Some(ti);
                track_taken[ti] = true;
            }
        }
        assignment
    }

    fn spawn_track(&mut self, bbox: BBox, now: Duration) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.tracks_spawned += 1;
        self.tracks.push(Track {
            id,
            bbox,
            last_seen: now,
            last_report: None,
        });
        tracing::debug!(stream = %self.stream, track = id, "spawned track");
        self.tracks.len() - 1
    }

    /// Cooldown decision for one matched candidate.
    fn decide(
        &mut self,
        track_idx: usize,
        event: &CandidateEvent,
        now: Duration,
    ) -> Option<DeduplicatedEvent> {
        if !event.verdict.is_violation() {
            return None;
        }
        self.stats.observed_violations += 1;

        let track = &mut self.tracks[track_idx];
        let reason = match track.last_report {
            None => EmitReason::NewViolation,
            Some((verdict, _)) if verdict != event.verdict => EmitReason::VerdictChanged,
            Some((_, reported_at)) if now.saturating_sub(reported_at) >= self.config.cooldown => {
                EmitReason::CooldownExpired
            }
            Some(_) => {
                self.stats.suppressed += 1;
                return None;
            }
        };

        // The cooldown clock restarts from this report, including for a
        // changed verdict (one-time exception, not a reset-free pass).
        track.last_report = Some((event.verdict, now));
        self.stats.emitted += 1;

        tracing::info!(
            stream = %self.stream,
            track = track.id,
            verdict = ?event.verdict,
            path = ?event.path,
            ?reason,
            "violation approved for emission"
        );

        Some(DeduplicatedEvent {
            id: Uuid::new_v4(),
            stream: self.stream.clone(),
            track_id: track.id,
            verdict: event.verdict,
            path: event.path,
            bbox: event.bbox,
            confidence: event.confidence,
            timestamp: event.timestamp,
            reason,
        })
    }
}
