//! Track lifecycle and frame-to-frame association.
//!
//! One `Tracker` per stream, owned exclusively by that stream's worker.
//! Track identifiers are monotonic and never reused within a stream.
//!
//! Lifecycle: a new track is Tentative; it becomes Confirmed after
//! `confirm_hits` consecutive matched frames, and Lost after
//! `miss_threshold` consecutive unmatched frames. Lost is terminal: the
//! track is removed, and the same object reappearing gets a fresh id.
//!
//! Association is greedy nearest-cost with a gate. Cost blends inverse IoU
//! with normalized center distance, so overlapping boxes dominate but a
//! fast-moving object that briefly loses overlap can still match. Ties
//! break by higher detection confidence, then lower track id, for
//! deterministic output.

use std::collections::VecDeque;

use crate::config::TrackerSettings;
use crate::frame::{BoundingBox, Detection, FrameDetections, ObjectClass};

/// Share of the cost taken by center distance; the rest is inverse IoU.
const DISTANCE_WEIGHT: f32 = 0.3;
const HISTORY_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: u64,
    pub stream_id: String,
    pub state: TrackState,
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    pub confidence: f32,
    /// Center velocity in pixels per frame.
    pub velocity: (f32, f32),
    pub last_seen_ms: u64,
    /// Matched boxes, newest last, bounded.
    pub history: VecDeque<BoundingBox>,
    hits: u32,
    misses: u32,
}

impl Track {
    fn new(id: u64, det: &Detection, timestamp_ms: u64) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(det.bbox);
        Self {
            id,
            stream_id: det.stream_id.clone(),
            state: TrackState::Tentative,
            bbox: det.bbox,
            class: det.class,
            confidence: det.confidence,
            velocity: (0.0, 0.0),
            last_seen_ms: timestamp_ms,
            history,
            hits: 1,
            misses: 0,
        }
    }

    /// Constant-velocity extrapolation of the last matched box.
    pub fn predicted(&self) -> BoundingBox {
        BoundingBox::new(
            self.bbox.x + self.velocity.0,
            self.bbox.y + self.velocity.1,
            self.bbox.w,
            self.bbox.h,
        )
    }

    fn apply_match(&mut self, det: &Detection, timestamp_ms: u64) {
        let (px, py) = self.bbox.center();
        let (cx, cy) = det.bbox.center();
        self.velocity = (cx - px, cy - py);
        self.bbox = det.bbox;
        self.class = det.class;
        self.confidence = det.confidence;
        self.last_seen_ms = timestamp_ms;
        self.hits += 1;
        self.misses = 0;
        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(det.bbox);
    }
}

/// A state change observed during one update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub track_id: u64,
    pub from: TrackState,
    pub to: TrackState,
}

/// A confirmed track's position after one update, for zone geometry and
/// counting downstream.
#[derive(Clone, Debug)]
pub struct TrackObservation {
    pub track_id: u64,
    pub class: ObjectClass,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub confirm_hits: u32,
    pub miss_threshold: u32,
    /// Pairs with cost above this never match.
    pub match_cost_gate: f32,
}

impl From<&TrackerSettings> for TrackerConfig {
    fn from(s: &TrackerSettings) -> Self {
        Self {
            confirm_hits: s.confirm_hits,
            miss_threshold: s.miss_threshold,
            match_cost_gate: s.match_cost_gate,
        }
    }
}

/// Output of one tracker update.
#[derive(Clone, Debug, Default)]
pub struct TrackerUpdate {
    pub transitions: Vec<Transition>,
    pub confirmed: Vec<TrackObservation>,
}

pub struct Tracker {
    cfg: TrackerConfig,
    stream_id: String,
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(stream_id: impl Into<String>, cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            stream_id: stream_id.into(),
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn active_tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Process one frame's detections.
    pub fn update(&mut self, frame: &FrameDetections) -> TrackerUpdate {
        let mut out = TrackerUpdate::default();
        let diagonal = frame.frame.diagonal().max(1.0);

        let assignments = self.assign(&frame.detections, diagonal);

        let mut det_matched = vec![false; frame.detections.len()];
        let mut track_matched = vec![false; self.tracks.len()];
        for &(track_idx, det_idx) in &assignments {
            track_matched[track_idx] = true;
            det_matched[det_idx] = true;
            let track = &mut self.tracks[track_idx];
            track.apply_match(&frame.detections[det_idx], frame.timestamp_ms());
            if track.state == TrackState::Tentative && track.hits >= self.cfg.confirm_hits {
                track.state = TrackState::Confirmed;
                out.transitions.push(Transition {
                    track_id: track.id,
                    from: TrackState::Tentative,
                    to: TrackState::Confirmed,
                });
            }
        }

        // Unmatched tracks accumulate misses. A miss breaks the
        // consecutive-hit run of a tentative track.
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if track_matched[idx] {
                continue;
            }
            track.misses += 1;
            track.hits = 0;
            if track.misses >= self.cfg.miss_threshold {
                let from = track.state;
                track.state = TrackState::Lost;
                out.transitions.push(Transition {
                    track_id: track.id,
                    from,
                    to: TrackState::Lost,
                });
            }
        }
        // Lost is terminal; drop those tracks.
        self.tracks.retain(|t| t.state != TrackState::Lost);

        // Unmatched detections spawn new tentative tracks.
        for (idx, det) in frame.detections.iter().enumerate() {
            if det_matched[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut track = Track::new(id, det, frame.timestamp_ms());
            if self.cfg.confirm_hits <= 1 {
                track.state = TrackState::Confirmed;
                out.transitions.push(Transition {
                    track_id: id,
                    from: TrackState::Tentative,
                    to: TrackState::Confirmed,
                });
            }
            self.tracks.push(track);
        }

        for track in &self.tracks {
            if track.state == TrackState::Confirmed {
                out.confirmed.push(TrackObservation {
                    track_id: track.id,
                    class: track.class,
                    bbox: track.bbox,
                    confidence: track.confidence,
                });
            }
        }
        out
    }

    /// Mark every active track Lost and clear the set. Used when a stream
    /// is cancelled so its confirmed tracks still produce exits.
    pub fn close(&mut self) -> TrackerUpdate {
        let mut out = TrackerUpdate::default();
        for track in self.tracks.drain(..) {
            if track.state == TrackState::Confirmed {
                out.transitions.push(Transition {
                    track_id: track.id,
                    from: TrackState::Confirmed,
                    to: TrackState::Lost,
                });
            }
        }
        out
    }

    /// Greedy nearest-cost assignment, gated.
    ///
    /// Candidate pairs are sorted by cost ascending; ties break by higher
    /// detection confidence, then lower track id. Each track and detection
    /// is used at most once.
    fn assign(&self, detections: &[Detection], diagonal: f32) -> Vec<(usize, usize)> {
        let mut candidates = Vec::with_capacity(self.tracks.len() * detections.len());
        for (t_idx, track) in self.tracks.iter().enumerate() {
            let predicted = track.predicted();
            for (d_idx, det) in detections.iter().enumerate() {
                let cost = pair_cost(&predicted, &det.bbox, diagonal);
                if cost <= self.cfg.match_cost_gate {
                    candidates.push((cost, det.confidence, track.id, t_idx, d_idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(b.1.total_cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut assignments = Vec::new();
        for (_, _, _, t_idx, d_idx) in candidates {
            if track_used[t_idx] || det_used[d_idx] {
                continue;
            }
            track_used[t_idx] = true;
            det_used[d_idx] = true;
            assignments.push((t_idx, d_idx));
        }
        assignments
    }
}

/// Association cost: inverse IoU blended with normalized center distance.
/// 0.0 is a perfect overlap at zero distance.
fn pair_cost(predicted: &BoundingBox, candidate: &BoundingBox, diagonal: f32) -> f32 {
    let iou_cost = 1.0 - predicted.iou(candidate);
    let (px, py) = predicted.center();
    let (cx, cy) = candidate.center();
    let dist = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt() / diagonal;
    (1.0 - DISTANCE_WEIGHT) * iou_cost + DISTANCE_WEIGHT * dist.min(1.0)
}
