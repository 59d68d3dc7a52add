//! Track transitions → semantic events.
//!
//! One `EventAggregator` per stream, driven by its tracker worker. Enter
//! fires on Tentative→Confirmed, Exit on Confirmed→Lost, Dwell when a
//! confirmed track stays in one zone past the dwell threshold, and
//! CountUpdate whenever the stream's contribution to the shared counts
//! changes. Repeated events of one kind for one track inside the debounce
//! window collapse to a single emission.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::EventSettings;
use crate::event::ZoneSet;
use crate::frame::{BoundingBox, ObjectClass};
use crate::track::{TrackObservation, TrackState, TrackerUpdate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enter,
    Exit,
    Dwell,
    CountUpdate,
}

/// Consistent view of the running counts.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CountSnapshot {
    pub per_class: BTreeMap<ObjectClass, usize>,
    pub per_zone: BTreeMap<String, usize>,
}

impl CountSnapshot {
    fn add(&mut self, other: &CountSnapshot) {
        for (class, n) in &other.per_class {
            *self.per_class.entry(*class).or_insert(0) += n;
        }
        for (zone, n) in &other.per_zone {
            *self.per_zone.entry(zone.clone()).or_insert(0) += n;
        }
    }

    fn subtract(&mut self, other: &CountSnapshot) {
        for (class, n) in &other.per_class {
            if let Some(v) = self.per_class.get_mut(class) {
                *v = v.saturating_sub(*n);
            }
        }
        for (zone, n) in &other.per_zone {
            if let Some(v) = self.per_zone.get_mut(zone) {
                *v = v.saturating_sub(*n);
            }
        }
        self.per_class.retain(|_, v| *v > 0);
        self.per_zone.retain(|_, v| *v > 0);
    }
}

/// Shared per-class/per-zone counts. Updated under a narrow lock;
/// `snapshot` hands out a consistent copy, never a torn read.
#[derive(Clone, Default)]
pub struct SharedCounts {
    inner: Arc<Mutex<CountSnapshot>>,
}

impl SharedCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace one stream's contribution and return the new global view.
    fn swap_contribution(&self, old: &CountSnapshot, new: &CountSnapshot) -> CountSnapshot {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.subtract(old);
        guard.add(new);
        guard.clone()
    }
}

/// One emitted event. Immutable; this is the wire schema.
#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub stream_id: String,
    pub track_id: u64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ObjectClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<CountSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<bool>,
}

struct Residency {
    zone: String,
    entered_ms: u64,
    dwell_emitted: bool,
}

/// CountUpdate events are stream-wide, not per track.
const COUNT_TRACK_ID: u64 = 0;

pub struct EventAggregator {
    stream_id: String,
    cfg: EventSettings,
    zones: Arc<ZoneSet>,
    counts: SharedCounts,
    /// Last emission timestamp per (track, kind), for debouncing.
    debounce: HashMap<(u64, EventKind), u64>,
    residency: HashMap<u64, Residency>,
    /// Last confirmed observation per track, so Exit can carry the final
    /// position after the tracker has dropped the track.
    last_obs: HashMap<u64, TrackObservation>,
    /// This stream's contribution to the shared counts, as last applied.
    local: CountSnapshot,
    /// Cumulative confirmed-track residency per zone, milliseconds.
    dwell_totals: BTreeMap<String, u64>,
}

impl EventAggregator {
    pub fn new(
        stream_id: impl Into<String>,
        cfg: EventSettings,
        zones: Arc<ZoneSet>,
        counts: SharedCounts,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            cfg,
            zones,
            counts,
            debounce: HashMap::new(),
            residency: HashMap::new(),
            last_obs: HashMap::new(),
            local: CountSnapshot::default(),
            dwell_totals: BTreeMap::new(),
        }
    }

    pub fn dwell_totals(&self) -> &BTreeMap<String, u64> {
        &self.dwell_totals
    }

    /// Derive events from one tracker update.
    pub fn observe(&mut self, update: &TrackerUpdate, timestamp_ms: u64) -> Vec<EventRecord> {
        let mut out = Vec::new();

        for transition in &update.transitions {
            match (transition.from, transition.to) {
                (TrackState::Tentative, TrackState::Confirmed) => {
                    if let Some(obs) = update
                        .confirmed
                        .iter()
                        .find(|o| o.track_id == transition.track_id)
                    {
                        let zone = self.zone_of(obs);
                        self.emit(
                            &mut out,
                            EventKind::Enter,
                            obs.track_id,
                            timestamp_ms,
                            Some(obs),
                            zone,
                        );
                    }
                }
                (TrackState::Confirmed, TrackState::Lost) => {
                    let obs = self.last_obs.remove(&transition.track_id);
                    let zone = self.close_residency(transition.track_id, timestamp_ms);
                    self.emit(
                        &mut out,
                        EventKind::Exit,
                        transition.track_id,
                        timestamp_ms,
                        obs.as_ref(),
                        zone,
                    );
                }
                // Tentative tracks vanish silently.
                _ => {
                    self.last_obs.remove(&transition.track_id);
                    self.close_residency(transition.track_id, timestamp_ms);
                }
            }
        }

        for obs in &update.confirmed {
            self.track_residency(obs, timestamp_ms, &mut out);
            self.last_obs.insert(obs.track_id, obs.clone());
        }

        self.refresh_counts(&update.confirmed, timestamp_ms, &mut out);
        out
    }

    fn zone_of(&self, obs: &TrackObservation) -> Option<String> {
        let (x, y) = obs.bbox.center();
        self.zones.locate(x, y).map(|z| z.id.clone())
    }

    /// Advance one confirmed track's zone residency, emitting Dwell when
    /// the threshold is crossed.
    fn track_residency(
        &mut self,
        obs: &TrackObservation,
        timestamp_ms: u64,
        out: &mut Vec<EventRecord>,
    ) {
        let current = self.zone_of(obs);
        let previous = self.residency.get(&obs.track_id).map(|r| r.zone.clone());
        if current != previous {
            self.close_residency(obs.track_id, timestamp_ms);
            if let Some(zone) = current.clone() {
                self.residency.insert(
                    obs.track_id,
                    Residency {
                        zone,
                        entered_ms: timestamp_ms,
                        dwell_emitted: false,
                    },
                );
            }
            return;
        }
        let dwell_ms = self.cfg.dwell_ms;
        let due = match self.residency.get_mut(&obs.track_id) {
            Some(r) if !r.dwell_emitted && timestamp_ms.saturating_sub(r.entered_ms) >= dwell_ms => {
                r.dwell_emitted = true;
                Some(r.zone.clone())
            }
            _ => None,
        };
        if let Some(zone) = due {
            self.emit(
                out,
                EventKind::Dwell,
                obs.track_id,
                timestamp_ms,
                Some(obs),
                Some(zone),
            );
        }
    }

    /// End a track's current residency, folding it into the per-zone
    /// totals. Returns the zone it was in, if any.
    fn close_residency(&mut self, track_id: u64, timestamp_ms: u64) -> Option<String> {
        let r = self.residency.remove(&track_id)?;
        let spent = timestamp_ms.saturating_sub(r.entered_ms);
        *self.dwell_totals.entry(r.zone.clone()).or_insert(0) += spent;
        Some(r.zone)
    }

    /// Recompute this stream's contribution to the shared counts and emit
    /// a CountUpdate when it changed.
    fn refresh_counts(
        &mut self,
        confirmed: &[TrackObservation],
        timestamp_ms: u64,
        out: &mut Vec<EventRecord>,
    ) {
        let mut local = CountSnapshot::default();
        for obs in confirmed {
            *local.per_class.entry(obs.class).or_insert(0) += 1;
            if let Some(zone) = self.zone_of(obs) {
                *local.per_zone.entry(zone).or_insert(0) += 1;
            }
        }
        if local == self.local {
            return;
        }
        let global = self.counts.swap_contribution(&self.local, &local);
        self.local = local;

        let anomaly = global
            .per_zone
            .iter()
            .any(|(id, n)| matches!(self.zones.get(id), Some(z) if *n > z.capacity));
        if self.debounced(COUNT_TRACK_ID, EventKind::CountUpdate, timestamp_ms) {
            return;
        }
        out.push(EventRecord {
            kind: EventKind::CountUpdate,
            stream_id: self.stream_id.clone(),
            track_id: COUNT_TRACK_ID,
            timestamp_ms,
            class: None,
            bbox: None,
            confidence: None,
            zone: None,
            counts: Some(global),
            anomaly: anomaly.then_some(true),
        });
    }

    fn emit(
        &mut self,
        out: &mut Vec<EventRecord>,
        kind: EventKind,
        track_id: u64,
        timestamp_ms: u64,
        obs: Option<&TrackObservation>,
        zone: Option<String>,
    ) {
        if self.debounced(track_id, kind, timestamp_ms) {
            return;
        }
        out.push(EventRecord {
            kind,
            stream_id: self.stream_id.clone(),
            track_id,
            timestamp_ms,
            class: obs.map(|o| o.class),
            bbox: obs.map(|o| o.bbox),
            confidence: obs.map(|o| o.confidence),
            zone,
            counts: None,
            anomaly: None,
        });
    }

    /// True when an event of this kind for this track fired inside the
    /// debounce window; records the emission timestamp otherwise.
    fn debounced(&mut self, track_id: u64, kind: EventKind, timestamp_ms: u64) -> bool {
        match self.debounce.get(&(track_id, kind)) {
            Some(last) if timestamp_ms.saturating_sub(*last) < self.cfg.debounce_ms => true,
            _ => {
                self.debounce.insert((track_id, kind), timestamp_ms);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneSettings;
    use crate::track::Transition;

    fn settings() -> EventSettings {
        EventSettings {
            debounce_ms: 2_000,
            dwell_ms: 1_000,
        }
    }

    fn desk_zone(capacity: usize) -> Arc<ZoneSet> {
        let zone = ZoneSettings {
            id: "desk_1".to_string(),
            kind: "desk".to_string(),
            capacity,
            points: vec![[0.0, 0.0], [200.0, 0.0], [200.0, 200.0], [0.0, 200.0]],
        };
        Arc::new(ZoneSet::from_settings(&[zone]).unwrap())
    }

    fn obs(track_id: u64, x: f32, y: f32) -> TrackObservation {
        TrackObservation {
            track_id,
            class: ObjectClass::Person,
            bbox: BoundingBox::new(x, y, 40.0, 60.0),
            confidence: 0.9,
        }
    }

    fn confirmed_update(observations: Vec<TrackObservation>) -> TrackerUpdate {
        TrackerUpdate {
            transitions: Vec::new(),
            confirmed: observations,
        }
    }

    fn enter_update(observation: TrackObservation) -> TrackerUpdate {
        TrackerUpdate {
            transitions: vec![Transition {
                track_id: observation.track_id,
                from: TrackState::Tentative,
                to: TrackState::Confirmed,
            }],
            confirmed: vec![observation],
        }
    }

    fn exit_update(track_id: u64) -> TrackerUpdate {
        TrackerUpdate {
            transitions: vec![Transition {
                track_id,
                from: TrackState::Confirmed,
                to: TrackState::Lost,
            }],
            confirmed: Vec::new(),
        }
    }

    #[test]
    fn enter_then_exit_emits_one_of_each() {
        let counts = SharedCounts::new();
        let mut agg = EventAggregator::new("cam_a", settings(), desk_zone(10), counts.clone());

        let events = agg.observe(&enter_update(obs(1, 50.0, 50.0)), 1_000);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Enter, EventKind::CountUpdate]);
        assert_eq!(events[0].zone.as_deref(), Some("desk_1"));
        assert_eq!(counts.snapshot().per_zone.get("desk_1"), Some(&1));

        let events = agg.observe(&exit_update(1), 10_000);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Exit, EventKind::CountUpdate]);
        assert_eq!(events[0].class, Some(ObjectClass::Person));
        assert!(counts.snapshot().per_zone.is_empty());
    }

    #[test]
    fn repeat_enter_within_debounce_window_collapses() {
        let mut agg =
            EventAggregator::new("cam_a", settings(), desk_zone(10), SharedCounts::new());

        let first = agg.observe(&enter_update(obs(1, 50.0, 50.0)), 1_000);
        assert!(first.iter().any(|e| e.kind == EventKind::Enter));

        // Same track "entering" again 500ms later: inside the window.
        let second = agg.observe(&enter_update(obs(1, 50.0, 50.0)), 1_500);
        assert!(second.iter().all(|e| e.kind != EventKind::Enter));

        // Past the window it may fire again.
        let third = agg.observe(&enter_update(obs(1, 50.0, 50.0)), 4_000);
        assert!(third.iter().any(|e| e.kind == EventKind::Enter));
    }

    #[test]
    fn dwell_fires_once_after_residency_threshold() {
        let mut agg =
            EventAggregator::new("cam_a", settings(), desk_zone(10), SharedCounts::new());

        agg.observe(&enter_update(obs(1, 50.0, 50.0)), 0);
        let early = agg.observe(&confirmed_update(vec![obs(1, 52.0, 50.0)]), 500);
        assert!(early.iter().all(|e| e.kind != EventKind::Dwell));

        let due = agg.observe(&confirmed_update(vec![obs(1, 54.0, 50.0)]), 1_200);
        let dwell: Vec<&EventRecord> =
            due.iter().filter(|e| e.kind == EventKind::Dwell).collect();
        assert_eq!(dwell.len(), 1);
        assert_eq!(dwell[0].zone.as_deref(), Some("desk_1"));

        // No second dwell for the same uninterrupted stay.
        let later = agg.observe(&confirmed_update(vec![obs(1, 56.0, 50.0)]), 5_000);
        assert!(later.iter().all(|e| e.kind != EventKind::Dwell));
    }

    #[test]
    fn leaving_the_zone_accumulates_dwell_totals() {
        let mut agg =
            EventAggregator::new("cam_a", settings(), desk_zone(10), SharedCounts::new());

        agg.observe(&enter_update(obs(1, 50.0, 50.0)), 0);
        // Move outside the zone at t=3000.
        agg.observe(&confirmed_update(vec![obs(1, 400.0, 400.0)]), 3_000);
        assert_eq!(agg.dwell_totals().get("desk_1"), Some(&3_000));
    }

    #[test]
    fn count_update_flags_capacity_anomaly() {
        let counts = SharedCounts::new();
        let mut agg = EventAggregator::new("cam_a", settings(), desk_zone(1), counts);

        agg.observe(&enter_update(obs(1, 50.0, 50.0)), 0);
        let update = TrackerUpdate {
            transitions: vec![Transition {
                track_id: 2,
                from: TrackState::Tentative,
                to: TrackState::Confirmed,
            }],
            confirmed: vec![obs(1, 50.0, 50.0), obs(2, 120.0, 120.0)],
        };
        let events = agg.observe(&update, 5_000);
        let count = events
            .iter()
            .find(|e| e.kind == EventKind::CountUpdate)
            .expect("count update");
        assert_eq!(count.anomaly, Some(true));
        assert_eq!(
            count.counts.as_ref().unwrap().per_zone.get("desk_1"),
            Some(&2)
        );
    }

    #[test]
    fn counts_merge_across_streams() {
        let counts = SharedCounts::new();
        let zones = desk_zone(10);
        let mut a = EventAggregator::new("cam_a", settings(), zones.clone(), counts.clone());
        let mut b = EventAggregator::new("cam_b", settings(), zones, counts.clone());

        a.observe(&enter_update(obs(1, 50.0, 50.0)), 0);
        b.observe(&enter_update(obs(1, 60.0, 60.0)), 0);

        let snap = counts.snapshot();
        assert_eq!(snap.per_class.get(&ObjectClass::Person), Some(&2));
        assert_eq!(snap.per_zone.get("desk_1"), Some(&2));
    }

    #[test]
    fn wire_schema_field_names() {
        let record = EventRecord {
            kind: EventKind::Enter,
            stream_id: "cam_a".into(),
            track_id: 7,
            timestamp_ms: 1_700_000_000_000,
            class: Some(ObjectClass::Person),
            bbox: Some(BoundingBox::new(1.0, 2.0, 3.0, 4.0)),
            confidence: Some(0.9),
            zone: Some("desk_1".into()),
            counts: None,
            anomaly: None,
        };
        let json: serde_json::Value = serde_json::from_str(
            &serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "enter");
        assert_eq!(json["stream_id"], "cam_a");
        assert_eq!(json["track_id"], 7);
        assert_eq!(json["timestamp"], 1_700_000_000_000_u64);
        assert_eq!(json["class"], "person");
        assert_eq!(json["zone"], "desk_1");
        assert!(json.get("counts").is_none());
    }
}
