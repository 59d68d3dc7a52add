//! Per-stream object tracking.

mod tracker;

pub use tracker::{
    Track, TrackObservation, TrackState, Tracker, TrackerConfig, TrackerUpdate, Transition,
};
