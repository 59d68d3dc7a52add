//! Event derivation from track lifecycle and zone geometry.

mod aggregator;
mod zone;

pub use aggregator::{CountSnapshot, EventAggregator, EventKind, EventRecord, SharedCounts};
pub use zone::{Zone, ZoneSet};
