//! streamwatch
//!
//! Real-time multi-stream video object-detection and event pipeline.
//!
//! # Architecture
//!
//! Frames flow through five stages, each with bounded buffers and local
//! failure handling:
//!
//! 1. **Source adapters** (`source`): one per stream, reconnect with
//!    exponential backoff, newest-wins admission into the scheduler.
//! 2. **Inference scheduler** (`detect`): batches frames across streams,
//!    weighted fair draining, bounded worker pool.
//! 3. **Tracker** (`track`): per-stream track lifecycle
//!    (Tentative → Confirmed → Lost), deterministic matching.
//! 4. **Event aggregator** (`event`): Enter/Exit/Dwell/CountUpdate with
//!    zone geometry, debouncing, and snapshot counts.
//! 5. **Pub/sub gateway** (`gateway`): at-most-once fan-out with bounded
//!    per-subscriber buffers and drop-oldest overflow.
//!
//! Loss of one stream never corrupts tracking or events of another.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};

pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod gateway;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod track;

pub use config::StreamwatchConfig;
pub use detect::{DetectionModel, InferenceScheduler, SchedulerConfig, StubModel};
pub use event::{CountSnapshot, EventAggregator, EventKind, EventRecord, SharedCounts, Zone, ZoneSet};
pub use frame::{BoundingBox, Detection, Frame, FrameDetections, ObjectClass};
pub use gateway::{
    Gateway, GatewayMessage, GatewayPayload, MqttPublisher, Subscription, Topic, TopicFilter,
    TopicKind,
};
pub use pipeline::{Pipeline, PipelineContext, PipelineStats};
pub use sink::{EventSink, InMemoryEventSink, SqliteEventSink};
pub use source::{FrameSource, SourceSupervisor, SyntheticSource};
pub use track::{Track, TrackObservation, TrackState, Tracker, TrackerConfig, TrackerUpdate};

/// Typed error kinds for the failures the pipeline handles by policy.
///
/// Most call sites use `anyhow` directly; this type exists for the few
/// places where the handling policy depends on the kind, and it converts
/// into `anyhow::Error` like any other error.
#[derive(Clone, Debug)]
pub enum PipelineError {
    /// Stream disconnected or failed to produce a frame. Retried with
    /// exponential backoff; other streams are unaffected.
    SourceUnavailable { stream_id: String, reason: String },
    /// A single frame failed inside a model call. Logged and skipped; the
    /// rest of its batch continues.
    InferenceFailure {
        stream_id: String,
        frame_seq: u64,
        reason: String,
    },
    /// A subscriber was unreachable or its buffer full. The delivery is
    /// dropped for that subscriber and counted; never fatal.
    GatewayPublishFailure { topic: String, reason: String },
    /// Malformed configuration at startup. Fatal; the process refuses to
    /// start.
    InvalidConfig(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::SourceUnavailable { stream_id, reason } => {
                write!(f, "source unavailable (stream={}): {}", stream_id, reason)
            }
            PipelineError::InferenceFailure {
                stream_id,
                frame_seq,
                reason,
            } => write!(
                f,
                "inference failure (stream={}, seq={}): {}",
                stream_id, frame_seq, reason
            ),
            PipelineError::GatewayPublishFailure { topic, reason } => {
                write!(f, "gateway publish failure (topic={}): {}", topic, reason)
            }
            PipelineError::InvalidConfig(reason) => {
                write!(f, "invalid configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// Validate a stream or zone identifier.
///
/// Identifiers appear in topics, config keys, and the wire schema, so they
/// are held to a strict allowlist: 1..64 of `[a-z0-9_-]`, compared
/// case-insensitively.
pub fn validate_identifier(id: &str) -> Result<()> {
    // Compile once for hot paths.
    static ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());

    let lowered = id.to_lowercase();
    if !re.is_match(&lowered) {
        return Err(anyhow!(
            "identifier '{}' must match ^[a-z0-9_-]{{1,64}}$",
            id
        ));
    }
    Ok(())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> Result<u64> {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
    Ok(now.as_millis() as u64)
}
