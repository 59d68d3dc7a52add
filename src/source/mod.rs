//! Frame source adapters.
//!
//! One supervisor per stream pulls frames from its adapter at the source's
//! native rate and submits them downstream. Admission is newest-wins: the
//! downstream queue is bounded and drops its oldest entry, so a slow
//! consumer costs stale frames, not latency.
//!
//! On disconnect the supervisor retries with exponential backoff. A failing
//! stream never blocks the others.

mod supervisor;
mod synthetic;

#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;

pub use supervisor::SourceSupervisor;
pub use synthetic::SyntheticSource;

use anyhow::{anyhow, Result};

use crate::config::StreamSettings;
use crate::frame::Frame;

/// A per-stream frame producer.
///
/// Implementations block in `next_frame` until a frame is available or the
/// source fails. A failed source is discarded and reopened by the
/// supervisor; implementations do not retry internally.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;
    fn next_frame(&mut self) -> Result<Frame>;
}

/// Where supervisors hand frames off to. Implemented by the inference
/// scheduler. Must never block: overflow policy is the implementor's.
pub trait FrameIngress: Send + Sync {
    fn submit(&self, frame: Frame);
}

/// Open the adapter for a stream URI.
///
/// - `stub://…` produces a synthetic scene (tests, demos)
/// - `rtsp://…` decodes a live camera feed (feature `rtsp-gstreamer`)
pub fn open(settings: &StreamSettings) -> Result<Box<dyn FrameSource>> {
    if settings.uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    if settings.uri.starts_with("rtsp://") {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            return Ok(Box::new(rtsp::RtspSource::new(settings.clone())?));
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            return Err(anyhow!(
                "stream '{}': rtsp URIs require the rtsp-gstreamer feature",
                settings.id
            ));
        }
    }
    Err(anyhow!(
        "stream '{}': unsupported source uri '{}'",
        settings.id,
        settings.uri
    ))
}
