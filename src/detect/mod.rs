//! Detection model boundary and inference scheduling.
//!
//! The model itself is a black box behind `DetectionModel`. The scheduler
//! owns all batching, fairness, and backpressure decisions; model outputs
//! are validated into `Detection` records before they enter the pipeline.

mod model;
mod scheduler;

pub use model::{DetectionModel, RawDetection, StubModel};
pub use scheduler::{InferenceScheduler, SchedulerConfig};
