//! Detection model boundary.

use anyhow::Result;

use crate::frame::{BoundingBox, Frame, ObjectClass};

/// Unvalidated model output for one object. Becomes a `Detection` only
/// after `Detection::validated` at the scheduler boundary.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Black-box detection model.
///
/// Takes a batch of frames, returns one result per frame in order. A
/// per-frame `Err` isolates that frame's failure; the rest of the batch is
/// unaffected.
pub trait DetectionModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether concurrent `infer_batch` calls are safe. When false, the
    /// scheduler serializes access through a single critical section.
    fn is_reentrant(&self) -> bool {
        false
    }

    fn infer_batch(&self, frames: &[Frame]) -> Vec<Result<Vec<RawDetection>>>;
}

/// Stub model: reports the bounding box of bright pixels.
///
/// Pairs with `SyntheticSource`, whose drifting bright square then shows up
/// as one stable moving detection. Stateless, so reentrant.
pub struct StubModel {
    luminance_floor: u8,
}

const STUB_SAMPLE_STEP: u32 = 2;
const STUB_MIN_SAMPLES: u32 = 16;

impl StubModel {
    pub fn new() -> Self {
        Self {
            luminance_floor: 180,
        }
    }

    fn detect_one(&self, frame: &Frame) -> Vec<RawDetection> {
        let pixels = frame.pixels();
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut samples = 0u32;

        for y in (0..frame.height).step_by(STUB_SAMPLE_STEP as usize) {
            for x in (0..frame.width).step_by(STUB_SAMPLE_STEP as usize) {
                let base = ((y * frame.width + x) * 3) as usize;
                // Cheap luminance: max channel.
                let lum = pixels[base].max(pixels[base + 1]).max(pixels[base + 2]);
                if lum >= self.luminance_floor {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                    samples += 1;
                }
            }
        }

        if samples < STUB_MIN_SAMPLES {
            return Vec::new();
        }
        vec![RawDetection {
            class: ObjectClass::Person,
            confidence: 0.9,
            bbox: BoundingBox::new(
                min_x as f32,
                min_y as f32,
                (max_x - min_x + STUB_SAMPLE_STEP) as f32,
                (max_y - min_y + STUB_SAMPLE_STEP) as f32,
            ),
        }]
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionModel for StubModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_reentrant(&self) -> bool {
        true
    }

    fn infer_batch(&self, frames: &[Frame]) -> Vec<Result<Vec<RawDetection>>> {
        frames.iter().map(|f| Ok(self.detect_one(f))).collect()
    }
}
