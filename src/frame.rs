//! Core frame and detection types.
//!
//! A `Frame` is immutable once produced by a source adapter. Detections are
//! produced by the model boundary and pass through `Detection::validated`
//! before they enter the pipeline: confidence must be in [0, 1] and boxes
//! are clamped to the owning frame's bounds.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One captured frame from a single stream.
///
/// Pixel data is RGB, row-major, shared behind an `Arc` so frames can move
/// through queues and batches without copying the buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    pub stream_id: String,
    /// Monotonic per-stream sequence number assigned at capture.
    pub seq: u64,
    /// Capture timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pixels: Arc<Vec<u8>>,
}

impl Frame {
    pub fn new(
        stream_id: impl Into<String>,
        seq: u64,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            seq,
            timestamp_ms,
            width,
            height,
            pixels: Arc::new(pixels),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Frame diagonal in pixels. Used to normalize positional distances.
    pub fn diagonal(&self) -> f32 {
        ((self.width as f32).powi(2) + (self.height as f32).powi(2)).sqrt()
    }
}

/// Axis-aligned bounding box, top-left origin, pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection-over-union with another box. Returns 0.0 when the union
    /// is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamp the box to frame bounds. Returns `None` when nothing remains.
    pub fn clamped(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.w).min(width as f32);
        let y2 = (self.y + self.h).min(height as f32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(BoundingBox::new(x1, y1, x2 - x1, y2 - y1))
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.x + self.w <= width as f32
            && self.y + self.h <= height as f32
    }
}

/// Object classes the pipeline distinguishes.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

/// One detection from the model, bound to the frame it was produced for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub stream_id: String,
    pub frame_seq: u64,
}

impl Detection {
    /// Validate a raw model output against its owning frame.
    ///
    /// Out-of-range confidence is rejected. Boxes that overhang the frame
    /// are clamped; boxes with no in-frame area are rejected.
    pub fn validated(
        class: ObjectClass,
        confidence: f32,
        bbox: BoundingBox,
        frame: &Frame,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!(
                "detection confidence {} out of [0,1] (stream={}, seq={})",
                confidence,
                frame.stream_id,
                frame.seq
            ));
        }
        let bbox = bbox.clamped(frame.width, frame.height).ok_or_else(|| {
            anyhow!(
                "detection box has no area inside {}x{} frame (stream={}, seq={})",
                frame.width,
                frame.height,
                frame.stream_id,
                frame.seq
            )
        })?;
        Ok(Self {
            class,
            confidence,
            bbox,
            stream_id: frame.stream_id.clone(),
            frame_seq: frame.seq,
        })
    }
}

/// Validated detections for a single frame, as handed to the tracker.
/// Carries the frame itself so downstream stages can publish annotated
/// frames; the pixel buffer is shared, not copied.
#[derive(Clone, Debug)]
pub struct FrameDetections {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl FrameDetections {
    pub fn empty_for(frame: &Frame) -> Self {
        Self {
            frame: frame.clone(),
            detections: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.frame.stream_id
    }

    pub fn seq(&self) -> u64 {
        self.frame.seq
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.frame.timestamp_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> Frame {
        Frame::new("cam_a", 1, 1_700_000_000_000, 640, 480, vec![0; 640 * 480 * 3])
    }

    #[test]
    fn iou_identical_boxes_is_one() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(100.0, 100.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn validated_rejects_bad_confidence() {
        let frame = test_frame();
        let bbox = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!(Detection::validated(ObjectClass::Person, 1.2, bbox, &frame).is_err());
        assert!(Detection::validated(ObjectClass::Person, -0.1, bbox, &frame).is_err());
    }

    #[test]
    fn validated_clamps_overhanging_box() {
        let frame = test_frame();
        let bbox = BoundingBox::new(600.0, 440.0, 100.0, 100.0);
        let det = Detection::validated(ObjectClass::Person, 0.9, bbox, &frame).unwrap();
        assert!(det.bbox.fits_within(frame.width, frame.height));
    }

    #[test]
    fn validated_rejects_fully_outside_box() {
        let frame = test_frame();
        let bbox = BoundingBox::new(700.0, 500.0, 20.0, 20.0);
        assert!(Detection::validated(ObjectClass::Person, 0.9, bbox, &frame).is_err());
    }
}
