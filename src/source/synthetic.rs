//! Synthetic frame source for `stub://` URIs.
//!
//! Renders a dark background with one bright square that drifts across the
//! scene, so the stub model's bright-region scan produces a stable moving
//! detection. Used by tests and demos; always "connected".

use anyhow::Result;
use std::time::Duration;

use crate::config::StreamSettings;
use crate::frame::Frame;
use crate::now_ms;

use super::FrameSource;

const SQUARE_SIZE: u32 = 48;
const DRIFT_PER_FRAME: u32 = 2;

pub struct SyntheticSource {
    settings: StreamSettings,
    seq: u64,
    paced: bool,
}

impl SyntheticSource {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            seq: 0,
            paced: true,
        }
    }

    /// Disable inter-frame sleep. Tests pull frames as fast as they like.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn render(&self) -> Vec<u8> {
        let w = self.settings.width;
        let h = self.settings.height;
        let mut pixels = vec![16u8; (w * h * 3) as usize];

        // Square drifts left-to-right and wraps.
        let travel = w.saturating_sub(SQUARE_SIZE).max(1);
        let sx = ((self.seq as u32) * DRIFT_PER_FRAME) % travel;
        let sy = h / 2 - SQUARE_SIZE.min(h) / 2;

        for row in sy..(sy + SQUARE_SIZE).min(h) {
            for col in sx..(sx + SQUARE_SIZE).min(w) {
                let base = ((row * w + col) * 3) as usize;
                pixels[base] = 230;
                pixels[base + 1] = 230;
                pixels[base + 2] = 230;
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "stream {}: connected to {} (synthetic)",
            self.settings.id,
            self.settings.uri
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.paced && self.settings.fps > 0 {
            std::thread::sleep(Duration::from_millis(1000 / self.settings.fps as u64));
        }
        self.seq += 1;
        let frame = Frame::new(
            self.settings.id.clone(),
            self.seq,
            now_ms()?,
            self.settings.width,
            self.settings.height,
            self.render(),
        );
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_settings() -> StreamSettings {
        StreamSettings {
            id: "cam_a".to_string(),
            uri: "stub://cam_a".to_string(),
            fps: 10,
            width: 320,
            height: 240,
            weight: 1,
        }
    }

    #[test]
    fn produces_sequenced_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_settings()).unpaced();
        source.connect()?;
        let a = source.next_frame()?;
        let b = source.next_frame()?;
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(a.width, 320);
        assert_eq!(a.pixels().len(), 320 * 240 * 3);
        Ok(())
    }

    #[test]
    fn scene_changes_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_settings()).unpaced();
        source.connect()?;
        let a = source.next_frame()?;
        let b = source.next_frame()?;
        assert_ne!(a.pixels(), b.pixels());
        Ok(())
    }
}
