//! RTSP frame source (feature `rtsp-gstreamer`).
//!
//! Decodes a live camera feed via a GStreamer pipeline:
//! `rtspsrc ! decodebin ! videoconvert ! appsink` configured for RGB with
//! `max-buffers=1 drop=true`, so decode-side buffering never grows.
//!
//! Errors surface as `SourceUnavailable` through the supervisor, which
//! drops this source and reopens it after backoff.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::config::StreamSettings;
use crate::frame::Frame;
use crate::now_ms;

use super::FrameSource;

pub struct RtspSource {
    settings: StreamSettings,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    seq: u64,
}

impl RtspSource {
    pub fn new(settings: StreamSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            settings.uri
        );
        let pipeline = gstreamer::parse_launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            settings,
            pipeline,
            appsink,
            seq: 0,
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.settings.fps == 0 {
            500
        } else {
            (1000 / self.settings.fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(Duration::from_millis(0)) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!(
            "stream {}: connected to {}",
            self.settings.id,
            self.settings.uri
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;

        let sample = self
            .appsink
            .try_pull_sample(self.frame_timeout())
            .context("pull RTSP sample")?
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.seq += 1;

        Ok(Frame::new(
            self.settings.id.clone(),
            self.seq,
            now_ms()?,
            width,
            height,
            pixels,
        ))
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride(0) as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
