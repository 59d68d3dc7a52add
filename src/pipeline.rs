//! Pipeline assembly and lifecycle.
//!
//! Wires sources, the inference scheduler, per-stream tracker workers,
//! the event aggregator, the gateway, and the optional durable sink into
//! one running unit. Shared state travels in an explicit
//! `PipelineContext` handed to each worker; nothing is process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{EventSettings, StreamSettings, StreamwatchConfig};
use crate::detect::{DetectionModel, InferenceScheduler};
use crate::event::{CountSnapshot, EventAggregator, SharedCounts, ZoneSet};
use crate::frame::FrameDetections;
use crate::gateway::{Gateway, GatewayPayload, Subscription, Topic, TopicFilter};
use crate::now_ms;
use crate::sink::{EventSink, SqliteEventSink};
use crate::source::SourceSupervisor;
use crate::track::{Tracker, TrackerConfig};

/// Cadence of aggregate count snapshots written to the sink.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const SINK_TICK: Duration = Duration::from_millis(250);

#[derive(Default)]
pub struct PipelineStats {
    pub frames_tracked: AtomicU64,
    pub events_published: AtomicU64,
    pub sink_failures: AtomicU64,
}

/// Shared state every worker gets explicitly.
pub struct PipelineContext {
    pub model: Arc<dyn DetectionModel>,
    pub zones: Arc<ZoneSet>,
    pub counts: SharedCounts,
    pub stats: Arc<PipelineStats>,
    pub tracker: TrackerConfig,
    pub events: EventSettings,
}

struct StreamRuntime {
    supervisor: SourceSupervisor,
    worker: JoinHandle<()>,
}

struct SinkRuntime {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    scheduler: Arc<InferenceScheduler>,
    gateway: Arc<Gateway>,
    streams: Mutex<HashMap<String, StreamRuntime>>,
    sink: Mutex<Option<SinkRuntime>>,
}

impl Pipeline {
    /// Build and start the whole pipeline from a validated config.
    pub fn start(config: &StreamwatchConfig, model: Arc<dyn DetectionModel>) -> Result<Self> {
        let sink = match &config.sink_db_path {
            Some(path) => Some(Box::new(
                SqliteEventSink::open(path)
                    .with_context(|| format!("failed to open event sink {}", path))?,
            ) as Box<dyn EventSink>),
            None => None,
        };
        Self::start_with_sink(config, model, sink)
    }

    /// As `start`, with the sink supplied by the caller.
    pub fn start_with_sink(
        config: &StreamwatchConfig,
        model: Arc<dyn DetectionModel>,
        sink: Option<Box<dyn EventSink>>,
    ) -> Result<Self> {
        let zones = Arc::new(ZoneSet::from_settings(&config.zones)?);
        let ctx = Arc::new(PipelineContext {
            model: model.clone(),
            zones,
            counts: SharedCounts::new(),
            stats: Arc::new(PipelineStats::default()),
            tracker: TrackerConfig::from(&config.tracker),
            events: config.events.clone(),
        });
        let scheduler = InferenceScheduler::new((&config.scheduler).into(), model);
        scheduler.start();
        let gateway = Arc::new(Gateway::new(config.gateway.subscriber_buffer));

        let pipeline = Self {
            ctx,
            scheduler,
            gateway,
            streams: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
        };
        if let Some(sink) = sink {
            pipeline.spawn_sink(sink)?;
        }
        for stream in &config.streams {
            pipeline.spawn_stream(stream)?;
        }
        log::info!(
            "pipeline started: {} stream(s), {} worker(s)",
            config.streams.len(),
            config.scheduler.workers
        );
        Ok(pipeline)
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Arc<InferenceScheduler> {
        &self.scheduler
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        self.gateway.subscribe(filter)
    }

    pub fn counts_snapshot(&self) -> CountSnapshot {
        self.ctx.counts.snapshot()
    }

    pub fn gateway_dropped(&self) -> u64 {
        self.gateway.dropped_total()
    }

    fn spawn_stream(&self, settings: &StreamSettings) -> Result<()> {
        let rx = self.scheduler.register_stream(&settings.id, settings.weight);
        let worker = {
            let ctx = self.ctx.clone();
            let gateway = self.gateway.clone();
            let stream_id = settings.id.clone();
            std::thread::Builder::new()
                .name(format!("track-{}", settings.id))
                .spawn(move || tracker_worker(ctx, gateway, stream_id, rx))
                .context("failed to spawn tracker worker")?
        };
        let supervisor = SourceSupervisor::spawn(settings.clone(), self.scheduler.clone());
        let mut streams = self.streams.lock().unwrap();
        streams.insert(settings.id.clone(), StreamRuntime { supervisor, worker });
        Ok(())
    }

    /// Cancel one stream: stop its source, release its queues, drain its
    /// in-flight inference, and mark its tracks Lost (emitting exits).
    /// Other streams are untouched. Returns false for an unknown id.
    pub fn stop_stream(&self, stream_id: &str) -> bool {
        let Some(runtime) = self.streams.lock().unwrap().remove(stream_id) else {
            return false;
        };
        runtime.supervisor.stop();
        // Dropping the stream's output sender ends its worker after the
        // remaining deliveries are drained.
        self.scheduler.remove_stream(stream_id);
        if runtime.worker.join().is_err() {
            log::warn!("tracker worker for stream {} panicked", stream_id);
        }
        log::info!("stream {} stopped", stream_id);
        true
    }

    /// Orderly shutdown: sources first, then the scheduler (draining its
    /// queues), then the tracker workers, then the sink.
    pub fn shutdown(self) {
        let runtimes: Vec<(String, StreamRuntime)> =
            self.streams.lock().unwrap().drain().collect();
        for (_, runtime) in &runtimes {
            // Stop producing before draining. Supervisors join on drop,
            // but stopping them all first keeps shutdown prompt.
            runtime.supervisor.request_stop();
        }
        let mut joined = Vec::with_capacity(runtimes.len());
        for (stream_id, runtime) in runtimes {
            runtime.supervisor.stop();
            joined.push((stream_id, runtime.worker));
        }
        self.scheduler.shutdown();
        for (stream_id, _) in &joined {
            self.scheduler.remove_stream(stream_id);
        }
        for (stream_id, worker) in joined {
            if worker.join().is_err() {
                log::warn!("tracker worker for stream {} panicked", stream_id);
            }
        }
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.shutdown.store(true, Ordering::Release);
            let _ = sink.handle.join();
        }
        log::info!("pipeline stopped");
    }

    fn spawn_sink(&self, sink: Box<dyn EventSink>) -> Result<()> {
        let subscription = self.gateway.subscribe(TopicFilter::events());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let counts = self.ctx.counts.clone();
            let stats = self.ctx.stats.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("event-sink".to_string())
                .spawn(move || sink_worker(sink, subscription, counts, stats, shutdown))
                .context("failed to spawn sink worker")?
        };
        *self.sink.lock().unwrap() = Some(SinkRuntime { shutdown, handle });
        Ok(())
    }
}

/// Per-stream worker: tracker plus aggregator, fed by the scheduler.
fn tracker_worker(
    ctx: Arc<PipelineContext>,
    gateway: Arc<Gateway>,
    stream_id: String,
    rx: Receiver<FrameDetections>,
) {
    let mut tracker = Tracker::new(stream_id.clone(), ctx.tracker.clone());
    let mut aggregator = EventAggregator::new(
        stream_id.clone(),
        ctx.events.clone(),
        ctx.zones.clone(),
        ctx.counts.clone(),
    );
    let mut last_ts = 0;

    while let Ok(fd) = rx.recv() {
        last_ts = fd.timestamp_ms();
        ctx.stats.frames_tracked.fetch_add(1, Ordering::Relaxed);
        let update = tracker.update(&fd);
        gateway.publish(
            Topic::frames(&stream_id),
            GatewayPayload::Frame {
                frame: fd.frame.clone(),
                detections: fd.detections.clone(),
            },
        );
        publish_events(&ctx, &gateway, &stream_id, aggregator.observe(&update, last_ts));
    }

    // Channel closed: the stream was cancelled or the pipeline is going
    // down. Confirmed tracks still get their exits.
    let update = tracker.close();
    publish_events(&ctx, &gateway, &stream_id, aggregator.observe(&update, last_ts));
}

fn publish_events(
    ctx: &PipelineContext,
    gateway: &Gateway,
    stream_id: &str,
    events: Vec<crate::event::EventRecord>,
) {
    for event in events {
        ctx.stats.events_published.fetch_add(1, Ordering::Relaxed);
        gateway.publish(Topic::events(stream_id), GatewayPayload::Event(event));
    }
}

/// Sink worker: appends every event and a counts snapshot on a timer.
/// Sink errors are counted and logged, never fatal.
fn sink_worker(
    mut sink: Box<dyn EventSink>,
    subscription: Subscription,
    counts: SharedCounts,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_snapshot = Instant::now();
    loop {
        let stopping = shutdown.load(Ordering::Acquire);
        let message = if stopping {
            subscription.try_recv()
        } else {
            subscription.recv_timeout(SINK_TICK)
        };
        match message {
            Some(message) => {
                if let GatewayPayload::Event(event) = message.payload.as_ref() {
                    if let Err(e) = sink.append_event(event) {
                        stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("event sink append failed: {}", e);
                    }
                }
            }
            None if stopping => break,
            None => {}
        }
        if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            last_snapshot = Instant::now();
            write_snapshot(sink.as_mut(), &counts, &stats);
        }
    }
    // Final snapshot so analytics see the terminal state.
    write_snapshot(sink.as_mut(), &counts, &stats);
}

fn write_snapshot(sink: &mut dyn EventSink, counts: &SharedCounts, stats: &PipelineStats) {
    let now = now_ms().unwrap_or_default();
    if let Err(e) = sink.append_snapshot(now, &counts.snapshot()) {
        stats.sink_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("event sink snapshot failed: {}", e);
    }
}
