//! streamwatchd - multi-stream detection pipeline daemon
//!
//! This daemon:
//! 1. Loads and validates the stream/zone configuration
//! 2. Starts source adapters, the inference scheduler, and per-stream
//!    tracker workers
//! 3. Fans events out through the gateway (and MQTT when configured)
//! 4. Appends events and periodic count snapshots to the durable sink
//! 5. Logs pipeline health on an interval until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use streamwatch::gateway::MqttPublisher;
use streamwatch::{DetectionModel, Pipeline, StreamwatchConfig, StubModel, TopicFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Real-time multi-stream object detection and event pipeline"
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "STREAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between health log lines.
    #[arg(long, default_value_t = 30)]
    health_interval_s: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => StreamwatchConfig::load_from(path)?,
        None => StreamwatchConfig::load()?,
    };

    // The stub model detects bright regions; swap in a real backend by
    // passing another DetectionModel here.
    let model = Arc::new(StubModel::new());
    log::info!("detection model: {}", model.name());
    let pipeline = Pipeline::start(&config, model)?;

    let mqtt = match &config.gateway.mqtt {
        Some(settings) => {
            let subscription = pipeline.subscribe(TopicFilter::events());
            Some(MqttPublisher::spawn(settings, subscription)?)
        }
        None => None,
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    log::info!("streamwatchd running ({} streams). Ctrl-C to stop.", config.streams.len());

    let interval = Duration::from_secs(args.health_interval_s.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => log_health(&pipeline),
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    if let Some(mqtt) = mqtt {
        mqtt.shutdown();
    }
    pipeline.shutdown();
    Ok(())
}

fn log_health(pipeline: &Pipeline) {
    let sched = pipeline.scheduler().stats();
    let stats = &pipeline.context().stats;
    let counts = pipeline.counts_snapshot();
    log::info!(
        "health: submitted={} dropped={} batches={} infer_fail={} tracked={} events={} \
         gw_dropped={} sink_fail={} active={:?}",
        sched.frames_submitted.load(Ordering::Relaxed),
        sched.frames_dropped.load(Ordering::Relaxed),
        sched.batches_run.load(Ordering::Relaxed),
        sched.inference_failures.load(Ordering::Relaxed),
        stats.frames_tracked.load(Ordering::Relaxed),
        stats.events_published.load(Ordering::Relaxed),
        pipeline.gateway_dropped(),
        stats.sink_failures.load(Ordering::Relaxed),
        counts.per_class,
    );
}
