//! Per-stream source supervision.
//!
//! Each supervisor owns a thread that opens its adapter, pulls frames, and
//! submits them to the ingress. Any adapter error is a `SourceUnavailable`
//! condition: the adapter is dropped and reopened after an exponential
//! backoff with jitter. Successful frames reset the backoff.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StreamSettings;
use crate::PipelineError;

use super::{open, FrameIngress};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;
const BACKOFF_JITTER_MS: u64 = 250;

pub struct SourceSupervisor {
    stream_id: String,
    stop: Arc<AtomicBool>,
    reconnects: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl SourceSupervisor {
    pub fn spawn(settings: StreamSettings, ingress: Arc<dyn FrameIngress>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let reconnects = Arc::new(AtomicU64::new(0));
        let stream_id = settings.id.clone();

        let thread_stop = stop.clone();
        let thread_reconnects = reconnects.clone();
        let handle = std::thread::spawn(move || {
            run_loop(settings, ingress, thread_stop, thread_reconnects);
        });

        Self {
            stream_id,
            stop,
            reconnects,
            handle: Some(handle),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Number of reconnect attempts since start.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Signal the thread to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Signal the thread to stop and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SourceSupervisor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    settings: StreamSettings,
    ingress: Arc<dyn FrameIngress>,
    stop: Arc<AtomicBool>,
    reconnects: Arc<AtomicU64>,
) {
    let mut backoff_ms = BACKOFF_BASE_MS;

    'reconnect: while !stop.load(Ordering::SeqCst) {
        let mut source = match open(&settings) {
            Ok(source) => source,
            Err(e) => {
                warn_unavailable(&settings.id, &e.to_string());
                backoff_ms = backoff_sleep(&stop, backoff_ms, &reconnects);
                continue;
            }
        };
        if let Err(e) = source.connect() {
            warn_unavailable(&settings.id, &e.to_string());
            backoff_ms = backoff_sleep(&stop, backoff_ms, &reconnects);
            continue;
        }

        while !stop.load(Ordering::SeqCst) {
            match source.next_frame() {
                Ok(frame) => {
                    backoff_ms = BACKOFF_BASE_MS;
                    ingress.submit(frame);
                }
                Err(e) => {
                    warn_unavailable(&settings.id, &e.to_string());
                    backoff_ms = backoff_sleep(&stop, backoff_ms, &reconnects);
                    continue 'reconnect;
                }
            }
        }
    }
    log::info!("stream {}: source supervisor stopped", settings.id);
}

fn warn_unavailable(stream_id: &str, reason: &str) {
    let err = PipelineError::SourceUnavailable {
        stream_id: stream_id.to_string(),
        reason: reason.to_string(),
    };
    log::warn!("{}", err);
}

/// Sleep for the current backoff (interruptible) and return the next one.
fn backoff_sleep(stop: &AtomicBool, backoff_ms: u64, reconnects: &AtomicU64) -> u64 {
    reconnects.fetch_add(1, Ordering::Relaxed);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    let mut remaining = backoff_ms + jitter;
    while remaining > 0 && !stop.load(Ordering::SeqCst) {
        let step = remaining.min(100);
        std::thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
    (backoff_ms * 2).min(BACKOFF_MAX_MS)
}
