//! Inference scheduler.
//!
//! Frames from all streams land in bounded per-stream queues. Worker
//! threads form batches by collecting frames until either the batch-size
//! bound or the wait-time bound is reached, whichever first. Draining is
//! weighted round-robin across streams, so a busy stream cannot starve the
//! rest.
//!
//! Overflow policy is newest-wins: a full queue drops its oldest frame,
//! and only for the affected stream. A non-reentrant model is serialized
//! through a single critical section. One frame's inference failure is
//! logged and skipped without failing its batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::SchedulerSettings;
use crate::frame::{Detection, Frame, FrameDetections};
use crate::source::FrameIngress;
use crate::PipelineError;

use super::model::DetectionModel;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub queue_depth: usize,
    pub workers: usize,
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            batch_size: s.batch_size,
            batch_wait: Duration::from_millis(s.batch_wait_ms),
            queue_depth: s.queue_depth,
            workers: s.workers,
        }
    }
}

struct Pending {
    frame: Frame,
    enqueued: Instant,
}

struct StreamQueue {
    stream_id: String,
    weight: u32,
    frames: VecDeque<Pending>,
    output: SyncSender<FrameDetections>,
}

struct SchedState {
    queues: Vec<StreamQueue>,
    /// Round-robin position for fair draining.
    cursor: usize,
    shutdown: bool,
}

impl SchedState {
    fn total_queued(&self) -> usize {
        self.queues.iter().map(|q| q.frames.len()).sum()
    }

    fn oldest_enqueued(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|q| q.frames.front().map(|p| p.enqueued))
            .min()
    }
}

#[derive(Default)]
pub struct SchedulerStats {
    pub frames_submitted: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub batches_run: AtomicU64,
    pub inference_failures: AtomicU64,
    pub outputs_dropped: AtomicU64,
}

pub struct InferenceScheduler {
    cfg: SchedulerConfig,
    model: Arc<dyn DetectionModel>,
    /// Serialization point for non-reentrant models.
    model_gate: Option<Mutex<()>>,
    state: Mutex<SchedState>,
    available: Condvar,
    stats: SchedulerStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceScheduler {
    pub fn new(cfg: SchedulerConfig, model: Arc<dyn DetectionModel>) -> Arc<Self> {
        let model_gate = if model.is_reentrant() {
            None
        } else {
            Some(Mutex::new(()))
        };
        Arc::new(Self {
            cfg,
            model,
            model_gate,
            state: Mutex::new(SchedState {
                queues: Vec::new(),
                cursor: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            stats: SchedulerStats::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Register a stream and get the receiver its tracker worker reads.
    pub fn register_stream(&self, stream_id: &str, weight: u32) -> Receiver<FrameDetections> {
        let (tx, rx) = std::sync::mpsc::sync_channel(self.cfg.queue_depth);
        let mut state = self.state.lock().unwrap();
        state.queues.push(StreamQueue {
            stream_id: stream_id.to_string(),
            weight: weight.max(1),
            frames: VecDeque::new(),
            output: tx,
        });
        rx
    }

    /// Remove a stream: queued frames are released and the output sender is
    /// dropped, which lets the stream's tracker worker drain and finish.
    /// Frames of that stream already inside a running batch complete.
    pub fn remove_stream(&self, stream_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.queues.retain(|q| q.stream_id != stream_id);
        state.cursor = 0;
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.cfg.workers {
            let scheduler = Arc::clone(self);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("infer-{}", i))
                    .spawn(move || scheduler.worker_loop())
                    .expect("spawn inference worker"),
            );
        }
    }

    /// Stop workers after draining all queued frames.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
        }
        self.available.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Current queue depth for one stream. Test and health hook.
    pub fn queued_for(&self, stream_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .queues
            .iter()
            .find(|q| q.stream_id == stream_id)
            .map(|q| q.frames.len())
            .unwrap_or(0)
    }

    fn worker_loop(&self) {
        loop {
            let Some(batch) = self.collect_batch() else {
                return;
            };
            if !batch.is_empty() {
                self.run_batch(batch);
            }
        }
    }

    /// Block until a batch is ready (size bound or wait bound) or shutdown
    /// with nothing left to drain. Returns `None` to stop the worker.
    fn collect_batch(&self) -> Option<Vec<(Frame, SyncSender<FrameDetections>)>> {
        let mut state = self.state.lock().unwrap();
        loop {
            let total = state.total_queued();
            if total == 0 {
                if state.shutdown {
                    return None;
                }
                state = self.available.wait(state).unwrap();
                continue;
            }
            if total >= self.cfg.batch_size || state.shutdown {
                break;
            }
            let oldest = state.oldest_enqueued().expect("non-empty queues");
            let elapsed = oldest.elapsed();
            if elapsed >= self.cfg.batch_wait {
                break;
            }
            let (next, _timeout) = self
                .available
                .wait_timeout(state, self.cfg.batch_wait - elapsed)
                .unwrap();
            state = next;
        }
        Some(Self::drain_fair(&mut state, self.cfg.batch_size))
    }

    /// Weighted round-robin drain: starting at the cursor, each stream
    /// contributes up to `weight` frames per pass until the batch is full
    /// or every queue is empty.
    fn drain_fair(
        state: &mut SchedState,
        batch_size: usize,
    ) -> Vec<(Frame, SyncSender<FrameDetections>)> {
        let mut batch = Vec::with_capacity(batch_size);
        if state.queues.is_empty() {
            return batch;
        }
        let n = state.queues.len();
        let mut start = state.cursor % n;
        loop {
            let mut took_any = false;
            for offset in 0..n {
                let idx = (start + offset) % n;
                let queue = &mut state.queues[idx];
                for _ in 0..queue.weight {
                    if batch.len() >= batch_size {
                        state.cursor = (idx + 1) % n;
                        return batch;
                    }
                    let Some(pending) = queue.frames.pop_front() else {
                        break;
                    };
                    batch.push((pending.frame, queue.output.clone()));
                    took_any = true;
                }
            }
            if !took_any {
                break;
            }
            start = state.cursor % n;
        }
        state.cursor = (state.cursor + 1) % n;
        batch
    }

    fn run_batch(&self, batch: Vec<(Frame, SyncSender<FrameDetections>)>) {
        self.stats.batches_run.fetch_add(1, Ordering::Relaxed);
        let frames: Vec<Frame> = batch.iter().map(|(f, _)| f.clone()).collect();

        let results = match &self.model_gate {
            Some(gate) => {
                let _serialized = gate.lock().unwrap();
                self.model.infer_batch(&frames)
            }
            None => self.model.infer_batch(&frames),
        };

        for ((frame, output), result) in batch.into_iter().zip(results) {
            match result {
                Ok(raw) => {
                    let detections = self.validate_outputs(&frame, raw);
                    let mut out = FrameDetections::empty_for(&frame);
                    out.detections = detections;
                    match output.try_send(out) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.stats.outputs_dropped.fetch_add(1, Ordering::Relaxed);
                            log::debug!(
                                "stream {}: tracker input full, dropping frame {}",
                                frame.stream_id,
                                frame.seq
                            );
                        }
                        // Stream cancelled; its worker is gone.
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                }
                Err(e) => {
                    self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                    let err = PipelineError::InferenceFailure {
                        stream_id: frame.stream_id.clone(),
                        frame_seq: frame.seq,
                        reason: e.to_string(),
                    };
                    log::warn!("{}", err);
                }
            }
        }
    }

    fn validate_outputs(
        &self,
        frame: &Frame,
        raw: Vec<super::model::RawDetection>,
    ) -> Vec<Detection> {
        let mut detections = Vec::with_capacity(raw.len());
        for r in raw {
            match Detection::validated(r.class, r.confidence, r.bbox, frame) {
                Ok(det) => detections.push(det),
                Err(e) => log::warn!("rejected model output: {}", e),
            }
        }
        detections
    }
}

impl FrameIngress for InferenceScheduler {
    /// Newest-wins admission: a full queue drops its oldest frame. Never
    /// blocks the submitting source thread.
    fn submit(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        let depth = self.cfg.queue_depth;
        let Some(queue) = state
            .queues
            .iter_mut()
            .find(|q| q.stream_id == frame.stream_id)
        else {
            log::debug!("dropping frame for unregistered stream {}", frame.stream_id);
            return;
        };
        self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
        while queue.frames.len() >= depth {
            queue.frames.pop_front();
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.frames.push_back(Pending {
            frame,
            enqueued: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, ObjectClass};
    use anyhow::{anyhow, Result};

    use super::super::model::RawDetection;

    fn test_frame(stream: &str, seq: u64) -> Frame {
        Frame::new(stream, seq, seq * 100, 64, 64, vec![0u8; 64 * 64 * 3])
    }

    fn small_cfg(batch_size: usize, depth: usize) -> SchedulerConfig {
        SchedulerConfig {
            batch_size,
            batch_wait: Duration::from_millis(10),
            queue_depth: depth,
            workers: 1,
        }
    }

    /// Echoes one centered detection per frame; fails frames whose seq is
    /// in the poison list. Non-reentrant to exercise the serialization
    /// gate.
    struct ScriptedModel {
        poison: Vec<u64>,
    }

    impl DetectionModel for ScriptedModel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn infer_batch(&self, frames: &[Frame]) -> Vec<Result<Vec<RawDetection>>> {
            frames
                .iter()
                .map(|f| {
                    if self.poison.contains(&f.seq) {
                        Err(anyhow!("poisoned frame"))
                    } else {
                        Ok(vec![RawDetection {
                            class: ObjectClass::Person,
                            confidence: 0.8,
                            bbox: BoundingBox::new(10.0, 10.0, 20.0, 20.0),
                        }])
                    }
                })
                .collect()
        }
    }

    #[test]
    fn overflow_drops_oldest_and_respects_bound() {
        let scheduler = InferenceScheduler::new(
            small_cfg(64, 3),
            Arc::new(ScriptedModel { poison: vec![] }),
        );
        let _rx = scheduler.register_stream("cam_a", 1);
        // No workers running: queue fills and must cap at depth 3.
        for seq in 1..=10 {
            scheduler.submit(test_frame("cam_a", seq));
        }
        assert_eq!(scheduler.queued_for("cam_a"), 3);
        assert_eq!(scheduler.stats().frames_dropped.load(Ordering::Relaxed), 7);

        // Survivors are the newest three, in order.
        let state = scheduler.state.lock().unwrap();
        let seqs: Vec<u64> = state.queues[0].frames.iter().map(|p| p.frame.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn overflow_affects_only_its_stream() {
        let scheduler = InferenceScheduler::new(
            small_cfg(64, 2),
            Arc::new(ScriptedModel { poison: vec![] }),
        );
        let _rx_a = scheduler.register_stream("cam_a", 1);
        let _rx_b = scheduler.register_stream("cam_b", 1);
        for seq in 1..=5 {
            scheduler.submit(test_frame("cam_a", seq));
        }
        scheduler.submit(test_frame("cam_b", 1));
        assert_eq!(scheduler.queued_for("cam_a"), 2);
        assert_eq!(scheduler.queued_for("cam_b"), 1);
    }

    #[test]
    fn failed_frame_does_not_fail_its_batch() {
        let scheduler = InferenceScheduler::new(
            small_cfg(4, 8),
            Arc::new(ScriptedModel { poison: vec![2] }),
        );
        let rx = scheduler.register_stream("cam_a", 1);
        scheduler.start();
        for seq in 1..=3 {
            scheduler.submit(test_frame("cam_a", seq));
        }

        let mut received = Vec::new();
        while let Ok(out) = rx.recv_timeout(Duration::from_millis(500)) {
            received.push(out.seq());
            if received.len() == 2 {
                break;
            }
        }
        scheduler.shutdown();

        assert_eq!(received, vec![1, 3]);
        assert_eq!(
            scheduler.stats().inference_failures.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn fair_drain_interleaves_streams() {
        let scheduler = InferenceScheduler::new(
            small_cfg(4, 16),
            Arc::new(ScriptedModel { poison: vec![] }),
        );
        let _rx_a = scheduler.register_stream("cam_a", 1);
        let _rx_b = scheduler.register_stream("cam_b", 1);
        for seq in 1..=6 {
            scheduler.submit(test_frame("cam_a", seq));
        }
        for seq in 1..=6 {
            scheduler.submit(test_frame("cam_b", seq));
        }

        let mut state = scheduler.state.lock().unwrap();
        let batch = InferenceScheduler::drain_fair(&mut state, 4);
        let streams: Vec<&str> = batch.iter().map(|(f, _)| f.stream_id.as_str()).collect();
        assert_eq!(streams, vec!["cam_a", "cam_b", "cam_a", "cam_b"]);
    }

    #[test]
    fn weighted_drain_favors_heavier_stream() {
        let scheduler = InferenceScheduler::new(
            small_cfg(6, 16),
            Arc::new(ScriptedModel { poison: vec![] }),
        );
        let _rx_a = scheduler.register_stream("cam_a", 2);
        let _rx_b = scheduler.register_stream("cam_b", 1);
        for seq in 1..=6 {
            scheduler.submit(test_frame("cam_a", seq));
            scheduler.submit(test_frame("cam_b", seq));
        }

        let mut state = scheduler.state.lock().unwrap();
        let batch = InferenceScheduler::drain_fair(&mut state, 6);
        let a_count = batch.iter().filter(|(f, _)| f.stream_id == "cam_a").count();
        let b_count = batch.iter().filter(|(f, _)| f.stream_id == "cam_b").count();
        assert_eq!(a_count, 4);
        assert_eq!(b_count, 2);
    }

    #[test]
    fn shutdown_drains_queued_frames() {
        let scheduler = InferenceScheduler::new(
            small_cfg(2, 8),
            Arc::new(ScriptedModel { poison: vec![] }),
        );
        let rx = scheduler.register_stream("cam_a", 1);
        for seq in 1..=4 {
            scheduler.submit(test_frame("cam_a", seq));
        }
        scheduler.start();
        scheduler.shutdown();

        let mut seqs = Vec::new();
        while let Ok(out) = rx.try_recv() {
            seqs.push(out.seq());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
