//! Single-slot frame scheduler.
//!
//! At most one frame is processed at a time and at most one waits. A frame
//! submitted while another is pending replaces it, and frames are delivered
//! in strictly increasing timestamp order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::frame::VideoFrame;
use crate::pipeline::FrameEffectsPipeline;
use crate::settings::EffectsConfigHandle;

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub submitted: AtomicU64,
    pub processed: AtomicU64,
    pub dropped: AtomicU64,
}

impl SchedulerStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Shared {
    pending: Mutex<Option<VideoFrame>>,
    notify: Notify,
    closed: AtomicBool,
    stats: Arc<SchedulerStats>,
}

impl Shared {
    fn take_pending(&self) -> Option<VideoFrame> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

pub struct FrameScheduler;

impl FrameScheduler {
    /// Start the worker. Processed frames go to `sink`; the snapshot is read
    /// from `config` per frame.
    pub fn spawn(
        pipeline: Arc<FrameEffectsPipeline>,
        config: EffectsConfigHandle,
        sink: mpsc::Sender<VideoFrame>,
    ) -> FrameSubmitter {
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            stats: Arc::new(SchedulerStats::default()),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), pipeline, config, sink));
        FrameSubmitter {
            shared,
            worker: Some(worker),
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    pipeline: Arc<FrameEffectsPipeline>,
    config: EffectsConfigHandle,
    sink: mpsc::Sender<VideoFrame>,
) {
    let mut last_delivered: Option<u64> = None;
    loop {
        let frame = loop {
            if shared.closed.load(Ordering::SeqCst) {
                break None;
            }
            if let Some(frame) = shared.take_pending() {
                break Some(frame);
            }
            shared.notify.notified().await;
        };
        let Some(frame) = frame else {
            break;
        };

        if last_delivered.is_some_and(|last| frame.timestamp_us <= last) {
            trace!(timestamp_us = frame.timestamp_us, "dropping stale frame");
            shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let snapshot = config.current();
        let timestamp_us = frame.timestamp_us;
        let out = pipeline.process(frame, &snapshot).await;
        if sink.send(out).await.is_err() {
            debug!("frame sink closed, stopping scheduler");
            break;
        }
        last_delivered = Some(timestamp_us);
        shared.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    if shared.take_pending().is_some() {
        shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
    debug!("frame scheduler stopped");
}

/// Producer side of a [`FrameScheduler`]. Dropping it stops the worker.
pub struct FrameSubmitter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FrameSubmitter {
    /// Queue a frame, replacing any frame still waiting. Returns `false` once
    /// the scheduler has stopped.
    pub fn submit(&self, frame: VideoFrame) -> bool {
        if self.shared.closed.load(Ordering::SeqCst)
            || self.worker.as_ref().is_some_and(|w| w.is_finished())
        {
            return false;
        }
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(frame);
        if replaced.is_some() {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        true
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.shared.stats.clone()
    }

    /// Stop the worker and wait for it to finish its current frame.
    pub async fn shutdown(mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for FrameSubmitter {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}
