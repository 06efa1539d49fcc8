/// Per-stage progress counters
///
/// Shared between the producers, the coordinator and the writer pool through
/// an `Arc`. Counters only ever increase, so a stalled stage shows up as a
/// counter that stops moving while the others continue.
use crate::types::PipelineStage;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Progress {
    flow_frames: AtomicUsize,
    track_frames: AtomicUsize,
    windows_dispatched: AtomicUsize,
    windows_written: AtomicUsize,
    windows_failed: AtomicUsize,
    windows_expected: AtomicUsize,
    log_interval: usize,
}

/// Point-in-time copy of [`Progress`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub flow_frames: usize,
    pub track_frames: usize,
    pub windows_dispatched: usize,
    pub windows_written: usize,
    pub windows_failed: usize,
}

impl Progress {
    /// `log_interval` of 0 disables periodic logging
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval,
            ..Default::default()
        }
    }

    /// Count one published frame for a producer stage
    pub fn frame_done(&self, stage: PipelineStage, total: usize) {
        let counter = match stage {
            PipelineStage::OpticalFlow => &self.flow_frames,
            PipelineStage::Tracking => &self.track_frames,
            _ => return,
        };
        let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.due(done, total) {
            log::info!("{}: {}/{} frames", stage, done, total);
        }
    }

    /// Periodic lines, plus one when the last item is done
    fn due(&self, done: usize, total: usize) -> bool {
        self.log_interval > 0 && (done % self.log_interval == 0 || done == total)
    }

    /// Number of windows the run will dispatch, used for the final progress line
    pub fn expect_windows(&self, total: usize) {
        self.windows_expected.store(total, Ordering::Relaxed);
    }

    pub fn window_dispatched(&self) {
        self.windows_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn window_written(&self) {
        let done = self.windows_written.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.windows_expected.load(Ordering::Relaxed);
        if self.due(done, total) {
            log::info!("{}: {}/{} windows written", PipelineStage::Writer, done, total);
        }
    }

    pub fn window_failed(&self) {
        self.windows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self, stage: PipelineStage) -> usize {
        match stage {
            PipelineStage::OpticalFlow => self.flow_frames.load(Ordering::Relaxed),
            PipelineStage::Tracking => self.track_frames.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            flow_frames: self.flow_frames.load(Ordering::Relaxed),
            track_frames: self.track_frames.load(Ordering::Relaxed),
            windows_dispatched: self.windows_dispatched.load(Ordering::Relaxed),
            windows_written: self.windows_written.load(Ordering::Relaxed),
            windows_failed: self.windows_failed.load(Ordering::Relaxed),
        }
    }
}

impl ProgressSnapshot {
    /// Windows dispatched but not yet written or failed
    pub fn windows_pending(&self) -> usize {
        self.windows_dispatched
            .saturating_sub(self.windows_written + self.windows_failed)
    }
}
