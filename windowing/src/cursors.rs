/// Head/tail bookkeeping shared by the producers and the window coordinator
///
/// All three cursors are monotonically increasing logical frame counters; the
/// physical ring slot of a cursor is `cursor % capacity`.
///
/// - `head` is the first frame of the next window the coordinator will copy.
/// - `tail_flow` / `tail_track` count the frames each producer has published.
///
/// Invariant: `head <= tail <= head + capacity` for both tails. A producer may
/// publish frame `f` only while `f < head + capacity`, otherwise it would
/// overwrite a slot that still belongs to the pending window.
use crate::error::{Result, WindowingError};
use crate::types::PipelineStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    head: usize,
    tail_flow: usize,
    tail_track: usize,
    capacity: usize,
}

impl Cursors {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: 0,
            tail_flow: 0,
            tail_track: 0,
            capacity,
        }
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tail(&self, stage: PipelineStage) -> usize {
        match stage {
            PipelineStage::OpticalFlow => self.tail_flow,
            PipelineStage::Tracking => self.tail_track,
            PipelineStage::Coordinator | PipelineStage::Writer => self.head,
        }
    }

    /// Backpressure check: can `stage` publish its next frame without overwriting live data
    pub fn can_publish(&self, stage: PipelineStage) -> bool {
        self.tail(stage) < self.head + self.capacity
    }

    /// Record that `stage` wrote its next frame into the ring
    pub fn publish(&mut self, stage: PipelineStage) -> Result<usize> {
        if !self.can_publish(stage) {
            return Err(WindowingError::stall(
                stage,
                self.tail(stage),
                format!(
                    "publish would overwrite slot {} still held by window starting at {}",
                    self.tail(stage) % self.capacity,
                    self.head
                ),
            ));
        }
        let tail = match stage {
            PipelineStage::OpticalFlow => &mut self.tail_flow,
            PipelineStage::Tracking => &mut self.tail_track,
            other => {
                return Err(WindowingError::stall(
                    other,
                    self.head,
                    "only producer stages publish frames",
                ))
            }
        };
        *tail += 1;
        let published = *tail;
        self.check_divergence()?;
        Ok(published)
    }

    /// A full window starting at `head` is present in both rings
    ///
    /// Equivalent to the physical test `tail_flow == tail_track` and
    /// `(tail + 1) mod capacity == head` when the tails denote the last written slot.
    pub fn window_ready(&self) -> Result<bool> {
        self.check_divergence()?;
        Ok(self.tail_flow == self.tail_track && self.tail_flow == self.head + self.capacity)
    }

    /// Release the first `stride` slots of the current window back to the producers
    pub fn advance_head(&mut self, stride: usize) {
        self.head += stride;
    }

    /// Fail fast when one producer runs more than a buffer length ahead of the other
    pub fn check_divergence(&self) -> Result<()> {
        if self.tail_flow.abs_diff(self.tail_track) > self.capacity {
            return Err(WindowingError::CursorDivergence {
                tail_flow: self.tail_flow,
                tail_track: self.tail_track,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Both tails stay within `[head, head + capacity]`
    pub fn invariant_holds(&self) -> bool {
        let upper = self.head + self.capacity;
        (self.head..=upper).contains(&self.tail_flow) && (self.head..=upper).contains(&self.tail_track)
    }
}
