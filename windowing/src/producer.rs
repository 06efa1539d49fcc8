//! Producer stages and the state they share with the coordinator
//!
//! Both producers run on their own thread:
//!
//! 1. read frame `f` from the shared [`FrameSource`] (under the lock),
//! 2. compute flow or detections for it (outside the lock, unbounded time),
//! 3. wait until `f < head + capacity`, write the ring slot, advance the tail.
//!
//! Step 3 is the only place a producer suspends. Waiting uses the shared
//! condition variable with a bounded timeout, so a missed notification costs
//! at most one poll interval.

use crate::cursors::Cursors;
use crate::error::{Result, WindowingError};
use crate::flow::FlowEstimator;
use crate::frame_source::FrameSource;
use crate::progress::Progress;
use crate::ring_buffer::RingBuffer;
use crate::tracking::TrackingInput;
use crate::types::{DetectionSet, FlowField, Frame, PipelineStage};
use crate::window::WindowSnapshot;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// A frame together with the flow field ending at it
#[derive(Debug, Clone)]
pub struct FlowSlot {
    pub frame: Frame,
    pub flow: FlowField,
}

struct PipelineState {
    source: Box<dyn FrameSource>,
    flow_ring: RingBuffer<FlowSlot>,
    track_ring: RingBuffer<DetectionSet>,
    cursors: Cursors,
    failure: Option<WindowingError>,
    producers_finished: usize,
    aborted: bool,
    last_publish: Instant,
}

/// Rings, cursors and frame source behind one mutex
pub struct SharedState {
    state: Mutex<PipelineState>,
    changed: Condvar,
    poll_interval: Duration,
    frame_count: usize,
}

impl SharedState {
    pub fn new(source: Box<dyn FrameSource>, capacity: usize, poll_interval: Duration) -> Result<Self> {
        let frame_count = source.frame_count();
        Ok(Self {
            state: Mutex::new(PipelineState {
                source,
                flow_ring: RingBuffer::new(capacity)?,
                track_ring: RingBuffer::new(capacity)?,
                cursors: Cursors::new(capacity),
                failure: None,
                producers_finished: 0,
                aborted: false,
                last_publish: Instant::now(),
            }),
            changed: Condvar::new(),
            poll_interval,
            frame_count,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn lock(&self) -> Result<MutexGuard<'_, PipelineState>> {
        self.state
            .lock()
            .map_err(|_| WindowingError::poisoned("pipeline state"))
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PipelineState>) -> Result<MutexGuard<'a, PipelineState>> {
        self.changed
            .wait_timeout(guard, self.poll_interval)
            .map(|(guard, _)| guard)
            .map_err(|_| WindowingError::poisoned("pipeline state"))
    }

    /// Read frame `index`; reads are serialized with every other state access
    pub fn read_frame(&self, index: usize) -> Result<Frame> {
        let mut state = self.lock()?;
        state.source.read(index)
    }

    /// Wait for backpressure to clear, then write `index`'s slot and advance the tail
    ///
    /// Returns `false` without publishing when the run was aborted.
    fn publish<F>(&self, stage: PipelineStage, index: usize, write: F) -> Result<bool>
    where
        F: FnOnce(&mut PipelineState),
    {
        let mut state = self.lock()?;
        loop {
            if state.aborted {
                return Ok(false);
            }
            if state.cursors.can_publish(stage) {
                break;
            }
            state = self.wait(state)?;
        }
        let tail = state.cursors.tail(stage);
        if tail != index {
            return Err(WindowingError::stall(
                stage,
                index,
                format!("out of order publish, tail is at {}", tail),
            ));
        }
        write(&mut *state);
        state.cursors.publish(stage)?;
        state.last_publish = Instant::now();
        drop(state);
        self.changed.notify_all();
        Ok(true)
    }

    pub fn publish_flow(&self, slot: FlowSlot) -> Result<bool> {
        let index = slot.frame.index;
        self.publish(PipelineStage::OpticalFlow, index, |state| {
            state.flow_ring.write(index, slot)
        })
    }

    pub fn publish_detections(&self, set: DetectionSet) -> Result<bool> {
        let index = set.frame_index;
        self.publish(PipelineStage::Tracking, index, |state| {
            state.track_ring.write(index, set)
        })
    }

    /// Record a producer failure; the first one wins
    pub fn fail(&self, error: WindowingError) {
        log::error!("{}", error);
        if let Ok(mut state) = self.state.lock() {
            if state.failure.is_none() {
                state.failure = Some(error);
            }
        }
        self.changed.notify_all();
    }

    pub fn producer_finished(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.producers_finished += 1;
        }
        self.changed.notify_all();
    }

    /// Release any producer waiting on backpressure; they stop without publishing
    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.changed.notify_all();
    }

    /// Take the recorded producer failure, if any
    pub fn take_failure(&self) -> Result<Option<WindowingError>> {
        Ok(self.lock()?.failure.take())
    }

    pub fn cursors(&self) -> Result<Cursors> {
        Ok(self.lock()?.cursors)
    }

    /// Block until the window ending at `window_end` is in both rings, then copy it out
    ///
    /// With `stall_timeout` set, a wait during which no producer publishes for
    /// that long fails with [`WindowingError::Stall`] naming the slower stage.
    pub fn wait_for_window(
        &self,
        video_id: &str,
        window_end: usize,
        stall_timeout: Option<Duration>,
    ) -> Result<WindowSnapshot> {
        let wait_start = Instant::now();
        let mut state = self.lock()?;
        loop {
            if let Some(failure) = state.failure.take() {
                return Err(failure);
            }
            let capacity = state.cursors.capacity();
            let head = state.cursors.head();
            if head + capacity != window_end {
                return Err(WindowingError::stall(
                    PipelineStage::Coordinator,
                    head,
                    format!("head does not start the window ending at {}", window_end),
                ));
            }
            if state.cursors.window_ready()? {
                let slots = state.flow_ring.read_range(head, capacity)?;
                let detections = state.track_ring.read_range(head, capacity)?;
                let (frames, flows): (Vec<Frame>, Vec<FlowField>) =
                    slots.into_iter().map(|s| (s.frame, s.flow)).unzip();
                return Ok(WindowSnapshot {
                    video_id: video_id.to_string(),
                    window_end,
                    frames,
                    flows,
                    detections,
                });
            }

            let (stage, tail) = slowest_stage(&state.cursors);
            if state.producers_finished >= 2 {
                return Err(WindowingError::stall(
                    stage,
                    tail,
                    format!("producers finished before frame {}", window_end - 1),
                ));
            }
            if let Some(timeout) = stall_timeout {
                let idle = state.last_publish.max(wait_start).elapsed();
                if idle >= timeout {
                    return Err(WindowingError::stall(
                        stage,
                        tail,
                        format!("no progress for {:.1}s", idle.as_secs_f32()),
                    ));
                }
            }
            state = self.wait(state)?;
        }
    }

    /// Block until both producers have finished or one of them failed
    ///
    /// With `stall_timeout` set, fails with [`WindowingError::Stall`] naming
    /// the slower stage once no producer has published for that long. A
    /// recorded producer failure is left for [`SharedState::take_failure`].
    pub fn wait_for_producers(&self, stall_timeout: Option<Duration>) -> Result<()> {
        let wait_start = Instant::now();
        let mut state = self.lock()?;
        while state.producers_finished < 2 && state.failure.is_none() {
            if let Some(timeout) = stall_timeout {
                let idle = state.last_publish.max(wait_start).elapsed();
                if idle >= timeout {
                    let (stage, tail) = slowest_stage(&state.cursors);
                    return Err(WindowingError::stall(
                        stage,
                        tail,
                        format!("no progress for {:.1}s after the last window", idle.as_secs_f32()),
                    ));
                }
            }
            state = self.wait(state)?;
        }
        Ok(())
    }

    /// Hand the first `stride` slots of the current window back to the producers
    pub fn advance_head(&self, stride: usize) -> Result<()> {
        self.lock()?.cursors.advance_head(stride);
        self.changed.notify_all();
        Ok(())
    }
}

fn slowest_stage(cursors: &Cursors) -> (PipelineStage, usize) {
    let flow = cursors.tail(PipelineStage::OpticalFlow);
    let track = cursors.tail(PipelineStage::Tracking);
    if track < flow {
        (PipelineStage::Tracking, track)
    } else {
        (PipelineStage::OpticalFlow, flow)
    }
}

/// Run a producer body on a named thread, recording any error or panic as a stall
fn spawn_stage<F>(
    stage: PipelineStage,
    shared: Arc<SharedState>,
    body: F,
) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce(&SharedState) -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-producer", stage).replace(' ', "-"))
        .spawn(move || {
            log::info!("{} producer started ({} frames)", stage, shared.frame_count());
            match panic::catch_unwind(AssertUnwindSafe(|| body(shared.as_ref()))) {
                Ok(Ok(())) => log::info!("{} producer finished", stage),
                Ok(Err(e)) => shared.fail(e),
                Err(_) => {
                    let at = shared.cursors().map(|c| c.tail(stage)).unwrap_or(0);
                    shared.fail(WindowingError::stall(stage, at, "producer panicked"));
                }
            }
            shared.producer_finished();
        })
        .map_err(|e| WindowingError::resource(format!("cannot spawn {} producer: {}", stage, e)))
}

/// Wrap a collaborator error as a stall of `stage` at `index`
fn stalled(stage: PipelineStage, index: usize) -> impl FnOnce(WindowingError) -> WindowingError {
    move |e| match e {
        WindowingError::Stall { .. } | WindowingError::CursorDivergence { .. } => e,
        other => WindowingError::stall(stage, index, other.to_string()),
    }
}

/// Publishes `(frame, flow)` for every frame; frame 0 is paired with itself
pub struct OpticalFlowProducer {
    estimator: Box<dyn FlowEstimator>,
}

impl OpticalFlowProducer {
    const STAGE: PipelineStage = PipelineStage::OpticalFlow;

    pub fn new(estimator: Box<dyn FlowEstimator>) -> Self {
        Self { estimator }
    }

    pub fn spawn(
        mut self,
        shared: Arc<SharedState>,
        progress: Arc<Progress>,
    ) -> Result<thread::JoinHandle<()>> {
        spawn_stage(Self::STAGE, shared, move |shared| self.run(shared, &progress))
    }

    fn run(&mut self, shared: &SharedState, progress: &Progress) -> Result<()> {
        let frame_count = shared.frame_count();
        log::debug!("Flow estimator: {}", self.estimator.name());
        let mut prev: Option<Frame> = None;

        for index in 0..frame_count {
            let frame = shared.read_frame(index).map_err(stalled(Self::STAGE, index))?;
            let flow = self
                .estimator
                .compute(prev.as_ref().unwrap_or(&frame), &frame)
                .map_err(stalled(Self::STAGE, index))?;

            let slot = FlowSlot {
                frame: frame.clone(),
                flow,
            };
            if !shared.publish_flow(slot).map_err(stalled(Self::STAGE, index))? {
                log::debug!("{} producer aborted at frame {}", Self::STAGE, index);
                return Ok(());
            }
            progress.frame_done(Self::STAGE, frame_count);
            prev = Some(frame);
        }
        Ok(())
    }
}

/// Publishes the detection set of every frame from a live model or a replayed log
pub struct TrackingProducer {
    input: TrackingInput,
}

impl TrackingProducer {
    const STAGE: PipelineStage = PipelineStage::Tracking;

    pub fn new(input: TrackingInput) -> Self {
        Self { input }
    }

    pub fn spawn(
        mut self,
        shared: Arc<SharedState>,
        progress: Arc<Progress>,
    ) -> Result<thread::JoinHandle<()>> {
        spawn_stage(Self::STAGE, shared, move |shared| self.run(shared, &progress))
    }

    fn run(&mut self, shared: &SharedState, progress: &Progress) -> Result<()> {
        let frame_count = shared.frame_count();
        log::debug!("Tracking input: {}", self.input.describe());

        for index in 0..frame_count {
            let frame = if self.input.needs_frames() {
                Some(shared.read_frame(index).map_err(stalled(Self::STAGE, index))?)
            } else {
                None
            };
            let mut set = self
                .input
                .detect(frame.as_ref(), index)
                .map_err(stalled(Self::STAGE, index))?;
            set.frame_index = index;

            if !shared.publish_detections(set).map_err(stalled(Self::STAGE, index))? {
                log::debug!("{} producer aborted at frame {}", Self::STAGE, index);
                return Ok(());
            }
            progress.frame_done(Self::STAGE, frame_count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::LucasKanadeFlow;
    use crate::frame_source::MemoryFrameSource;
    use crate::tracking::DetectionLog;

    fn shared(frames: usize, capacity: usize) -> Arc<SharedState> {
        let source = MemoryFrameSource::synthetic(frames, 8, 8);
        Arc::new(SharedState::new(Box::new(source), capacity, Duration::from_millis(1)).unwrap())
    }

    #[test]
    fn test_producers_stop_at_one_buffer_length() {
        let shared = shared(10, 4);
        let progress = Arc::new(Progress::new(0));
        let flow = OpticalFlowProducer::new(Box::new(LucasKanadeFlow::default()))
            .spawn(Arc::clone(&shared), Arc::clone(&progress))
            .unwrap();
        let track = TrackingProducer::new(TrackingInput::Replay(DetectionLog::default()))
            .spawn(Arc::clone(&shared), Arc::clone(&progress))
            .unwrap();

        let snapshot = shared.wait_for_window("v", 4, None).unwrap();
        assert_eq!(snapshot.frames.len(), 4);
        assert_eq!(snapshot.flows[0].index, 0);
        assert_eq!(snapshot.detections[3].frame_index, 3);

        // nothing beyond the first buffer length may have been published
        std::thread::sleep(Duration::from_millis(20));
        let cursors = shared.cursors().unwrap();
        assert_eq!(cursors.tail(PipelineStage::OpticalFlow), 4);
        assert_eq!(cursors.tail(PipelineStage::Tracking), 4);
        assert!(cursors.invariant_holds());

        shared.abort();
        flow.join().unwrap();
        track.join().unwrap();
        assert!(shared.take_failure().unwrap().is_none());
    }

    #[test]
    fn test_first_flow_is_against_itself() {
        let shared = shared(3, 3);
        let progress = Arc::new(Progress::new(0));
        let flow = OpticalFlowProducer::new(Box::new(LucasKanadeFlow::default()))
            .spawn(Arc::clone(&shared), Arc::clone(&progress))
            .unwrap();
        let track = TrackingProducer::new(TrackingInput::Replay(DetectionLog::default()))
            .spawn(Arc::clone(&shared), Arc::clone(&progress))
            .unwrap();

        let snapshot = shared.wait_for_window("v", 3, None).unwrap();
        assert!(snapshot.flows[0].vectors().iter().all(|v| *v == 0.0));
        flow.join().unwrap();
        track.join().unwrap();
        assert_eq!(progress.snapshot().flow_frames, 3);
    }

    #[test]
    fn test_missing_producer_trips_watchdog() {
        let shared = shared(6, 3);
        let progress = Arc::new(Progress::new(0));
        let flow = OpticalFlowProducer::new(Box::new(LucasKanadeFlow::default()))
            .spawn(Arc::clone(&shared), progress)
            .unwrap();

        let err = shared
            .wait_for_window("v", 3, Some(Duration::from_millis(50)))
            .unwrap_err();
        match err {
            WindowingError::Stall {
                stage, frame_index, ..
            } => {
                assert_eq!(stage, PipelineStage::Tracking);
                assert_eq!(frame_index, 0);
            }
            other => panic!("unexpected error: {}", other),
        }
        shared.abort();
        flow.join().unwrap();
    }

    #[test]
    fn test_wait_for_producers_reports_idle_stage() {
        let shared = shared(4, 4);
        let progress = Arc::new(Progress::new(0));
        let track = TrackingProducer::new(TrackingInput::Replay(DetectionLog::default()))
            .spawn(Arc::clone(&shared), progress)
            .unwrap();

        let err = shared
            .wait_for_producers(Some(Duration::from_millis(50)))
            .unwrap_err();
        match err {
            WindowingError::Stall {
                stage, frame_index, ..
            } => {
                assert_eq!(stage, PipelineStage::OpticalFlow);
                assert_eq!(frame_index, 0);
            }
            other => panic!("unexpected error: {}", other),
        }
        track.join().unwrap();
        assert_eq!(shared.cursors().unwrap().tail(PipelineStage::Tracking), 4);
    }
}
