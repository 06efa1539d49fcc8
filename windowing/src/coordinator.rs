//! Window coordinator
//!
//! Walks the window ends `seq_len, seq_len + stride, ...` in increasing
//! order. For each end it waits until both rings hold the full window
//! starting at `head`, copies it out, hands the copy to the writer pool and
//! only then advances `head` by `stride`, which is what lets the producers
//! move on. Writers may finish in any order; the coordinator only waits for
//! them when the in-flight limit is reached and at the end of the run.

use crate::config::WindowConfig;
use crate::error::{Result, WindowingError};
use crate::producer::SharedState;
use crate::progress::Progress;
use crate::writer_pool::{WindowOutcome, WriterPool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long producers get to exit after the run when no stall timeout is set
const PRODUCER_GRACE: Duration = Duration::from_secs(5);

/// Per-window tally of a coordinator run
#[derive(Debug, Default)]
pub struct WindowTally {
    /// Keys in dispatch order
    pub dispatched: Vec<String>,
    /// `(window_end, key)` of windows written
    pub succeeded: Vec<(usize, String)>,
    /// `(key, reason)` of windows that failed in isolation
    pub failed: Vec<(String, String)>,
}

impl WindowTally {
    /// Successful keys ordered by window end, independent of completion order
    pub fn succeeded_keys(&self) -> Vec<String> {
        let mut done = self.succeeded.clone();
        done.sort();
        done.into_iter().map(|(_, key)| key).collect()
    }
}

pub struct WindowCoordinator {
    config: WindowConfig,
    video_id: String,
    shared: Arc<SharedState>,
    pool: WriterPool,
    progress: Arc<Progress>,
    pending: usize,
    tally: WindowTally,
}

impl WindowCoordinator {
    pub fn new(
        config: WindowConfig,
        video_id: impl Into<String>,
        shared: Arc<SharedState>,
        pool: WriterPool,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            config,
            video_id: video_id.into(),
            shared,
            pool,
            progress,
            pending: 0,
            tally: WindowTally::default(),
        }
    }

    /// Dispatch every window, drain the writers and join the producers
    ///
    /// A producer failure, cursor divergence or fatal writer error stops the
    /// run: producers are released, queued windows are still drained, and the
    /// error is returned. A producer still inside a model call one grace
    /// period later is detached instead of joined.
    pub fn run(mut self, producers: Vec<thread::JoinHandle<()>>) -> Result<WindowTally> {
        let frame_count = self.shared.frame_count();
        let ends = self.config.expected_window_ends(frame_count);
        log::info!(
            "Coordinator: {} windows over {} frames (seq_len={}, stride={}, {} writers)",
            ends.len(),
            frame_count,
            self.config.seq_len,
            self.config.stride,
            self.pool.num_workers()
        );
        self.progress.expect_windows(ends.len());

        let dispatched = self.dispatch_all(&ends);
        if dispatched.is_err() {
            self.shared.abort();
        }
        let drained = self.drain();

        let stall_timeout = self.config.stall_timeout();
        let settled = match (&dispatched, &drained) {
            (Ok(()), Ok(())) => self.shared.wait_for_producers(stall_timeout),
            _ => Ok(()),
        };
        self.shared.abort();
        self.release_producers(producers, stall_timeout.unwrap_or(PRODUCER_GRACE));
        self.pool.shutdown();

        dispatched?;
        drained?;
        if let Some(failure) = self.shared.take_failure()? {
            return Err(failure);
        }
        settled?;

        log::info!(
            "Coordinator finished: {} dispatched, {} written, {} failed",
            self.tally.dispatched.len(),
            self.tally.succeeded.len(),
            self.tally.failed.len()
        );
        Ok(self.tally)
    }

    /// Join producers that exit within `grace`; detach the rest
    fn release_producers(&self, producers: Vec<thread::JoinHandle<()>>, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut running = producers;
        loop {
            let (finished, busy): (Vec<_>, Vec<_>) =
                running.into_iter().partition(|handle| handle.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    log::error!("Producer thread panicked outside its stage body");
                }
            }
            running = busy;
            if running.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                for handle in running {
                    log::warn!(
                        "Detaching {} thread, still busy {:.1}s after the run stopped",
                        handle.thread().name().unwrap_or("producer"),
                        grace.as_secs_f32()
                    );
                }
                return;
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    fn dispatch_all(&mut self, ends: &[usize]) -> Result<()> {
        let limit = self.config.pending_limit();
        let stall_timeout = self.config.stall_timeout();

        for &window_end in ends {
            while let Some(outcome) = self.pool.try_recv() {
                self.record(outcome)?;
            }
            while self.pending >= limit {
                let outcome = self.pool.recv()?;
                self.record(outcome)?;
            }

            let snapshot = self
                .shared
                .wait_for_window(&self.video_id, window_end, stall_timeout)
                .inspect_err(|e| log::error!("Waiting for window {}: {}", window_end, e))?;
            let key = snapshot.key();
            log::debug!("Dispatching window {}", key);

            self.pool.submit(snapshot)?;
            self.pending += 1;
            self.progress.window_dispatched();
            self.tally.dispatched.push(key);

            self.shared.advance_head(self.config.stride)?;
        }
        Ok(())
    }

    /// Wait for every dispatched window to finish
    fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        while self.pending > 0 {
            let outcome = self.pool.recv()?;
            if let Err(e) = self.record(outcome) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn record(&mut self, outcome: WindowOutcome) -> Result<()> {
        self.pending = self.pending.saturating_sub(1);
        match outcome.result {
            Ok(()) => {
                log::debug!("Window {} written in {:.1}ms", outcome.key, outcome.latency_ms);
                self.progress.window_written();
                self.tally.succeeded.push((outcome.window_end, outcome.key));
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                log::error!("Window {} hit a fatal error: {}", outcome.key, e);
                self.progress.window_failed();
                self.tally.failed.push((outcome.key, e.to_string()));
                Err(e)
            }
            Err(e) => {
                log::error!("{}", e);
                self.progress.window_failed();
                self.tally.failed.push((outcome.key, e.to_string()));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::LucasKanadeFlow;
    use crate::frame_source::MemoryFrameSource;
    use crate::producer::{OpticalFlowProducer, TrackingProducer};
    use crate::shard::ShardWriter;
    use crate::tracking::{DetectionLog, TrackingInput};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn run(frames: usize, seq_len: usize, stride: usize) -> WindowTally {
        let tmp = tempdir().unwrap();
        let mut config = WindowConfig::new(seq_len, stride);
        config.num_workers = Some(2);
        config.poll_interval_ms = 1;

        let source = MemoryFrameSource::synthetic(frames, 6, 6);
        let shared = Arc::new(
            SharedState::new(Box::new(source), config.capacity(), config.poll_interval()).unwrap(),
        );
        let progress = Arc::new(Progress::new(0));
        let producers = vec![
            OpticalFlowProducer::new(Box::new(LucasKanadeFlow::default()))
                .spawn(Arc::clone(&shared), Arc::clone(&progress))
                .unwrap(),
            TrackingProducer::new(TrackingInput::Replay(DetectionLog::default()))
                .spawn(Arc::clone(&shared), Arc::clone(&progress))
                .unwrap(),
        ];
        let writer = Arc::new(Mutex::new(ShardWriter::new(tmp.path(), &config).unwrap()));
        let pool = WriterPool::new(2, 2, writer).unwrap();

        WindowCoordinator::new(config, "c", shared, pool, progress)
            .run(producers)
            .unwrap()
    }

    #[test]
    fn test_windows_dispatched_in_order() {
        let tally = run(20, 6, 4);
        assert_eq!(tally.dispatched, vec!["c_6", "c_10", "c_14", "c_18"]);
        assert_eq!(tally.succeeded_keys(), tally.dispatched);
        assert!(tally.failed.is_empty());
    }

    #[test]
    fn test_short_video_yields_nothing() {
        assert!(run(5, 6, 2).dispatched.is_empty());
        assert_eq!(run(6, 6, 2).dispatched, vec!["c_6"]);
    }
}
