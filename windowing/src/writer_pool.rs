/// Worker pool running window writer tasks
///
/// The coordinator submits [`WindowSnapshot`]s over a bounded job channel;
/// each worker builds the window record outside any lock, appends it to the
/// shared [`ShardWriter`], and reports a [`WindowOutcome`]. Workers complete
/// out of order. A failure is reported for that window only; the worker keeps
/// taking jobs.
use crate::error::{Result, WindowingError};
use crate::shard::ShardWriter;
use crate::window::{WindowRecord, WindowSnapshot};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// Result of writing one window
#[derive(Debug)]
pub struct WindowOutcome {
    pub key: String,
    pub window_end: usize,
    pub result: Result<()>,
    pub latency_ms: f32,
}

/// Build, serialize and append one window
///
/// Errors are attributed to the window, except storage failures that leave
/// no usable shard (rotation or recovery after a partial record), which stay fatal.
pub fn write_window(snapshot: &WindowSnapshot, writer: &Mutex<ShardWriter>) -> Result<()> {
    let key = snapshot.key();
    let to_window_error = |e: WindowingError| match e {
        WindowingError::WindowExtraction { .. } | WindowingError::ResourceExhausted(_) => e,
        other => WindowingError::window(key.clone(), other.to_string()),
    };

    let record = WindowRecord::from_snapshot(snapshot).map_err(to_window_error)?;
    let payload = record.to_payload().map_err(to_window_error)?;

    let mut writer = writer
        .lock()
        .map_err(|_| WindowingError::poisoned("shard writer"))?;
    writer.append(&key, &payload).map_err(to_window_error)
}

pub struct WriterPool {
    job_tx: Option<Sender<WindowSnapshot>>,
    outcome_rx: Receiver<WindowOutcome>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WriterPool {
    /// Spawn `num_workers` writer threads; at most `queue_depth` jobs wait unclaimed
    pub fn new(
        num_workers: usize,
        queue_depth: usize,
        writer: Arc<Mutex<ShardWriter>>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<WindowSnapshot>(queue_depth.max(1));
        let (outcome_tx, outcome_rx) = unbounded::<WindowOutcome>();

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let job_rx = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let writer = Arc::clone(&writer);

            let handle = thread::Builder::new()
                .name(format!("window-writer-{}", worker_id))
                .spawn(move || {
                    log::debug!("Window writer {} started", worker_id);

                    while let Ok(snapshot) = job_rx.recv() {
                        let start = Instant::now();
                        let key = snapshot.key();
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            write_window(&snapshot, &writer)
                        }))
                        .unwrap_or_else(|_| {
                            Err(WindowingError::window(key.clone(), "writer panicked"))
                        });

                        let outcome = WindowOutcome {
                            key,
                            window_end: snapshot.window_end,
                            result,
                            latency_ms: start.elapsed().as_secs_f32() * 1000.0,
                        };
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }

                    log::debug!("Window writer {} stopped", worker_id);
                })
                .map_err(|e| WindowingError::resource(format!("cannot spawn writer: {}", e)))?;
            workers.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            outcome_rx,
            workers,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a window; blocks while the job queue is full
    pub fn submit(&self, snapshot: WindowSnapshot) -> Result<()> {
        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| WindowingError::resource("writer pool is shut down"))?;
        job_tx
            .send(snapshot)
            .map_err(|_| WindowingError::resource("all window writers exited"))
    }

    /// Wait for the next finished window
    pub fn recv(&self) -> Result<WindowOutcome> {
        self.outcome_rx
            .recv()
            .map_err(|_| WindowingError::resource("all window writers exited"))
    }

    /// Next finished window, if one is ready
    pub fn try_recv(&self) -> Option<WindowOutcome> {
        self.outcome_rx.try_recv().ok()
    }

    /// Stop accepting jobs and wait for the workers to drain the queue
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("Window writer thread panicked");
            }
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::types::{DetectionSet, FlowField, Frame};
    use ndarray::Array3;
    use tempfile::tempdir;

    fn snapshot(window_end: usize, seq_len: usize) -> WindowSnapshot {
        let start = window_end - seq_len;
        WindowSnapshot {
            video_id: "w".to_string(),
            window_end,
            frames: (start..window_end)
                .map(|i| Frame::new(i, Array3::zeros((2, 2, 3))))
                .collect(),
            flows: (start..window_end).map(|i| FlowField::zeros(i, 2, 2)).collect(),
            detections: (start..window_end).map(DetectionSet::empty).collect(),
        }
    }

    #[test]
    fn test_pool_writes_all_windows() {
        let tmp = tempdir().unwrap();
        let config = WindowConfig::new(3, 1);
        let writer = Arc::new(Mutex::new(ShardWriter::new(tmp.path(), &config).unwrap()));
        let mut pool = WriterPool::new(3, 2, Arc::clone(&writer)).unwrap();

        for n in 3..9 {
            pool.submit(snapshot(n, 3)).unwrap();
        }
        let mut ends = Vec::new();
        for _ in 0..6 {
            let outcome = pool.recv().unwrap();
            assert!(outcome.result.is_ok());
            ends.push(outcome.window_end);
        }
        ends.sort();
        assert_eq!(ends, vec![3, 4, 5, 6, 7, 8]);

        pool.shutdown();
        assert_eq!(writer.lock().unwrap().records_written(), 6);
        assert!(pool.submit(snapshot(9, 3)).is_err());
    }

    #[test]
    fn test_bad_window_fails_alone() {
        let tmp = tempdir().unwrap();
        let config = WindowConfig::new(3, 1);
        let writer = Arc::new(Mutex::new(ShardWriter::new(tmp.path(), &config).unwrap()));
        let pool = WriterPool::new(1, 4, Arc::clone(&writer)).unwrap();

        let mut broken = snapshot(4, 3);
        broken.flows.pop();
        pool.submit(broken).unwrap();
        pool.submit(snapshot(5, 3)).unwrap();

        let first = pool.recv().unwrap();
        assert_eq!(first.key, "w_4");
        match first.result {
            Err(e) => assert!(!e.is_fatal()),
            Ok(()) => panic!("truncated window was written"),
        }
        assert!(pool.recv().unwrap().result.is_ok());
    }
}
