//! Tracked-individual detection input for the tracking producer
//!
//! Detections come either from a live [`TrackingModel`] run on each frame or
//! from a [`DetectionLog`] recorded by an earlier run (`pose.json`), which is
//! replayed frame by frame without decoding video.

use crate::error::{Result, WindowingError};
use crate::types::{BoundingBox, Detection, DetectionSet, Frame, Keypoints, NUM_KEYPOINTS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-frame person detection plus identity tracking
///
/// Implementations keep tracker state between calls, so frames are always
/// passed in increasing index order.
pub trait TrackingModel: Send {
    fn predict(&mut self, frame: &Frame, frame_index: usize) -> Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "tracking model"
    }
}

/// One record of a detection log as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    n_frame: i64,
    id: u32,
    bbox: Vec<f32>,
    keypoints: Vec<Vec<f32>>,
}

impl LogRecord {
    fn from_detection(frame_index: usize, det: &Detection) -> Self {
        Self {
            n_frame: frame_index as i64,
            id: det.individual_id,
            bbox: det.bbox.to_array().to_vec(),
            keypoints: det.keypoints.iter().map(|kp| kp.to_vec()).collect(),
        }
    }

    fn into_detection(self) -> Result<Detection> {
        let bbox = BoundingBox::from_slice(&self.bbox).ok_or_else(|| {
            WindowingError::tracking(format!(
                "frame {} id {}: bbox has {} values, need 4",
                self.n_frame,
                self.id,
                self.bbox.len()
            ))
        })?;
        if self.keypoints.len() != NUM_KEYPOINTS {
            return Err(WindowingError::tracking(format!(
                "frame {} id {}: {} keypoints, need {}",
                self.n_frame,
                self.id,
                self.keypoints.len(),
                NUM_KEYPOINTS
            )));
        }
        let mut keypoints: Keypoints = [[0.0; 2]; NUM_KEYPOINTS];
        for (dst, src) in keypoints.iter_mut().zip(&self.keypoints) {
            match src.as_slice() {
                [x, y, ..] => *dst = [*x, *y],
                _ => {
                    return Err(WindowingError::tracking(format!(
                        "frame {} id {}: keypoint needs x and y",
                        self.n_frame, self.id
                    )))
                }
            }
        }
        Ok(Detection::new(self.id, bbox, keypoints))
    }
}

/// Detections recorded for a whole video, grouped by frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionLog {
    frames: BTreeMap<usize, Vec<Detection>>,
}

impl DetectionLog {
    /// Read a JSON array of `{n_frame, id, bbox, keypoints}` records
    ///
    /// Extra bbox values (confidence) and extra per-keypoint values are dropped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let records: Vec<LogRecord> = serde_json::from_str(&contents)?;
        let log = Self::from_records(records)?;
        log::info!(
            "Detection log loaded: {} ({} detections over {} frames)",
            path.display(),
            log.detection_count(),
            log.frames.len()
        );
        Ok(log)
    }

    fn from_records(records: Vec<LogRecord>) -> Result<Self> {
        let mut frames: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
        for record in records {
            if record.n_frame < 0 {
                log::warn!("Ignoring detection with negative frame index {}", record.n_frame);
                continue;
            }
            let index = record.n_frame as usize;
            frames.entry(index).or_default().push(record.into_detection()?);
        }
        for (index, detections) in frames.iter_mut() {
            detections.sort_by_key(|d| d.individual_id);
            if let Some(pair) = detections
                .windows(2)
                .find(|pair| pair[0].individual_id == pair[1].individual_id)
            {
                return Err(repeated_id(*index, pair[0].individual_id));
            }
        }
        Ok(Self { frames })
    }

    /// Build a log from detection sets, e.g. the output of a live run
    pub fn from_sets<I: IntoIterator<Item = DetectionSet>>(sets: I) -> Self {
        let mut frames = BTreeMap::new();
        for mut set in sets {
            if set.detections.is_empty() {
                continue;
            }
            set.detections.sort_by_key(|d| d.individual_id);
            frames.insert(set.frame_index, set.detections);
        }
        Self { frames }
    }

    /// Write the log in the same record format `load` reads
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records: Vec<LogRecord> = self
            .frames
            .iter()
            .flat_map(|(index, dets)| dets.iter().map(move |d| LogRecord::from_detection(*index, d)))
            .collect();
        std::fs::write(path, serde_json::to_string(&records)?)?;
        Ok(())
    }

    /// Detections recorded for `frame_index`; empty when none were recorded
    pub fn frame(&self, frame_index: usize) -> DetectionSet {
        DetectionSet::new(
            frame_index,
            self.frames.get(&frame_index).cloned().unwrap_or_default(),
        )
    }

    pub fn detection_count(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    /// Drop records past the end of the video, warning once per dropped frame range
    pub fn truncate(&mut self, frame_count: usize) {
        let beyond = self.frames.split_off(&frame_count);
        if let (Some(first), Some(last)) = (beyond.keys().next(), beyond.keys().next_back()) {
            log::warn!(
                "Ignoring detections for frames {}..={} beyond the video's {} frames",
                first,
                last,
                frame_count
            );
        }
    }
}

fn repeated_id(frame_index: usize, individual_id: u32) -> WindowingError {
    WindowingError::tracking(format!(
        "individual {} detected more than once in frame {}",
        individual_id, frame_index
    ))
}

/// Where the tracking producer gets its detections
pub enum TrackingInput {
    Live(Box<dyn TrackingModel>),
    Replay(DetectionLog),
}

impl TrackingInput {
    /// Whether the producer must decode frames to feed this input
    pub fn needs_frames(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    /// Detections for `frame_index`; `frame` is only consulted by live models
    ///
    /// An individual id may occur at most once per frame.
    pub fn detect(&mut self, frame: Option<&Frame>, frame_index: usize) -> Result<DetectionSet> {
        let set = match self {
            Self::Live(model) => {
                let frame = frame.ok_or_else(|| {
                    WindowingError::tracking(format!(
                        "{} needs frame {} but none was read",
                        model.name(),
                        frame_index
                    ))
                })?;
                let mut detections = model.predict(frame, frame_index)?;
                detections.sort_by_key(|d| d.individual_id);
                DetectionSet::new(frame_index, detections)
            }
            Self::Replay(log) => log.frame(frame_index),
        };
        match set.duplicate_id() {
            Some(id) => Err(repeated_id(frame_index, id)),
            None => Ok(set),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Live(model) => format!("live {}", model.name()),
            Self::Replay(log) => format!("replayed log ({} detections)", log.detection_count()),
        }
    }
}
