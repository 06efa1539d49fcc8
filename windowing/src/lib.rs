//! Spatio-temporal window extraction
//!
//! Turns a video plus per-frame tracked-individual detections into
//! fixed-length, fixed-stride windows written to tar shards for model
//! training. Optical flow and tracking run as two producer threads feeding
//! ring buffers of capacity `seq_len`; a coordinator copies out each window
//! once both rings hold it and hands it to a pool of writer threads.

pub mod config;
pub mod coordinator;
pub mod cursors;
pub mod error;
pub mod flow;
pub mod frame_source;
pub mod pipeline;
pub mod producer;
pub mod progress;
pub mod ring_buffer;
pub mod shard;
pub mod tracking;
pub mod types;
pub mod window;
pub mod writer_pool;

#[cfg(feature = "opencv")]
pub mod video;

pub use config::WindowConfig;
pub use error::{Result, WindowingError};
pub use flow::{FlowEstimator, LucasKanadeFlow};
pub use frame_source::{FrameSource, ImageSequenceSource, MemoryFrameSource};
pub use pipeline::{create_shards, run_pipeline, RunReport, VideoLayout};
pub use progress::ProgressSnapshot;
pub use shard::{list_shards, ShardReader, ShardWriter};
pub use tracking::{DetectionLog, TrackingInput, TrackingModel};
pub use types::{
    BoundingBox, Detection, DetectionSet, FlowField, Frame, Keypoints, PipelineStage, ABSENT,
    NUM_KEYPOINTS,
};
pub use window::{InteractionGraph, IndividualTrack, WindowRecord, WindowSnapshot};

#[cfg(feature = "opencv")]
pub use flow::FarnebackFlow;
#[cfg(feature = "opencv")]
pub use video::VideoFileSource;

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
