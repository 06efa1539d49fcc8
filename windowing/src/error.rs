//! Error types for the windowing pipeline

use crate::types::PipelineStage;
use thiserror::Error;

/// Result type alias for the windowing pipeline
pub type Result<T> = std::result::Result<T, WindowingError>;

/// Errors that can occur while extracting and sharding windows
#[derive(Error, Debug)]
pub enum WindowingError {
    #[error("{stage} stage stalled at frame {frame_index}: {reason}")]
    Stall {
        stage: PipelineStage,
        frame_index: usize,
        reason: String,
    },

    #[error("Window {key} failed: {reason}")]
    WindowExtraction { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(
        "Producer cursors diverged beyond capacity {capacity}: tail_flow={tail_flow}, tail_track={tail_track}"
    )]
    CursorDivergence {
        tail_flow: usize,
        tail_track: usize,
        capacity: usize,
    },

    #[error("Frame source error: {0}")]
    FrameSource(String),

    #[error("Optical flow failed: {0}")]
    Flow(String),

    #[error("Tracking failed: {0}")]
    Tracking(String),

    #[error("Shard error: {0}")]
    Shard(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl WindowingError {
    pub fn stall<S: Into<String>>(stage: PipelineStage, frame_index: usize, reason: S) -> Self {
        Self::Stall {
            stage,
            frame_index,
            reason: reason.into(),
        }
    }

    pub fn window<K: Into<String>, S: Into<String>>(key: K, reason: S) -> Self {
        Self::WindowExtraction {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn frame_source<S: Into<String>>(msg: S) -> Self {
        Self::FrameSource(msg.into())
    }

    pub fn flow<S: Into<String>>(msg: S) -> Self {
        Self::Flow(msg.into())
    }

    pub fn tracking<S: Into<String>>(msg: S) -> Self {
        Self::Tracking(msg.into())
    }

    pub fn shard<S: Into<String>>(msg: S) -> Self {
        Self::Shard(msg.into())
    }

    /// Whether this error must abort the whole run rather than a single window
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::WindowExtraction { .. })
    }

    /// Lock poisoning means another pipeline thread panicked mid-update
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::ResourceExhausted(format!("{} lock poisoned", what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_message_names_stage_and_frame() {
        let err = WindowingError::stall(PipelineStage::Tracking, 42, "model crashed");
        let msg = err.to_string();
        assert!(msg.contains("tracking"));
        assert!(msg.contains("42"));
        assert!(msg.contains("model crashed"));
    }

    #[test]
    fn test_only_window_failures_are_isolated() {
        assert!(!WindowingError::window("v_90", "disk full").is_fatal());
        assert!(WindowingError::config("bad stride").is_fatal());
        assert!(WindowingError::resource("no space").is_fatal());
        assert!(WindowingError::stall(PipelineStage::OpticalFlow, 0, "x").is_fatal());
    }
}
