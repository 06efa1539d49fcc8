//! Video file frame source backed by OpenCV

use crate::error::{Result, WindowingError};
use crate::frame_source::FrameSource;
use crate::types::Frame;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, CAP_ANY},
};
use std::path::Path;

/// Decodes frames from a video file
///
/// Both producers ask for the same frame index one after the other, so the
/// last decoded frame is cached and sequential reads never seek.
pub struct VideoFileSource {
    capture: VideoCapture,
    frame_count: usize,
    size: (u32, u32),
    fps: f64,
    next_position: usize,
    cached: Option<Frame>,
    name: String,
}

impl VideoFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| WindowingError::frame_source("Invalid path"))?;

        let capture = VideoCapture::from_file(path_str, CAP_ANY)
            .map_err(|e| WindowingError::frame_source(format!("Failed to open video: {}", e)))?;
        if !capture.is_opened().unwrap_or(false) {
            return Err(WindowingError::frame_source(format!(
                "Video is not opened: {}",
                path_str
            )));
        }

        let frame_count = capture.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0) as usize;
        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32;
        let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);

        log::info!(
            "Video file opened: {} ({} frames, {}x{} @ {:.2} FPS)",
            path_str,
            frame_count,
            width,
            height,
            fps
        );

        Ok(Self {
            capture,
            frame_count,
            size: (width, height),
            fps,
            next_position: 0,
            cached: None,
            name: path_str.to_string(),
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    fn decode(&mut self, index: usize) -> Result<Frame> {
        if index != self.next_position {
            self.capture
                .set(videoio::CAP_PROP_POS_FRAMES, index as f64)
                .map_err(|e| WindowingError::frame_source(format!("Seek to {} failed: {}", index, e)))?;
        }

        let mut bgr = Mat::default();
        let ok = self
            .capture
            .read(&mut bgr)
            .map_err(|e| WindowingError::frame_source(format!("Frame read failed: {}", e)))?;
        if !ok || bgr.empty() {
            return Err(WindowingError::frame_source(format!(
                "No frame at index {} of {}",
                index, self.frame_count
            )));
        }
        self.next_position = index + 1;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(|e| WindowingError::frame_source(format!("BGR to RGB failed: {}", e)))?;

        let (width, height) = (rgb.cols() as usize, rgb.rows() as usize);
        let data = rgb
            .data_bytes()
            .map_err(|e| WindowingError::frame_source(format!("Failed to get frame data: {}", e)))?
            .to_vec();
        let pixels = ndarray::Array3::from_shape_vec((height, width, 3), data)
            .map_err(|e| WindowingError::frame_source(format!("Bad frame buffer: {}", e)))?;
        Ok(Frame::new(index, pixels))
    }
}

impl FrameSource for VideoFileSource {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn read(&mut self, index: usize) -> Result<Frame> {
        if let Some(frame) = self.cached.as_ref().filter(|f| f.index == index) {
            return Ok(frame.clone());
        }
        let frame = self.decode(index)?;
        self.cached = Some(frame.clone());
        Ok(frame)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
