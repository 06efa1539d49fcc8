//! Random-access frame readers shared by the producer stages

use crate::error::{Result, WindowingError};
use crate::types::Frame;
use ndarray::Array3;
use std::path::{Path, PathBuf};

/// Sequential random-access reader over a video
///
/// Implementations need not be thread-safe for reads: the pipeline only calls
/// `read` while holding the shared state lock.
pub trait FrameSource: Send {
    /// Total number of frames
    fn frame_count(&self) -> usize;

    /// Frame size as `(width, height)`
    fn frame_size(&self) -> (u32, u32);

    /// Decode frame `index`
    fn read(&mut self, index: usize) -> Result<Frame>;

    /// Source name for logging
    fn name(&self) -> &str {
        "frames"
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Directory of still images, one per frame, ordered by file name
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    size: (u32, u32),
    name: String,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let size = match paths.first() {
            Some(first) => image::image_dimensions(first)?,
            None => (0, 0),
        };

        log::info!(
            "Image sequence opened: {} ({} frames, {}x{})",
            dir.display(),
            paths.len(),
            size.0,
            size.1
        );

        Ok(Self {
            paths,
            size,
            name: dir.display().to_string(),
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn read(&mut self, index: usize) -> Result<Frame> {
        let path = self.paths.get(index).ok_or_else(|| {
            WindowingError::frame_source(format!(
                "frame {} out of range ({} frames)",
                index,
                self.paths.len()
            ))
        })?;
        let image = image::open(path)?.to_rgb8();
        if image.dimensions() != self.size {
            return Err(WindowingError::frame_source(format!(
                "{} is {:?}, expected {:?}",
                path.display(),
                image.dimensions(),
                self.size
            )));
        }
        Frame::from_rgb_image(index, image)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Frames held in memory; used by tests, benches and callers that decode elsewhere
pub struct MemoryFrameSource {
    frames: Vec<Frame>,
    size: (u32, u32),
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        let size = frames
            .first()
            .map(|f| (f.width() as u32, f.height() as u32))
            .unwrap_or((0, 0));
        Self { frames, size }
    }

    /// Deterministic frames with a bright square drifting one pixel per frame
    pub fn synthetic(frame_count: usize, width: usize, height: usize) -> Self {
        let frames = (0..frame_count)
            .map(|index| {
                let pixels = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
                    let sx = (index + 2) % width.max(1);
                    let inside = x >= sx && x < sx + 4 && y >= 2 && y < 6;
                    if inside {
                        255
                    } else {
                        ((x * 7 + y * 3 + c * 11) % 64) as u8
                    }
                });
                Frame::new(index, pixels)
            })
            .collect();
        Self::new(frames)
    }
}

impl FrameSource for MemoryFrameSource {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn read(&mut self, index: usize) -> Result<Frame> {
        self.frames.get(index).cloned().ok_or_else(|| {
            WindowingError::frame_source(format!(
                "frame {} out of range ({} frames)",
                index,
                self.frames.len()
            ))
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
