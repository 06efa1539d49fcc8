//! Type definitions for frames, flow fields and tracked individuals

use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Number of body keypoints per individual (COCO skeleton)
pub const NUM_KEYPOINTS: usize = 17;

/// Value written into track tables and payloads where an individual is absent
pub const ABSENT: f32 = -1.0;

/// Keypoint coordinates `(x, y)` in pixels
pub type Keypoints = [[f32; 2]; NUM_KEYPOINTS];

/// Long-lived concurrent stages of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    OpticalFlow,
    Tracking,
    Coordinator,
    Writer,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpticalFlow => write!(f, "optical flow"),
            Self::Tracking => write!(f, "tracking"),
            Self::Coordinator => write!(f, "coordinator"),
            Self::Writer => write!(f, "writer"),
        }
    }
}

/// A decoded RGB video frame
///
/// Pixel data sits behind an `Arc` so ring slots and window snapshots share
/// it without copying. A frame is never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    pixels: Arc<Array3<u8>>,
}

impl Frame {
    /// Create a frame from an `H x W x 3` pixel array
    pub fn new(index: usize, pixels: Array3<u8>) -> Self {
        Self {
            index,
            pixels: Arc::new(pixels),
        }
    }

    /// Create a frame from an RGB image
    pub fn from_rgb_image(index: usize, image: RgbImage) -> crate::Result<Self> {
        let (width, height) = image.dimensions();
        let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), image.into_raw())
            .map_err(|e| crate::WindowingError::frame_source(format!("Bad frame buffer: {}", e)))?;
        Ok(Self::new(index, pixels))
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.pixels.shape()[2]
    }

    /// Convert to a single-channel luma plane in `[0, 1]`
    pub fn to_luma(&self) -> ndarray::Array2<f32> {
        let (h, w) = (self.height(), self.width());
        ndarray::Array2::from_shape_fn((h, w), |(y, x)| {
            let r = self.pixels[[y, x, 0]] as f32;
            let g = self.pixels[[y, x, 1]] as f32;
            let b = self.pixels[[y, x, 2]] as f32;
            (0.299 * r + 0.587 * g + 0.114 * b) / 255.0
        })
    }
}

/// Dense motion field from the previous frame to frame `index`
///
/// Shape is `H x W x 2`, channel 0 is horizontal displacement, channel 1 vertical.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub index: usize,
    vectors: Arc<Array3<f32>>,
}

impl FlowField {
    pub fn new(index: usize, vectors: Array3<f32>) -> Self {
        Self {
            index,
            vectors: Arc::new(vectors),
        }
    }

    /// A motionless field matching a frame of `height x width`
    pub fn zeros(index: usize, height: usize, width: usize) -> Self {
        Self::new(index, Array3::zeros((height, width, 2)))
    }

    pub fn vectors(&self) -> &Array3<f32> {
        &self.vectors
    }

    pub fn height(&self) -> usize {
        self.vectors.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.vectors.shape()[1]
    }
}

/// Bounding box in pixel corner format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a slice holding at least `[x1, y1, x2, y2]`; trailing values are ignored
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [x1, y1, x2, y2, ..] => Some(Self::new(*x1, *y1, *x2, *y2)),
            _ => None,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One tracked individual observed in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub individual_id: u32,
    pub bbox: BoundingBox,
    pub keypoints: Keypoints,
}

impl Detection {
    pub fn new(individual_id: u32, bbox: BoundingBox, keypoints: Keypoints) -> Self {
        Self {
            individual_id,
            bbox,
            keypoints,
        }
    }
}

/// Every detection produced for a single frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub frame_index: usize,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(frame_index: usize, detections: Vec<Detection>) -> Self {
        Self {
            frame_index,
            detections,
        }
    }

    pub fn empty(frame_index: usize) -> Self {
        Self::new(frame_index, Vec::new())
    }

    /// Find the detection for `individual_id`, if present in this frame
    pub fn get(&self, individual_id: u32) -> Option<&Detection> {
        self.detections
            .iter()
            .find(|d| d.individual_id == individual_id)
    }

    /// First individual id that occurs more than once in this frame
    pub fn duplicate_id(&self) -> Option<u32> {
        let mut seen = BTreeSet::new();
        self.detections
            .iter()
            .map(|d| d.individual_id)
            .find(|id| !seen.insert(*id))
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_from_slice_drops_confidence() {
        let bbox = BoundingBox::from_slice(&[1.0, 2.0, 5.0, 10.0, 0.93]).unwrap();
        assert_eq!(bbox.to_array(), [1.0, 2.0, 5.0, 10.0]);
        assert_eq!(bbox.center(), (3.0, 6.0));
        assert!(BoundingBox::from_slice(&[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_frame_from_rgb_image() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, image::Rgb([10, 20, 30]));
        let frame = Frame::from_rgb_image(7, image).unwrap();
        assert_eq!(frame.index, 7);
        assert_eq!((frame.height(), frame.width(), frame.channels()), (2, 4, 3));
        assert_eq!(frame.pixels()[[1, 3, 2]], 30);
    }

    #[test]
    fn test_detection_set_lookup() {
        let set = DetectionSet::new(
            3,
            vec![
                Detection::new(4, BoundingBox::new(0.0, 0.0, 1.0, 1.0), [[0.0; 2]; NUM_KEYPOINTS]),
                Detection::new(9, BoundingBox::new(2.0, 2.0, 3.0, 3.0), [[1.0; 2]; NUM_KEYPOINTS]),
            ],
        );
        assert_eq!(set.get(9).unwrap().bbox.x1, 2.0);
        assert!(set.get(5).is_none());
        assert_eq!(set.len(), 2);
        assert_eq!(set.duplicate_id(), None);
    }

    #[test]
    fn test_detection_set_reports_repeated_id() {
        let det = |id| Detection::new(id, BoundingBox::new(0.0, 0.0, 1.0, 1.0), [[0.0; 2]; NUM_KEYPOINTS]);
        let set = DetectionSet::new(1, vec![det(2), det(5), det(3), det(5)]);
        assert_eq!(set.duplicate_id(), Some(5));
    }
}
