//! Dense optical flow estimators
//!
//! The optical-flow producer only sees the [`FlowEstimator`] trait. Two
//! implementations ship with the crate:
//!
//! - [`LucasKanadeFlow`]: dense Lucas-Kanade on the luma plane, pure Rust,
//!   rows computed in parallel with rayon.
//! - `FarnebackFlow`: OpenCV's polynomial-expansion estimator (feature `opencv`).

use crate::error::{Result, WindowingError};
use crate::types::{FlowField, Frame};
use ndarray::{Array2, Array3};
use rayon::prelude::*;

/// Computes the motion field from `prev` to `frame`
pub trait FlowEstimator: Send {
    fn compute(&mut self, prev: &Frame, frame: &Frame) -> Result<FlowField>;

    fn name(&self) -> &str {
        "flow"
    }
}

fn check_same_shape(prev: &Frame, frame: &Frame) -> Result<()> {
    if prev.pixels().shape() != frame.pixels().shape() {
        return Err(WindowingError::flow(format!(
            "frame {} has shape {:?} but frame {} has {:?}",
            prev.index,
            prev.pixels().shape(),
            frame.index,
            frame.pixels().shape()
        )));
    }
    Ok(())
}

/// Summed-area table with one row and column of zero padding
struct Integral {
    sums: Array2<f64>,
}

impl Integral {
    fn new(values: &Array2<f32>) -> Self {
        let (h, w) = values.dim();
        let mut sums = Array2::<f64>::zeros((h + 1, w + 1));
        for y in 0..h {
            let mut row = 0.0f64;
            for x in 0..w {
                row += values[[y, x]] as f64;
                sums[[y + 1, x + 1]] = sums[[y, x + 1]] + row;
            }
        }
        Self { sums }
    }

    /// Sum over the half-open box `[y0, y1) x [x0, x1)`
    fn box_sum(&self, y0: usize, x0: usize, y1: usize, x1: usize) -> f64 {
        self.sums[[y1, x1]] - self.sums[[y0, x1]] - self.sums[[y1, x0]] + self.sums[[y0, x0]]
    }
}

/// Dense Lucas-Kanade flow
///
/// For every pixel the brightness-constancy system is solved over a
/// `(2 * radius + 1)^2` neighbourhood. Pixels whose structure tensor is
/// near-singular (flat or edge-only regions) get zero motion.
#[derive(Debug, Clone)]
pub struct LucasKanadeFlow {
    radius: usize,
    min_eigen: f64,
}

impl Default for LucasKanadeFlow {
    fn default() -> Self {
        Self::new(2)
    }
}

impl LucasKanadeFlow {
    pub fn new(radius: usize) -> Self {
        Self {
            radius,
            min_eigen: 1e-6,
        }
    }

    pub fn with_min_eigen(mut self, min_eigen: f64) -> Self {
        self.min_eigen = min_eigen;
        self
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Central-difference gradient of the average of both planes, plus the temporal difference
    fn gradients(
        prev: &Array2<f32>,
        next: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let (h, w) = prev.dim();
        let avg = |y: usize, x: usize| 0.5 * (prev[[y, x]] + next[[y, x]]);
        let ix = Array2::from_shape_fn((h, w), |(y, x)| {
            let l = x.saturating_sub(1);
            let r = (x + 1).min(w - 1);
            if r == l {
                0.0
            } else {
                (avg(y, r) - avg(y, l)) / (r - l) as f32
            }
        });
        let iy = Array2::from_shape_fn((h, w), |(y, x)| {
            let t = y.saturating_sub(1);
            let b = (y + 1).min(h - 1);
            if b == t {
                0.0
            } else {
                (avg(b, x) - avg(t, x)) / (b - t) as f32
            }
        });
        let it = next - prev;
        (ix, iy, it)
    }
}

impl FlowEstimator for LucasKanadeFlow {
    fn compute(&mut self, prev: &Frame, frame: &Frame) -> Result<FlowField> {
        check_same_shape(prev, frame)?;
        let (h, w) = (frame.height(), frame.width());
        if h == 0 || w == 0 {
            return Ok(FlowField::zeros(frame.index, h, w));
        }

        let g0 = prev.to_luma();
        let g1 = frame.to_luma();
        let (ix, iy, it) = Self::gradients(&g0, &g1);

        let sxx = Integral::new(&(&ix * &ix));
        let sxy = Integral::new(&(&ix * &iy));
        let syy = Integral::new(&(&iy * &iy));
        let sxt = Integral::new(&(&ix * &it));
        let syt = Integral::new(&(&iy * &it));

        let r = self.radius;
        let min_eigen = self.min_eigen;
        let mut vectors = vec![0.0f32; h * w * 2];

        vectors
            .par_chunks_mut(w * 2)
            .enumerate()
            .for_each(|(y, row)| {
                let y0 = y.saturating_sub(r);
                let y1 = (y + r + 1).min(h);
                for x in 0..w {
                    let x0 = x.saturating_sub(r);
                    let x1 = (x + r + 1).min(w);
                    let a = sxx.box_sum(y0, x0, y1, x1);
                    let b = sxy.box_sum(y0, x0, y1, x1);
                    let c = syy.box_sum(y0, x0, y1, x1);
                    let bx = -sxt.box_sum(y0, x0, y1, x1);
                    let by = -syt.box_sum(y0, x0, y1, x1);

                    // smaller eigenvalue of [[a, b], [b, c]]
                    let trace = a + c;
                    let disc = ((a - c) * (a - c) + 4.0 * b * b).sqrt();
                    let lambda_min = 0.5 * (trace - disc);
                    if lambda_min < min_eigen {
                        continue;
                    }
                    let det = a * c - b * b;
                    row[x * 2] = ((c * bx - b * by) / det) as f32;
                    row[x * 2 + 1] = ((a * by - b * bx) / det) as f32;
                }
            });

        let vectors = Array3::from_shape_vec((h, w, 2), vectors)
            .map_err(|e| WindowingError::flow(format!("Bad flow buffer: {}", e)))?;
        Ok(FlowField::new(frame.index, vectors))
    }

    fn name(&self) -> &str {
        "lucas-kanade"
    }
}

#[cfg(feature = "opencv")]
pub use self::farneback::FarnebackFlow;

#[cfg(feature = "opencv")]
mod farneback {
    use super::{check_same_shape, FlowEstimator};
    use crate::error::{Result, WindowingError};
    use crate::types::{FlowField, Frame};
    use ndarray::Array3;
    use opencv::{
        core::{Mat, Scalar, Vec2f, CV_8UC1},
        prelude::*,
        video,
    };

    /// Gunnar Farneback dense flow via OpenCV
    #[derive(Debug, Clone)]
    pub struct FarnebackFlow {
        pub pyr_scale: f64,
        pub levels: i32,
        pub win_size: i32,
        pub iterations: i32,
        pub poly_n: i32,
        pub poly_sigma: f64,
    }

    impl Default for FarnebackFlow {
        fn default() -> Self {
            Self {
                pyr_scale: 0.5,
                levels: 3,
                win_size: 15,
                iterations: 3,
                poly_n: 5,
                poly_sigma: 1.2,
            }
        }
    }

    fn gray_mat(frame: &Frame) -> Result<Mat> {
        let (h, w) = (frame.height(), frame.width());
        let mut mat = Mat::new_rows_cols_with_default(h as i32, w as i32, CV_8UC1, Scalar::all(0.0))
            .map_err(|e| WindowingError::flow(format!("Mat allocation failed: {}", e)))?;
        let luma = frame.to_luma();
        let bytes = mat
            .data_bytes_mut()
            .map_err(|e| WindowingError::flow(format!("Mat access failed: {}", e)))?;
        for (dst, src) in bytes.iter_mut().zip(luma.iter()) {
            *dst = (src * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        Ok(mat)
    }

    impl FlowEstimator for FarnebackFlow {
        fn compute(&mut self, prev: &Frame, frame: &Frame) -> Result<FlowField> {
            check_same_shape(prev, frame)?;
            let prev_gray = gray_mat(prev)?;
            let next_gray = gray_mat(frame)?;

            let mut flow = Mat::default();
            video::calc_optical_flow_farneback(
                &prev_gray,
                &next_gray,
                &mut flow,
                self.pyr_scale,
                self.levels,
                self.win_size,
                self.iterations,
                self.poly_n,
                self.poly_sigma,
                0,
            )
            .map_err(|e| WindowingError::flow(format!("Farneback failed: {}", e)))?;

            let vectors: Vec<f32> = flow
                .data_typed::<Vec2f>()
                .map_err(|e| WindowingError::flow(format!("Flow access failed: {}", e)))?
                .iter()
                .flat_map(|v| [v[0], v[1]])
                .collect();
            let vectors = Array3::from_shape_vec((frame.height(), frame.width(), 2), vectors)
                .map_err(|e| WindowingError::flow(format!("Bad flow buffer: {}", e)))?;
            Ok(FlowField::new(frame.index, vectors))
        }

        fn name(&self) -> &str {
            "farneback"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Smooth blob so gradients exist everywhere near the centre
    fn blob_frame(index: usize, cx: f32, cy: f32) -> Frame {
        let pixels = Array3::from_shape_fn((24, 24, 3), |(y, x, _)| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            (255.0 * (-(dx * dx + dy * dy) / 18.0).exp()) as u8
        });
        Frame::new(index, pixels)
    }

    #[test]
    fn test_identical_frames_have_zero_flow() {
        let frame = blob_frame(0, 12.0, 12.0);
        let flow = LucasKanadeFlow::default().compute(&frame, &frame).unwrap();
        assert_eq!((flow.height(), flow.width()), (24, 24));
        assert_eq!(flow.index, 0);
        assert!(flow.vectors().iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_horizontal_shift_is_detected() {
        let prev = blob_frame(0, 11.5, 12.0);
        let next = blob_frame(1, 12.0, 12.0);
        let flow = LucasKanadeFlow::new(3).compute(&prev, &next).unwrap();

        let v = flow.vectors();
        // right flank of the blob, where the horizontal gradient is strong
        let u = v[[12, 14, 0]];
        let w = v[[12, 14, 1]];
        assert!(u > 0.2 && u < 1.0, "u = {}", u);
        assert_abs_diff_eq!(w, 0.0, epsilon = 0.1);
    }

    #[test]
    fn test_shape_mismatch_is_flow_error() {
        let a = Frame::new(0, Array3::zeros((4, 4, 3)));
        let b = Frame::new(1, Array3::zeros((4, 5, 3)));
        assert!(matches!(
            LucasKanadeFlow::default().compute(&a, &b),
            Err(WindowingError::Flow(_))
        ));
    }

    #[test]
    fn test_integral_box_sum() {
        let values = Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as f32);
        let integral = Integral::new(&values);
        assert_abs_diff_eq!(integral.box_sum(0, 0, 3, 4), 66.0);
        assert_abs_diff_eq!(integral.box_sum(1, 1, 3, 3), 5.0 + 6.0 + 9.0 + 10.0);
    }
}
