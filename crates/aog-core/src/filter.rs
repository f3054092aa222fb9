//! Terminal appearance models.
//!
//! A terminal node scores every anchor of a pyramid level through the
//! [`Appearance`] trait. The engine only caches what the model returns.
//! [`LinearFilter`] is the usual choice: a dense weight template
//! cross-correlated with the feature grid.

use crate::error::{InferenceError, Result};
use crate::grid::ScoreMap;
use crate::pyramid::FeatureLevel;
use multiversion::multiversion;

/// Appearance scoring capability of a terminal node.
pub trait Appearance: Send + Sync {
    /// Receptive field `(rows, cols)` in cells.
    fn extent(&self) -> (usize, usize);

    /// Score every anchor of `level` where the receptive field fits.
    ///
    /// The result has `rows - extent.0 + 1` rows and `cols - extent.1 + 1`
    /// columns. Callers never invoke this on a level smaller than the extent.
    fn respond(&self, level: &FeatureLevel) -> Result<ScoreMap>;
}

/// A linear template over `rows x cols` cells of `dim` channels each.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearFilter {
    rows: usize,
    cols: usize,
    dim: usize,
    weights: Vec<f32>,
    bias: f64,
}

impl LinearFilter {
    /// Create a filter from cell-major weights (channels contiguous).
    pub fn new(rows: usize, cols: usize, dim: usize, weights: Vec<f32>, bias: f64) -> Result<Self> {
        if rows == 0 || cols == 0 || weights.len() != rows * cols * dim {
            return Err(InferenceError::Shape {
                rows,
                cols,
                depth: dim,
                len: weights.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            dim,
            weights,
            bias,
        })
    }

    /// A 1x1 filter that reads channel `channel` of a `dim`-channel level.
    pub fn channel(dim: usize, channel: usize) -> Result<Self> {
        let mut weights = vec![0.0; dim];
        if channel >= dim {
            return Err(InferenceError::FeatureDimension {
                expected: channel + 1,
                found: dim,
            });
        }
        weights[channel] = 1.0;
        Self::new(1, 1, dim, weights, 0.0)
    }

    /// Constant offset added to every response.
    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Channels per cell.
    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Appearance for LinearFilter {
    fn extent(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn respond(&self, level: &FeatureLevel) -> Result<ScoreMap> {
        if level.dim() != self.dim {
            return Err(InferenceError::FeatureDimension {
                expected: self.dim,
                found: level.dim(),
            });
        }
        let out_rows = level.rows() + 1 - self.rows;
        let out_cols = level.cols() + 1 - self.cols;
        let row_len = self.cols * self.dim;

        let mut out = ScoreMap::filled(out_rows, out_cols, self.bias);
        for y in 0..out_rows {
            let dst = out.row_mut(y);
            for (x, acc) in dst.iter_mut().enumerate() {
                let mut sum = 0.0f64;
                for fy in 0..self.rows {
                    let w = &self.weights[fy * row_len..(fy + 1) * row_len];
                    let f = level.span(y + fy, x, self.cols);
                    sum += f64::from(dot_simd(w, f));
                }
                *acc += sum;
            }
        }
        Ok(out)
    }
}

/// SIMD-dispatched dot product of two equal-length rows.
#[multiversion(targets(
    "x86_64+avx2+fma",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
