//! Read-only feature pyramid consumed by the engine.
//!
//! Building a pyramid from an image happens elsewhere; this module only
//! validates and exposes the dense per-level feature grids.

use crate::error::{InferenceError, Result};

/// One pyramid level: a dense grid of `dim`-channel feature cells.
#[derive(Clone, Debug)]
pub struct FeatureLevel {
    rows: usize,
    cols: usize,
    dim: usize,
    scale: f64,
    data: Vec<f32>,
}

impl FeatureLevel {
    /// Wrap a `rows * cols * dim` buffer (cell-major, channels contiguous).
    ///
    /// `scale` is the size of one cell in image pixels.
    pub fn new(rows: usize, cols: usize, dim: usize, scale: f64, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols * dim {
            return Err(InferenceError::Shape {
                rows,
                cols,
                depth: dim,
                len: data.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            dim,
            scale,
            data,
        })
    }

    /// Number of cell rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of cell columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Channels per cell.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Image pixels per cell.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Features of the cell at `(y, x)`.
    #[inline]
    pub fn cell(&self, y: usize, x: usize) -> &[f32] {
        let start = (y * self.cols + x) * self.dim;
        &self.data[start..start + self.dim]
    }

    /// Features of `len` consecutive cells starting at `(y, x)`.
    #[inline]
    pub fn span(&self, y: usize, x: usize, len: usize) -> &[f32] {
        let start = (y * self.cols + x) * self.dim;
        &self.data[start..start + len * self.dim]
    }
}

/// Geometry of one level, retained by the cache after propagation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelGeometry {
    /// Number of cell rows.
    pub rows: usize,
    /// Number of cell columns.
    pub cols: usize,
    /// Image pixels per cell.
    pub scale: f64,
}

/// Multi-scale feature pyramid, finest level first.
#[derive(Clone, Debug)]
pub struct FeaturePyramid {
    levels: Vec<FeatureLevel>,
    pad_x: usize,
    pad_y: usize,
    interval: usize,
}

impl FeaturePyramid {
    /// Assemble a pyramid.
    ///
    /// `pad_x`/`pad_y` is the padding margin (in cells) added around every
    /// level; `interval` is the number of levels per octave.
    pub fn new(levels: Vec<FeatureLevel>, pad_x: usize, pad_y: usize, interval: usize) -> Result<Self> {
        if levels.is_empty() {
            return Err(InferenceError::EmptyPyramid);
        }
        Ok(Self {
            levels,
            pad_x,
            pad_y,
            interval: interval.max(1),
        })
    }

    /// Number of levels.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level `l`.
    #[inline]
    pub fn level(&self, l: usize) -> &FeatureLevel {
        &self.levels[l]
    }

    /// All levels, finest first.
    #[inline]
    pub fn levels(&self) -> &[FeatureLevel] {
        &self.levels
    }

    /// Padding margin `(pad_x, pad_y)` in cells.
    #[inline]
    pub fn pad(&self) -> (usize, usize) {
        (self.pad_x, self.pad_y)
    }

    /// Levels per octave.
    #[inline]
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Geometry of every level.
    pub fn geometry(&self) -> Vec<LevelGeometry> {
        self.levels
            .iter()
            .map(|l| LevelGeometry {
                rows: l.rows,
                cols: l.cols,
                scale: l.scale,
            })
            .collect()
    }
}
