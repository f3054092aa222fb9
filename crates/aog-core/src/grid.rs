//! Dense row-major 2D grids used for score, overlap and displacement maps.

use crate::error::{InferenceError, Result};

/// An owned, dense, row-major 2D grid.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

/// Per-cell scores of one node at one pyramid level.
pub type ScoreMap = Grid<f64>;

impl<T: Copy> Grid<T> {
    /// Create a grid filled with `value`.
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Wrap a row-major buffer after checking its length.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(InferenceError::Shape {
                rows,
                cols,
                depth: 1,
                len: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a grid by evaluating `f(y, x)` at every cell.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for y in 0..rows {
            for x in 0..cols {
                data.push(f(y, x));
            }
        }
        Self { rows, cols, data }
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Value at `(y, x)`.
    ///
    /// # Panics
    /// Panics if the cell is out of bounds.
    #[inline]
    pub fn get(&self, y: usize, x: usize) -> T {
        assert!(
            y < self.rows && x < self.cols,
            "Cell ({y}, {x}) out of bounds for {}x{} grid",
            self.rows,
            self.cols
        );
        self.data[y * self.cols + x]
    }

    /// Value at a signed position, `None` outside the grid.
    #[inline]
    pub fn get_checked(&self, y: i64, x: i64) -> Option<T> {
        if y < 0 || x < 0 {
            return None;
        }
        let (y, x) = (y as usize, x as usize);
        if y >= self.rows || x >= self.cols {
            return None;
        }
        Some(self.data[y * self.cols + x])
    }

    /// Overwrite the value at `(y, x)`.
    ///
    /// # Panics
    /// Panics if the cell is out of bounds.
    #[inline]
    pub fn set(&mut self, y: usize, x: usize, value: T) {
        assert!(
            y < self.rows && x < self.cols,
            "Cell ({y}, {x}) out of bounds for {}x{} grid",
            self.rows,
            self.cols
        );
        self.data[y * self.cols + x] = value;
    }

    /// Row `y` as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Row `y` as a mutable slice.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.cols;
        &mut self.data[start..start + self.cols]
    }

    /// The whole buffer in row-major order.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The whole buffer in row-major order, mutable.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Iterate `(y, x, value)` in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let cols = self.cols.max(1);
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i / cols, i % cols, v))
    }
}

impl ScoreMap {
    /// A grid where every cell is unreachable.
    #[must_use]
    pub fn unreachable(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, f64::NEG_INFINITY)
    }

    /// Largest finite value and its `(y, x)`; first occurrence wins.
    pub fn max_cell(&self) -> Option<(usize, usize, f64)> {
        let mut best: Option<(usize, usize, f64)> = None;
        for (y, x, v) in self.cells() {
            if v.is_finite() && best.is_none_or(|(_, _, b)| v > b) {
                best = Some((y, x, v));
            }
        }
        best
    }

    /// Bitwise equality, distinguishing `-0.0` and treating equal NaN payloads as equal.
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_indexing() {
        let g = Grid::from_vec(2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(g.get(1, 2), 6);
        assert_eq!(g.row(1), &[4, 5, 6]);
        assert_eq!(g.get_checked(-1, 0), None);
        assert_eq!(g.get_checked(0, 3), None);
        assert_eq!(g.get_checked(1, 0), Some(4));
    }

    #[test]
    #[should_panic(expected = "Cell (2, 0) out of bounds")]
    fn test_row_out_of_bounds_panics() {
        let g = ScoreMap::filled(2, 3, 0.0);
        let _ = g.get(2, 0);
    }

    #[test]
    fn test_grid_shape_mismatch() {
        assert!(Grid::from_vec(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_max_cell_skips_unreachable() {
        let mut g = ScoreMap::unreachable(3, 3);
        assert!(g.max_cell().is_none());
        g.set(2, 1, -4.0);
        g.set(0, 2, -4.0);
        assert_eq!(g.max_cell(), Some((0, 2, -4.0)));
    }

    #[test]
    fn test_cells_order() {
        let g = Grid::from_fn(2, 2, |y, x| y * 10 + x);
        let v: Vec<_> = g.cells().collect();
        assert_eq!(v, vec![(0, 0, 0), (0, 1, 1), (1, 0, 10), (1, 1, 11)]);
    }
}
