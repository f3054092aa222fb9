#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]

use super::level_scale;
use crate::pyramid::{FeatureLevel, FeaturePyramid};
use crate::select::BoundingBox;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// A rectangular feature pattern written into one pyramid level.
#[derive(Debug, Clone)]
pub struct Placement {
    /// Target level.
    pub level: usize,
    /// Left cell, padding included.
    pub x: usize,
    /// Top cell, padding included.
    pub y: usize,
    /// Pattern height in cells.
    pub rows: usize,
    /// Pattern width in cells.
    pub cols: usize,
    /// Channel written.
    pub channel: usize,
    /// Value written to every cell of the pattern.
    pub value: f32,
}

/// A builder for pyramids with planted objects over background noise.
///
/// Level `l` has `ceil(rows / scale)` by `ceil(cols / scale)` cells plus the
/// padding margin on every side.
pub struct SceneBuilder {
    rows: usize,
    cols: usize,
    dim: usize,
    num_levels: usize,
    interval: usize,
    pad: usize,
    noise_sigma: f32,
    seed: u64,
    placements: Vec<Placement>,
}

impl SceneBuilder {
    /// Scene with a finest level of `rows x cols` cells of `dim` channels.
    pub fn new(rows: usize, cols: usize, dim: usize) -> Self {
        Self {
            rows,
            cols,
            dim,
            num_levels: 1,
            interval: 1,
            pad: 0,
            noise_sigma: 0.0,
            seed: 0,
            placements: Vec::new(),
        }
    }

    /// Set the number of levels and the levels per octave.
    pub fn with_levels(mut self, num_levels: usize, interval: usize) -> Self {
        self.num_levels = num_levels.max(1);
        self.interval = interval.max(1);
        self
    }

    /// Set the padding margin in cells.
    pub fn with_padding(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    /// Set the background noise standard deviation and its seed.
    pub fn with_noise(mut self, sigma: f32, seed: u64) -> Self {
        self.noise_sigma = sigma;
        self.seed = seed;
        self
    }

    /// Write `value` into `channel` over a `rows x cols` block at `(x, y)`
    /// of `level`, coordinates excluding padding. Returns the block's
    /// window in image pixels.
    #[allow(clippy::too_many_arguments)]
    pub fn plant(
        &mut self,
        level: usize,
        x: usize,
        y: usize,
        rows: usize,
        cols: usize,
        channel: usize,
        value: f32,
    ) -> BoundingBox {
        self.placements.push(Placement {
            level,
            x: x + self.pad,
            y: y + self.pad,
            rows,
            cols,
            channel,
            value,
        });
        let scale = level_scale(level, self.interval);
        BoundingBox::new(x as f64 * scale, y as f64 * scale, cols as f64 * scale, rows as f64 * scale)
    }

    /// Cell dimensions of `level`, padding included.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn level_dims(&self, level: usize) -> (usize, usize) {
        let scale = level_scale(level, self.interval);
        let rows = (self.rows as f64 / scale).ceil() as usize;
        let cols = (self.cols as f64 / scale).ceil() as usize;
        (rows + 2 * self.pad, cols + 2 * self.pad)
    }

    /// Build the pyramid and return it with the placements.
    ///
    /// # Panics
    /// Panics if a placement does not fit its level.
    pub fn build(self) -> (FeaturePyramid, Vec<Placement>) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0f32, self.noise_sigma.max(f32::MIN_POSITIVE)).expect("valid noise params");

        let levels = (0..self.num_levels)
            .map(|l| {
                let (rows, cols) = self.level_dims(l);
                let mut data: Vec<f32> = if self.noise_sigma > 0.0 {
                    (0..rows * cols * self.dim).map(|_| noise.sample(&mut rng)).collect()
                } else {
                    vec![0.0; rows * cols * self.dim]
                };
                for p in self.placements.iter().filter(|p| p.level == l) {
                    assert!(p.y + p.rows <= rows && p.x + p.cols <= cols, "placement outside level {l}");
                    for y in p.y..p.y + p.rows {
                        for x in p.x..p.x + p.cols {
                            data[(y * cols + x) * self.dim + p.channel] = p.value;
                        }
                    }
                }
                FeatureLevel::new(rows, cols, self.dim, level_scale(l, self.interval), data)
                    .expect("buffer sized from shape")
            })
            .collect();

        let pyramid = FeaturePyramid::new(levels, self.pad, self.pad, self.interval).expect("at least one level");
        (pyramid, self.placements)
    }
}
