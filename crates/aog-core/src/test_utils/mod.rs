//! Synthetic pyramids and grammars for tests and benchmarks.

use crate::filter::LinearFilter;
use crate::grammar::{Deformation, Grammar, Offset, Part};
use crate::grid::ScoreMap;
use crate::pyramid::{FeatureLevel, FeaturePyramid};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Builder for pyramids with planted feature patterns.
pub mod scene;

/// Pixels per cell of level `l` when each octave spans `interval` levels.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn level_scale(l: usize, interval: usize) -> f64 {
    2f64.powf(l as f64 / interval.max(1) as f64)
}

/// Build a pyramid whose level `l` stacks the channel grids `levels[l]`.
///
/// Every channel of a level must share its dimensions. Level `l` gets
/// scale [`level_scale`]`(l, interval)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]
pub fn synthetic_pyramid(levels: &[Vec<ScoreMap>], pad_x: usize, pad_y: usize, interval: usize) -> FeaturePyramid {
    let levels = levels
        .iter()
        .enumerate()
        .map(|(l, channels)| {
            let (rows, cols) = channels.first().map_or((0, 0), |c| (c.rows(), c.cols()));
            let dim = channels.len();
            let mut data = Vec::with_capacity(rows * cols * dim);
            for y in 0..rows {
                for x in 0..cols {
                    data.extend(channels.iter().map(|c| c.get(y, x) as f32));
                }
            }
            FeatureLevel::new(rows, cols, dim, level_scale(l, interval), data).expect("channel grids share a shape")
        })
        .collect();
    FeaturePyramid::new(levels, pad_x, pad_y, interval).expect("at least one level")
}

/// One channel per level, one level per octave.
#[must_use]
pub fn single_channel_pyramid(levels: &[ScoreMap], pad_x: usize, pad_y: usize) -> FeaturePyramid {
    let stacked: Vec<Vec<ScoreMap>> = levels.iter().map(|m| vec![m.clone()]).collect();
    synthetic_pyramid(&stacked, pad_x, pad_y, 1)
}

/// Pyramid of standard normal features, reproducible from `seed`.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn random_pyramid(seed: u64, sizes: &[(usize, usize)], dim: usize, pad: usize, interval: usize) -> FeaturePyramid {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, 1.0).expect("valid normal parameters");
    let levels = sizes
        .iter()
        .enumerate()
        .map(|(l, &(rows, cols))| {
            let data = (0..rows * cols * dim).map(|_| normal.sample(&mut rng)).collect();
            FeatureLevel::new(rows, cols, dim, level_scale(l, interval), data).expect("buffer sized from shape")
        })
        .collect();
    FeaturePyramid::new(levels, pad, pad, interval).expect("at least one level")
}

/// Linear filter with uniform random weights in `[-1, 1)`.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn random_filter<R: Rng>(rng: &mut R, rows: usize, cols: usize, dim: usize) -> LinearFilter {
    let weights = (0..rows * cols * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    LinearFilter::new(rows, cols, dim, weights, rng.gen_range(-0.5..0.5)).expect("weights sized from shape")
}

/// A small two-channel model: an OR root over a deformable object with a
/// finer part, and a rigid two-filter object.
///
/// The deformable object needs a level one octave below its own, so on a
/// pyramid with `interval` 1 it is valid from level 1 up.
#[must_use]
pub fn two_object_grammar() -> Grammar {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut g = Grammar::new();

    let root_filter = g.add_terminal("root-filter", random_filter(&mut rng, 3, 3, 2));
    let part_filter = g.add_terminal("part-filter", random_filter(&mut rng, 2, 2, 2));
    let deformable = g.add_deformable(
        "deformable-object",
        &[
            Part::new(root_filter, Offset::new(0, 0)),
            Part::new(part_filter, Offset::finer(1, 1)),
        ],
        1,
        Deformation {
            ax: 0.1,
            bx: 0.0,
            ay: 0.1,
            by: 0.0,
        },
        0,
        -0.25,
    );

    let left = g.add_terminal("left", random_filter(&mut rng, 2, 1, 2));
    let right = g.add_terminal("right", random_filter(&mut rng, 2, 1, 2));
    let rigid = g.add_compositional(
        "rigid-object",
        &[Part::new(left, Offset::new(0, 0)), Part::new(right, Offset::new(1, 0))],
        0.1,
    );

    let root = g.add_switching("object", &[deformable, rigid]);
    g.set_root(root);
    g
}

/// Terminal plus deformable parent with cost `a * (dx^2 + dy^2)`.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn deformable_grammar(a: f64, shift: i32) -> Grammar {
    let mut g = Grammar::new();
    let t = g.add_terminal("part", LinearFilter::channel(1, 0).expect("channel 0 of 1"));
    let d = g.add_deformable("object", &[Part::new(t, Offset::new(0, 0))], 0, Deformation::quadratic(a), shift, 0.0);
    g.set_root(d);
    g
}
