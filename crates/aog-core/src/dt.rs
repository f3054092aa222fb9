//! Generalized distance transform with quadratic cost.
//!
//! For every cell `p` the transform computes `max_q f(q) - cost(q - p)` and
//! the displacement `q - p` achieving it. Each scanline is solved in O(n)
//! with the lower envelope of parabolas (Felzenszwalb & Huttenlocher); the
//! 2D transform runs along rows, then along columns. Displacements are
//! bounded by the grid: `q` always lies inside the input.
//!
//! Displacements are stored as `delta + shift`, so callers recover the
//! source cell as `p + stored - shift`.

use crate::grammar::Deformation;
use crate::grid::{Grid, ScoreMap};
use bumpalo::Bump;

/// Output of [`distance_transform_2d`].
#[derive(Clone, Debug, PartialEq)]
pub struct Transformed {
    /// Best score minus deformation cost at every cell.
    pub scores: ScoreMap,
    /// Stored column displacement (`delta_x + shift`).
    pub dx: Grid<i32>,
    /// Stored row displacement (`delta_y + shift`).
    pub dy: Grid<i32>,
}

/// 1D transform of `values` into `out`, with cost `a*d^2 + b*d` for
/// displacement `d = j - i`. Scratch memory comes from `arena`.
///
/// # Panics
/// Panics if `out` or `disp` differ in length from `values`.
pub fn distance_transform_1d(
    arena: &Bump,
    values: &[f64],
    out: &mut [f64],
    disp: &mut [i32],
    a: f64,
    b: f64,
    shift: i32,
) {
    let n = values.len();
    assert!(out.len() == n && disp.len() == n, "output length mismatch");
    let v = arena.alloc_slice_fill_copy(n, 0usize);
    let z = arena.alloc_slice_fill_copy(n + 1, 0.0f64);
    transform_line(values, out, disp, a, b, shift, v, z);
}

/// 2D transform of `map` under `def`.
pub fn distance_transform_2d(arena: &Bump, map: &ScoreMap, def: &Deformation, shift: i32) -> Transformed {
    let (rows, cols) = (map.rows(), map.cols());
    let n = rows.max(cols);
    let v = arena.alloc_slice_fill_copy(n, 0usize);
    let z = arena.alloc_slice_fill_copy(n + 1, 0.0f64);

    // Pass 1: along rows
    let mut tmp = ScoreMap::unreachable(rows, cols);
    let mut ix = Grid::filled(rows, cols, shift);
    for y in 0..rows {
        transform_line(map.row(y), tmp.row_mut(y), ix.row_mut(y), def.ax, def.bx, shift, v, z);
    }

    // Pass 2: along columns, resolving the row pass's choice at the source row
    let col_in = arena.alloc_slice_fill_copy(rows, 0.0f64);
    let col_out = arena.alloc_slice_fill_copy(rows, 0.0f64);
    let col_disp = arena.alloc_slice_fill_copy(rows, 0i32);

    let mut scores = ScoreMap::unreachable(rows, cols);
    let mut dx = Grid::filled(rows, cols, shift);
    let mut dy = Grid::filled(rows, cols, shift);
    for x in 0..cols {
        for (y, slot) in col_in.iter_mut().enumerate() {
            *slot = tmp.get(y, x);
        }
        transform_line(col_in, col_out, col_disp, def.ay, def.by, shift, v, z);
        for y in 0..rows {
            let src_y = source(y, col_disp[y], shift);
            scores.set(y, x, col_out[y]);
            dy.set(y, x, col_disp[y]);
            dx.set(y, x, ix.get(src_y, x));
        }
    }

    Transformed { scores, dx, dy }
}

#[inline]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn source(i: usize, stored: i32, shift: i32) -> usize {
    (i as i64 + i64::from(stored - shift)) as usize
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn stored(i: usize, j: usize, shift: i32) -> i32 {
    (j as i64 - i as i64) as i32 + shift
}

#[inline]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
fn penalized(values: &[f64], i: usize, j: usize, a: f64, b: f64) -> f64 {
    let d = (j as i64 - i as i64) as f64;
    values[j] - a * d * d - b * d
}

#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
fn transform_line(
    values: &[f64],
    out: &mut [f64],
    disp: &mut [i32],
    a: f64,
    b: f64,
    shift: i32,
    v: &mut [usize],
    z: &mut [f64],
) {
    let n = values.len();
    if !(a > 0.0 && a.is_finite()) {
        exhaustive_line(values, out, disp, a, b, shift);
        return;
    }

    // F_j = a*j^2 + b*j - f(j); parabolas from j and p cross at (F_j - F_p) / (2a(j - p)).
    let key = |j: usize| {
        let fj = j as f64;
        a * fj * fj + b * fj - values[j]
    };

    let mut count = 0usize;
    for q in 0..n {
        if !values[q].is_finite() {
            continue;
        }
        if count == 0 {
            v[0] = q;
            z[0] = f64::NEG_INFINITY;
            z[1] = f64::INFINITY;
            count = 1;
            continue;
        }
        let kq = key(q);
        loop {
            let top = count - 1;
            let p = v[top];
            let s = (kq - key(p)) / (2.0 * a * (q - p) as f64);
            if top > 0 && s <= z[top] {
                count -= 1;
            } else {
                v[count] = q;
                z[count] = s;
                z[count + 1] = f64::INFINITY;
                count += 1;
                break;
            }
        }
    }

    if count == 0 {
        out[..n].fill(f64::NEG_INFINITY);
        disp[..n].fill(shift);
        return;
    }

    let mut k = 0usize;
    for i in 0..n {
        let fi = i as f64;
        while k + 1 < count && z[k + 1] < fi {
            k += 1;
        }
        let j = v[k];
        out[i] = penalized(values, i, j, a, b);
        disp[i] = stored(i, j, shift);
    }
}

/// O(n^2) search, used when the cost is not strictly convex.
fn exhaustive_line(values: &[f64], out: &mut [f64], disp: &mut [i32], a: f64, b: f64, shift: i32) {
    let n = values.len();
    for i in 0..n {
        let mut best = f64::NEG_INFINITY;
        let mut arg = i;
        for j in 0..n {
            if !values[j].is_finite() {
                continue;
            }
            let val = penalized(values, i, j, a, b);
            if val > best {
                best = val;
                arg = j;
            }
        }
        out[i] = best;
        disp[i] = stored(i, arg, shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn brute_force(values: &[f64], a: f64, b: f64) -> Vec<f64> {
        (0..values.len())
            .map(|i| {
                (0..values.len())
                    .filter(|&j| values[j].is_finite())
                    .map(|j| penalized(values, i, j, a, b))
                    .fold(f64::NEG_INFINITY, f64::max)
            })
            .collect()
    }

    fn run_1d(values: &[f64], a: f64, b: f64, shift: i32) -> (Vec<f64>, Vec<i32>) {
        let arena = Bump::new();
        let mut out = vec![0.0; values.len()];
        let mut disp = vec![0; values.len()];
        distance_transform_1d(&arena, values, &mut out, &mut disp, a, b, shift);
        (out, disp)
    }

    #[test]
    fn test_single_peak_spreads_quadratically() {
        let values = [f64::NEG_INFINITY, f64::NEG_INFINITY, 5.0, f64::NEG_INFINITY, f64::NEG_INFINITY];
        let (out, disp) = run_1d(&values, 1.0, 0.0, 0);
        assert_eq!(out, vec![1.0, 4.0, 5.0, 4.0, 1.0]);
        assert_eq!(disp, vec![2, 1, 0, -1, -2]);
    }

    #[test]
    fn test_shift_offsets_stored_displacement() {
        let values = [0.0, 10.0, 0.0];
        let (_, disp) = run_1d(&values, 1.0, 0.0, 4);
        assert_eq!(disp, vec![5, 4, 3]);
    }

    #[test]
    fn test_all_unreachable_line() {
        let values = [f64::NEG_INFINITY; 4];
        let (out, disp) = run_1d(&values, 0.5, 0.0, 2);
        assert!(out.iter().all(|v| *v == f64::NEG_INFINITY));
        assert_eq!(disp, vec![2; 4]);
    }

    #[test]
    fn test_linear_term_biases_direction() {
        // b > 0 penalizes moving right, b < 0 rewards it
        let values = [0.0, 0.0, 0.0];
        let (out, disp) = run_1d(&values, 1.0, -1.5, 0);
        assert_abs_diff_eq!(out[0], 0.5);
        assert_eq!(disp[0], 1);
    }

    #[test]
    fn test_2d_matches_exhaustive() {
        let rows = 4;
        let cols = 5;
        let map = ScoreMap::from_fn(rows, cols, |y, x| ((y * 7 + x * 3) % 5) as f64 - 2.0);
        let def = Deformation {
            ax: 0.7,
            bx: 0.2,
            ay: 1.3,
            by: -0.4,
        };
        let arena = Bump::new();
        let t = distance_transform_2d(&arena, &map, &def, 1);

        for y in 0..rows {
            for x in 0..cols {
                let mut best = f64::NEG_INFINITY;
                for qy in 0..rows {
                    for qx in 0..cols {
                        let c = def.cost(qx as i32 - x as i32, qy as i32 - y as i32);
                        best = best.max(map.get(qy, qx) - c);
                    }
                }
                assert_abs_diff_eq!(t.scores.get(y, x), best, epsilon = 1e-9);

                let qx = x as i32 + t.dx.get(y, x) - 1;
                let qy = y as i32 + t.dy.get(y, x) - 1;
                let achieved = map.get(qy as usize, qx as usize)
                    - def.cost(qx - x as i32, qy - y as i32);
                assert_abs_diff_eq!(achieved, best, epsilon = 1e-9);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_1d_matches_brute_force(
            raw in prop::collection::vec(prop::option::weighted(0.85, -10.0f64..10.0), 1..=20),
            a in prop_oneof![0.01f64..5.0, -1.0f64..=0.0],
            b in -3.0f64..3.0,
            shift in -3i32..4,
        ) {
            let values: Vec<f64> = raw.iter().map(|v| v.unwrap_or(f64::NEG_INFINITY)).collect();
            let (out, disp) = run_1d(&values, a, b, shift);
            let expected = brute_force(&values, a, b);

            for i in 0..values.len() {
                if expected[i].is_finite() {
                    prop_assert!((out[i] - expected[i]).abs() < 1e-9,
                        "index {}: got {} expected {}", i, out[i], expected[i]);
                    let j = source(i, disp[i], shift);
                    prop_assert!((penalized(&values, i, j, a, b) - expected[i]).abs() < 1e-9);
                } else {
                    prop_assert_eq!(out[i], f64::NEG_INFINITY);
                }
            }
        }
    }
}
