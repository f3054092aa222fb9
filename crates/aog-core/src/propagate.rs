//! Bottom-up score propagation.
//!
//! Nodes are visited in post-order so every child is final before a parent
//! reads it. Each level of a node is computed independently of the others;
//! terminal responses and rigid combinations run level-parallel.

use crate::Inference;
use crate::cache::{Displacement, ScoreCache};
use crate::dt::distance_transform_2d;
use crate::error::{GrammarError, Result};
use crate::filter::Appearance;
use crate::grammar::{Deformation, NodeId, NodeKind, Offset, Part};
use crate::grid::{Grid, ScoreMap};
use crate::pyramid::{FeaturePyramid, LevelGeometry};
use bumpalo::Bump;
use multiversion::multiversion;
use rayon::prelude::*;

impl Inference<'_> {
    /// Compute score maps for every node reachable from the root.
    ///
    /// The previous generation is replaced only when the whole run succeeds.
    pub fn propagate(&mut self, pyramid: &FeaturePyramid) -> Result<()> {
        let _span = tracing::info_span!("propagate", levels = pyramid.num_levels()).entered();
        let grammar = self.grammar;
        let geometry = pyramid.geometry();
        let interval = pyramid.interval();
        let validity = self.level_validity(&geometry, interval)?;

        let mut cache = ScoreCache::begin(
            grammar.len(),
            geometry.clone(),
            pyramid.pad(),
            interval,
            self.cache.generation() + 1,
        );

        for &id in &self.order.postorder {
            let valid = &validity[id.index()];
            match &grammar.node(id).kind {
                NodeKind::Terminal { appearance } => {
                    let maps = terminal_maps(appearance.as_ref(), pyramid, valid)?;
                    cache.set_scores(id, maps);
                }
                NodeKind::Switching { children } => {
                    let maps = (0..geometry.len())
                        .into_par_iter()
                        .map(|l| valid[l].then(|| switching_level(&cache, children, l, geometry[l])))
                        .collect();
                    cache.set_scores(id, maps);
                }
                NodeKind::Compositional { parts, bias } => {
                    let maps = (0..geometry.len())
                        .into_par_iter()
                        .map(|l| {
                            valid[l].then(|| {
                                let mut out = ScoreMap::filled(geometry[l].rows, geometry[l].cols, *bias);
                                for part in parts {
                                    let child = child_map(&cache, part, l, interval);
                                    accumulate_part(&mut out, child, part.offset);
                                }
                                out
                            })
                        })
                        .collect();
                    cache.set_scores(id, maps);
                }
                NodeKind::Deformable {
                    parts,
                    deformed,
                    deformation,
                    shift,
                    bias,
                } => {
                    let rule = DeformRule {
                        parts,
                        deformed: *deformed,
                        deformation,
                        shift: *shift,
                        bias: *bias,
                    };
                    let mut maps = Vec::with_capacity(geometry.len());
                    let mut disps = Vec::with_capacity(geometry.len());
                    for (l, geom) in geometry.iter().enumerate() {
                        if valid[l] {
                            self.arena.reset();
                            let (map, disp) = deformable_level(&self.arena, &cache, &rule, l, *geom, interval);
                            maps.push(Some(map));
                            disps.push(Some(disp));
                        } else {
                            maps.push(None);
                            disps.push(None);
                        }
                    }
                    cache.set_scores(id, maps);
                    cache.set_displacements(id, disps);
                }
            }

            let invalid = valid.iter().filter(|v| !**v).count();
            if invalid > 0 {
                tracing::debug!(node = %id, name = %grammar.node(id).name, invalid, "levels skipped");
            }
        }

        cache.finish();
        self.cache = cache;
        Ok(())
    }

    /// Validity of every node at every level, derived from extents alone.
    ///
    /// Fails when a reachable node is valid at no level.
    pub(crate) fn level_validity(&self, geometry: &[LevelGeometry], interval: usize) -> Result<Vec<Vec<bool>>> {
        let grammar = self.grammar;
        let mut validity = vec![Vec::new(); grammar.len()];

        for &id in &self.order.postorder {
            let (eh, ew) = self.extents[id.index()];
            let fits = |g: &LevelGeometry| g.rows >= eh && g.cols >= ew;
            let levels: Vec<bool> = match &grammar.node(id).kind {
                NodeKind::Terminal { .. } => geometry.iter().map(fits).collect(),
                NodeKind::Switching { children } => (0..geometry.len())
                    .map(|l| children.iter().any(|c| validity[c.index()][l]))
                    .collect(),
                NodeKind::Compositional { parts, .. } | NodeKind::Deformable { parts, .. } => geometry
                    .iter()
                    .enumerate()
                    .map(|(l, g)| {
                        fits(g)
                            && parts.iter().all(|p| {
                                child_level(l, p.offset, interval)
                                    .is_some_and(|lc| validity[p.child.index()][lc])
                            })
                    })
                    .collect(),
            };
            if !levels.iter().any(|v| *v) {
                return Err(GrammarError::NeverValid(id).into());
            }
            validity[id.index()] = levels;
        }
        Ok(validity)
    }
}

/// Level holding a part's child, if the pyramid reaches that far down.
#[inline]
pub(crate) fn child_level(l: usize, offset: Offset, interval: usize) -> Option<usize> {
    l.checked_sub(usize::from(offset.ds) * interval)
}

/// Cell of the child anchored by a parent at `(y, x)`.
#[inline]
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn child_cell(y: usize, x: usize, offset: Offset) -> (i64, i64) {
    let step = offset.step();
    (
        y as i64 * step + i64::from(offset.dy),
        x as i64 * step + i64::from(offset.dx),
    )
}

fn child_map<'c>(cache: &'c ScoreCache, part: &Part, l: usize, interval: usize) -> Option<&'c ScoreMap> {
    child_level(l, part.offset, interval).and_then(|lc| cache.score_map(part.child, lc))
}

fn terminal_maps(appearance: &dyn Appearance, pyramid: &FeaturePyramid, valid: &[bool]) -> Result<Vec<Option<ScoreMap>>> {
    pyramid
        .levels()
        .par_iter()
        .zip(valid.par_iter())
        .map(|(level, &ok)| {
            if !ok {
                return Ok(None);
            }
            let response = appearance.respond(level)?;
            let mut map = ScoreMap::unreachable(level.rows(), level.cols());
            let cols = response.cols().min(level.cols());
            for y in 0..response.rows().min(level.rows()) {
                map.row_mut(y)[..cols].copy_from_slice(&response.row(y)[..cols]);
            }
            Ok(Some(map))
        })
        .collect()
}

/// Elementwise max over the valid children at level `l`.
pub(crate) fn switching_level(cache: &ScoreCache, children: &[NodeId], l: usize, geom: LevelGeometry) -> ScoreMap {
    let mut out = ScoreMap::unreachable(geom.rows, geom.cols);
    for &child in children {
        if let Some(m) = cache.score_map(child, l) {
            max_into_simd(out.as_mut_slice(), m.as_slice());
        }
    }
    out
}

/// Add a child's scores, read at the part's offset, into `out`.
/// Cells whose child position falls outside the child map become `-inf`.
pub(crate) fn accumulate_part(out: &mut ScoreMap, child: Option<&ScoreMap>, offset: Offset) {
    let Some(child) = child else {
        out.as_mut_slice().fill(f64::NEG_INFINITY);
        return;
    };
    let (rows, cols) = (out.rows(), out.cols());

    if offset.ds == 0 {
        #[allow(clippy::cast_sign_loss)]
        let (dy, dx) = (offset.dy as usize, offset.dx as usize);
        for y in 0..rows {
            let dst = out.row_mut(y);
            let cy = y + dy;
            if cy >= child.rows() || dx >= child.cols() {
                dst.fill(f64::NEG_INFINITY);
                continue;
            }
            let src = &child.row(cy)[dx..];
            let n = src.len().min(cols);
            add_into_simd(&mut dst[..n], &src[..n]);
            dst[n..].fill(f64::NEG_INFINITY);
        }
        return;
    }

    for y in 0..rows {
        for x in 0..cols {
            let (cy, cx) = child_cell(y, x, offset);
            let v = child.get_checked(cy, cx).unwrap_or(f64::NEG_INFINITY);
            let cell = out.get(y, x) + v;
            out.set(y, x, cell);
        }
    }
}

struct DeformRule<'a> {
    parts: &'a [Part],
    deformed: usize,
    deformation: &'a Deformation,
    shift: i32,
    bias: f64,
}

fn deformable_level(
    arena: &Bump,
    cache: &ScoreCache,
    rule: &DeformRule<'_>,
    l: usize,
    geom: LevelGeometry,
    interval: usize,
) -> (ScoreMap, Displacement) {
    let mut out = ScoreMap::filled(geom.rows, geom.cols, rule.bias);
    let mut displacement = None;
    for (i, part) in rule.parts.iter().enumerate() {
        let child = child_map(cache, part, l, interval);
        if i == rule.deformed {
            if let Some(child) = child {
                let t = distance_transform_2d(arena, child, rule.deformation, rule.shift);
                accumulate_part(&mut out, Some(&t.scores), part.offset);
                displacement = Some(Displacement::from(t));
            } else {
                accumulate_part(&mut out, None, part.offset);
            }
        } else {
            accumulate_part(&mut out, child, part.offset);
        }
    }
    // an invalid child leaves the whole level unreachable; nothing was displaced
    let displacement = displacement.unwrap_or_else(|| Displacement {
        dx: Grid::filled(0, 0, rule.shift),
        dy: Grid::filled(0, 0, rule.shift),
    });
    (out, displacement)
}

#[multiversion(targets(
    "x86_64+avx2+fma",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn max_into_simd(dst: &mut [f64], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        // strict comparison keeps the earlier child on ties
        if s > *d {
            *d = s;
        }
    }
}

#[multiversion(targets(
    "x86_64+avx2+fma",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn add_into_simd(dst: &mut [f64], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::filter::LinearFilter;
    use crate::grammar::Grammar;
    use crate::test_utils::synthetic_pyramid;

    fn constant(rows: usize, cols: usize, v: f64) -> ScoreMap {
        ScoreMap::filled(rows, cols, v)
    }

    #[test]
    fn test_switching_takes_elementwise_max() {
        let a = ScoreMap::from_fn(4, 4, |y, x| (y * 4 + x) as f64);
        let b = constant(4, 4, 7.5);
        let pyramid = synthetic_pyramid(&[vec![a.clone(), b.clone()]], 0, 0, 1);

        let mut g = Grammar::new();
        let ta = g.add_terminal("a", LinearFilter::channel(2, 0).unwrap());
        let tb = g.add_terminal("b", LinearFilter::channel(2, 1).unwrap());
        let or = g.add_switching("or", &[ta, tb]);
        g.set_root(or);

        let mut engine = Inference::new(&g).unwrap();
        engine.propagate(&pyramid).unwrap();
        let m = engine.cache().score_map(or, 0).unwrap();
        for (y, x, v) in m.cells() {
            assert_eq!(v, a.get(y, x).max(b.get(y, x)));
        }
    }

    #[test]
    fn test_compositional_additivity() {
        let c1 = ScoreMap::from_fn(5, 5, |y, x| (y + x) as f64);
        let c2 = ScoreMap::from_fn(5, 5, |y, x| (y * x) as f64 * 0.5);
        let pyramid = synthetic_pyramid(&[vec![c1.clone(), c2.clone()]], 0, 0, 1);

        let mut g = Grammar::new();
        let t1 = g.add_terminal("t1", LinearFilter::channel(2, 0).unwrap());
        let t2 = g.add_terminal("t2", LinearFilter::channel(2, 1).unwrap());
        let and = g.add_compositional(
            "and",
            &[Part::new(t1, Offset::new(0, 0)), Part::new(t2, Offset::new(2, 1))],
            -1.25,
        );
        g.set_root(and);

        let mut engine = Inference::new(&g).unwrap();
        engine.propagate(&pyramid).unwrap();
        let m = engine.cache().score_map(and, 0).unwrap();
        for (y, x, v) in m.cells() {
            if y + 1 < 5 && x + 2 < 5 {
                assert_eq!(v, c1.get(y, x) + c2.get(y + 1, x + 2) - 1.25);
            } else {
                assert_eq!(v, f64::NEG_INFINITY);
            }
        }
    }

    #[test]
    fn test_finer_part_reads_lower_level() {
        // level 0 is 6x6, level 1 is 3x3, one level per octave
        let fine = ScoreMap::from_fn(6, 6, |y, x| (10 * y + x) as f64);
        let coarse = constant(3, 3, 100.0);
        let pyramid = synthetic_pyramid(&[vec![fine.clone()], vec![coarse]], 0, 0, 1);

        let mut g = Grammar::new();
        let t = g.add_terminal("t", LinearFilter::channel(1, 0).unwrap());
        let and = g.add_compositional("and", &[Part::new(t, Offset::new(0, 0)), Part::new(t, Offset::finer(1, 0))], 0.0);
        g.set_root(and);

        let mut engine = Inference::new(&g).unwrap();
        engine.propagate(&pyramid).unwrap();
        assert_eq!(engine.cache().status(and), vec![false, true]);
        let m = engine.cache().score_map(and, 1).unwrap();
        // (y, x) = (1, 1): coarse 100 + fine at (2, 3)
        assert_eq!(m.get(1, 1), 100.0 + 23.0);
        // x = 2 puts the part at column 5, still inside; row 2 -> 4 inside
        assert_eq!(m.get(2, 2), 100.0 + 45.0);
    }

    #[test]
    fn test_oversized_terminal_is_config_error() {
        let pyramid = synthetic_pyramid(&[vec![constant(3, 3, 0.0)]], 0, 0, 1);
        let mut g = Grammar::new();
        let t = g.add_terminal("big", LinearFilter::new(4, 4, 1, vec![0.0; 16], 0.0).unwrap());
        g.set_root(t);

        let mut engine = Inference::new(&g).unwrap();
        let err = engine.propagate(&pyramid).unwrap_err();
        assert!(matches!(err, InferenceError::Grammar(GrammarError::NeverValid(id)) if id == t));
        assert!(!engine.cache().is_ready());
    }

    #[test]
    fn test_failed_run_keeps_previous_generation() {
        let good = synthetic_pyramid(&[vec![constant(3, 3, 1.0)]], 0, 0, 1);
        let bad = synthetic_pyramid(&[vec![constant(3, 3, 1.0), constant(3, 3, 2.0)]], 0, 0, 1);
        let mut g = Grammar::new();
        let t = g.add_terminal("t", LinearFilter::channel(1, 0).unwrap());
        g.set_root(t);

        let mut engine = Inference::new(&g).unwrap();
        engine.propagate(&good).unwrap();
        let generation = engine.cache().generation();

        assert!(matches!(
            engine.propagate(&bad),
            Err(InferenceError::FeatureDimension { expected: 1, found: 2 })
        ));
        assert!(engine.cache().is_ready());
        assert_eq!(engine.cache().generation(), generation);
        assert_eq!(engine.cache().score(t, 0, 1, 1), Some(1.0));
    }
}
