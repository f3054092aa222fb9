//! Loss-augmented inference.
//!
//! Structured learning needs the highest-scoring *wrong* answer as well as
//! the best parse of each annotated instance. Both are obtained by editing
//! the object-node score maps in place: [`Inference::inhibit_output`] keeps
//! only windows that overlap a given box, [`Inference::apply_loss`] adds a
//! margin loss that rewards mislocalized windows. Edited nodes can be
//! snapshotted first and restored with [`Inference::recover`], or scoped
//! with the [`ScoreGuard`] returned by [`Inference::protect`].

use crate::Inference;
use crate::cache::Checkpoint;
use crate::config::{DetectOptions, LossKind};
use crate::error::{InferenceError, Result};
use crate::grammar::{NodeId, NodeKind};
use crate::grid::ScoreMap;
use crate::parse::ParseTree;
use crate::propagate::switching_level;
use crate::pyramid::FeaturePyramid;
use crate::select::{BoundingBox, window};
use rayon::prelude::*;
use std::ops::{Deref, DerefMut};

/// Overlap between every object-node window and every annotated box.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlapMaps {
    nodes: Vec<NodeId>,
    /// Indexed `[node][level][box]`.
    maps: Vec<Vec<Vec<ScoreMap>>>,
    valid_levels: Vec<bool>,
    box_count: usize,
}

impl OverlapMaps {
    /// Assemble overlap maps from precomputed grids indexed
    /// `[node][level][box]`, one outer entry per node in `nodes`.
    pub fn from_parts(nodes: Vec<NodeId>, maps: Vec<Vec<Vec<ScoreMap>>>, valid_levels: Vec<bool>) -> Result<Self> {
        if maps.len() != nodes.len() {
            return Err(InferenceError::OverlapMismatch);
        }
        let box_count = maps
            .first()
            .and_then(|levels| levels.first())
            .map_or(0, Vec::len);
        let consistent = maps
            .iter()
            .all(|levels| levels.len() == valid_levels.len() && levels.iter().all(|b| b.len() == box_count));
        if !consistent {
            return Err(InferenceError::OverlapMismatch);
        }
        Ok(Self {
            nodes,
            maps,
            valid_levels,
            box_count,
        })
    }

    /// Object nodes covered, in the order of the outer index.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of annotated boxes.
    pub fn box_count(&self) -> usize {
        self.box_count
    }

    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.valid_levels.len()
    }

    /// Whether level `l` holds any window reaching the overlap threshold.
    pub fn is_level_valid(&self, l: usize) -> bool {
        self.valid_levels.get(l).copied().unwrap_or(false)
    }

    /// Per-level validity.
    pub fn valid_levels(&self) -> &[bool] {
        &self.valid_levels
    }

    /// Overlap grid of the `k`-th node at level `l` with box `b`.
    pub fn map(&self, k: usize, l: usize, b: usize) -> Option<&ScoreMap> {
        self.maps.get(k)?.get(l)?.get(b)
    }
}

/// Loss context of [`Inference::apply_loss`].
#[derive(Clone, Copy, Debug)]
pub struct LossSpec<'a> {
    /// Window/box overlaps.
    pub overlap: &'a OverlapMaps,
    /// Box whose instance is searched for.
    pub box_index: usize,
    /// Number of boxes taking part; boxes at or above it are ignored.
    pub box_count: usize,
}

impl<'a> LossSpec<'a> {
    /// Loss context for `box_index` among every box of `overlap`.
    pub fn new(overlap: &'a OverlapMaps, box_index: usize) -> Self {
        Self {
            overlap,
            box_index,
            box_count: overlap.box_count(),
        }
    }
}

impl<'g> Inference<'g> {
    /// Overlap of every object-node window with every box, on every level.
    ///
    /// A level is valid when some window reaches `overlap_thr` with some box.
    pub fn compute_overlap(&self, boxes: &[BoundingBox], pyramid: &FeaturePyramid, overlap_thr: f64) -> OverlapMaps {
        let _span = tracing::info_span!("compute_overlap", boxes = boxes.len()).entered();
        let geometry = pyramid.geometry();
        let pad = pyramid.pad();
        let nodes = self.object_nodes().to_vec();

        let maps: Vec<Vec<Vec<ScoreMap>>> = nodes
            .iter()
            .map(|&node| {
                let extent = self.extents()[node.index()];
                geometry
                    .par_iter()
                    .map(|&geom| {
                        boxes
                            .iter()
                            .map(|b| {
                                ScoreMap::from_fn(geom.rows, geom.cols, |y, x| window(extent, x, y, geom, pad).iou(b))
                            })
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .collect();

        let valid_levels = (0..geometry.len())
            .map(|l| {
                maps.iter()
                    .any(|levels| levels[l].iter().any(|m| m.as_slice().iter().any(|&v| v >= overlap_thr)))
            })
            .collect();

        OverlapMaps {
            nodes,
            maps,
            valid_levels,
            box_count: boxes.len(),
        }
    }

    /// Validate `overlap` against the current cache before any map is touched.
    fn check_overlap(&self, overlap: &OverlapMaps, box_index: usize, box_count: usize) -> Result<()> {
        self.ensure_ready()?;
        if overlap.nodes != self.object_nodes() || overlap.num_levels() != self.cache().num_levels() {
            return Err(InferenceError::OverlapMismatch);
        }
        let shapes_match = overlap.maps.iter().all(|levels| {
            levels.iter().enumerate().all(|(l, grids)| {
                let geom = self.cache().geometry(l);
                grids.iter().all(|m| (m.rows(), m.cols()) == (geom.rows, geom.cols))
            })
        });
        if !shapes_match {
            return Err(InferenceError::OverlapMismatch);
        }
        if box_count > overlap.box_count() {
            return Err(InferenceError::BoxIndex {
                index: box_count,
                count: overlap.box_count(),
            });
        }
        if box_index >= box_count {
            return Err(InferenceError::BoxIndex {
                index: box_index,
                count: box_count,
            });
        }
        Ok(())
    }

    /// Keep only object-node cells whose window overlaps box `box_index` by
    /// at least `thr`; every other cell becomes unreachable.
    pub fn inhibit_output(&mut self, overlap: &OverlapMaps, box_index: usize, thr: f64, backup: bool) -> Result<()> {
        let _span = tracing::info_span!("inhibit_output", box_index, thr).entered();
        self.check_overlap(overlap, box_index, overlap.box_count())?;

        let mut inhibited = 0usize;
        for (k, &node) in overlap.nodes.iter().enumerate() {
            if backup {
                self.cache.backup(node);
            }
            for (l, slot) in self.cache.scores_mut(node).iter_mut().enumerate() {
                let Some(map) = slot.as_mut() else {
                    continue;
                };
                let ov = &overlap.maps[k][l][box_index];
                for (v, &o) in map.as_mut_slice().iter_mut().zip(ov.as_slice()) {
                    if o < thr {
                        *v = f64::NEG_INFINITY;
                        inhibited += 1;
                    }
                }
            }
        }
        tracing::debug!(inhibited, "cells inhibited");

        self.refresh_root(backup);
        Ok(())
    }

    /// Add the margin loss for box `spec.box_index` to the object-node maps.
    ///
    /// Per cell the loss is `0` when the window overlaps the box by at least
    /// `fg_overlap`, `-inf` when it overlaps another participating box by at
    /// least `bg_overlap`, and otherwise `1` (or `1 - overlap` with
    /// [`LossKind::Overlap`]).
    pub fn apply_loss(&mut self, spec: &LossSpec<'_>, backup: bool) -> Result<()> {
        let _span = tracing::info_span!("apply_loss", box_index = spec.box_index).entered();
        let overlap = spec.overlap;
        self.check_overlap(overlap, spec.box_index, spec.box_count)?;
        let config = self.config();

        for (k, &node) in overlap.nodes.iter().enumerate() {
            if backup {
                self.cache.backup(node);
            }
            let mut losses = Vec::with_capacity(self.cache.num_levels());
            for (l, slot) in self.cache.scores_mut(node).iter_mut().enumerate() {
                let Some(map) = slot.as_mut() else {
                    losses.push(None);
                    continue;
                };
                let grids = &overlap.maps[k][l];
                let own = &grids[spec.box_index];
                let others: Vec<&ScoreMap> = (0..spec.box_count)
                    .filter(|&j| j != spec.box_index)
                    .map(|j| &grids[j])
                    .collect();

                let loss = ScoreMap::from_fn(map.rows(), map.cols(), |y, x| {
                    let ov = own.get(y, x);
                    if ov >= config.fg_overlap {
                        0.0
                    } else if others.iter().any(|m| m.get(y, x) >= config.bg_overlap) {
                        f64::NEG_INFINITY
                    } else {
                        match config.loss_kind {
                            LossKind::ZeroOne => 1.0,
                            LossKind::Overlap => 1.0 - ov,
                        }
                    }
                });
                for (v, &d) in map.as_mut_slice().iter_mut().zip(loss.as_slice()) {
                    *v += d;
                }
                losses.push(Some(loss));
            }
            self.cache.set_loss(node, losses);
        }

        self.refresh_root(backup);
        Ok(())
    }

    /// Propagate, then add the loss of `spec` without taking a backup.
    pub fn propagate_with_loss(&mut self, pyramid: &FeaturePyramid, spec: &LossSpec<'_>) -> Result<()> {
        self.propagate(pyramid)?;
        self.apply_loss(spec, false)
    }

    /// Restore every snapshot bit-for-bit, loss overlays included.
    pub fn recover(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if !self.cache.has_backup() {
            return Err(InferenceError::MissingBackup);
        }
        let restored = self.cache.recover_all();
        tracing::debug!(restored, "score maps recovered");
        Ok(())
    }

    /// Checkpoint the root and object nodes as they are now; the returned
    /// guard puts exactly that state back when dropped. Snapshots taken
    /// earlier by `backup = true` calls survive the guard.
    pub fn protect(&mut self) -> Result<ScoreGuard<'_, 'g>> {
        self.ensure_ready()?;
        let mut nodes = vec![self.root];
        nodes.extend(self.objects.iter().copied().filter(|&n| n != self.root));
        let saved = nodes.into_iter().map(|n| self.cache.checkpoint(n)).collect();
        let generation = self.cache.generation();
        Ok(ScoreGuard {
            engine: self,
            saved,
            generation,
        })
    }

    /// Best parse of the instance behind every box, searched among windows
    /// overlapping it by at least `thr`. `None` where no window qualifies.
    pub fn best_parse_per_box(&mut self, overlap: &OverlapMaps, thr: f64) -> Result<Vec<Option<ParseTree>>> {
        let _span = tracing::info_span!("best_parse_per_box", boxes = overlap.box_count()).entered();
        let top = DetectOptions::builder()
            .threshold(f64::NEG_INFINITY)
            .max_detections(1)
            .suppress(false)
            .build();

        (0..overlap.box_count())
            .map(|b| {
                let mut guard = self.protect()?;
                guard.inhibit_output(overlap, b, thr, false)?;
                let selection = guard.select_candidates(&top)?;
                selection
                    .candidates
                    .first()
                    .map(|c| guard.parse(&c.anchor, false))
                    .transpose()
            })
            .collect()
    }

    /// Recompute an OR root from its (edited) children.
    fn refresh_root(&mut self, backup: bool) {
        let (grammar, root) = (self.grammar, self.root);
        let NodeKind::Switching { children } = &grammar.node(root).kind else {
            return;
        };
        if backup {
            self.cache.backup(root);
        }
        for l in 0..self.cache.num_levels() {
            if !self.cache.is_valid(root, l) {
                continue;
            }
            let map = switching_level(&self.cache, children, l, self.cache.geometry(l));
            self.cache.scores_mut(root)[l] = Some(map);
        }
    }
}

/// Scoped protection of the root and object-node maps.
///
/// Dereferences to the engine. On drop the protected nodes return to the
/// state they had in [`Inference::protect`], unless a new propagation run
/// replaced the cache in between.
pub struct ScoreGuard<'e, 'g> {
    engine: &'e mut Inference<'g>,
    saved: Vec<Checkpoint>,
    generation: u64,
}

impl<'g> Deref for ScoreGuard<'_, 'g> {
    type Target = Inference<'g>;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

impl DerefMut for ScoreGuard<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine
    }
}

impl Drop for ScoreGuard<'_, '_> {
    fn drop(&mut self) {
        let cache = &mut self.engine.cache;
        if !cache.is_ready() || cache.generation() != self.generation {
            return;
        }
        for checkpoint in self.saved.drain(..) {
            cache.restore(checkpoint);
        }
    }
}
