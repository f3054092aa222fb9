//! Per-node, per-level score map storage.
//!
//! The cache is a dense table indexed by [`NodeId::index`]. Each entry keeps
//! the working score maps (`None` marks an invalid level), an optional
//! pristine snapshot taken before a destructive mutation, the displacement
//! maps of deformable nodes, and the loss overlay of loss-augmented runs.

use crate::dt::Transformed;
use crate::grammar::NodeId;
use crate::grid::{Grid, ScoreMap};
use crate::pyramid::LevelGeometry;

/// Displacement grids chosen by the distance transform at one level.
#[derive(Clone, Debug, PartialEq)]
pub struct Displacement {
    /// Stored column displacement.
    pub dx: Grid<i32>,
    /// Stored row displacement.
    pub dy: Grid<i32>,
}

impl From<Transformed> for Displacement {
    fn from(t: Transformed) -> Self {
        Self { dx: t.dx, dy: t.dy }
    }
}

/// Score maps of one node together with the loss overlay they include.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeState {
    scores: Vec<Option<ScoreMap>>,
    loss: Option<Vec<Option<ScoreMap>>>,
}

/// Full mutable state of one node, including its snapshot slot.
#[derive(Clone, Debug)]
pub(crate) struct Checkpoint {
    node: NodeId,
    state: NodeState,
    pristine: Option<NodeState>,
}

/// Everything cached for one node.
#[derive(Clone, Debug, Default)]
pub struct NodeMaps {
    state: NodeState,
    pristine: Option<NodeState>,
    displacements: Vec<Option<Displacement>>,
}

/// Score maps of one propagation run.
#[derive(Clone, Debug, Default)]
pub struct ScoreCache {
    nodes: Vec<NodeMaps>,
    geometry: Vec<LevelGeometry>,
    pad: (usize, usize),
    interval: usize,
    generation: u64,
    ready: bool,
}

impl ScoreCache {
    /// Empty generation sized for `num_nodes` nodes over the given levels.
    pub(crate) fn begin(
        num_nodes: usize,
        geometry: Vec<LevelGeometry>,
        pad: (usize, usize),
        interval: usize,
        generation: u64,
    ) -> Self {
        Self {
            nodes: vec![NodeMaps::default(); num_nodes],
            geometry,
            pad,
            interval,
            generation,
            ready: false,
        }
    }

    /// Mark the generation complete.
    pub(crate) fn finish(&mut self) {
        self.ready = true;
    }

    /// Drop every map. Later reads report a stale cache.
    pub fn release(&mut self) {
        let generation = self.generation;
        *self = Self {
            generation,
            ..Self::default()
        };
    }

    /// True once a propagation run completed and nothing released it.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of completed propagation runs so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of pyramid levels covered.
    pub fn num_levels(&self) -> usize {
        self.geometry.len()
    }

    /// Geometry of level `l`.
    pub fn geometry(&self, l: usize) -> LevelGeometry {
        self.geometry[l]
    }

    /// Padding margin of the pyramid the maps were computed on.
    pub fn pad(&self) -> (usize, usize) {
        self.pad
    }

    /// Levels per octave of that pyramid.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Per-level maps of `node`; empty when the node was never visited.
    pub fn scores(&self, node: NodeId) -> &[Option<ScoreMap>] {
        self.nodes
            .get(node.index())
            .map(|n| n.state.scores.as_slice())
            .unwrap_or_default()
    }

    /// Map of `node` at level `l`, if valid.
    pub fn score_map(&self, node: NodeId, l: usize) -> Option<&ScoreMap> {
        self.scores(node).get(l).and_then(Option::as_ref)
    }

    /// Validity flag of every level of `node`.
    pub fn status(&self, node: NodeId) -> Vec<bool> {
        self.scores(node).iter().map(Option::is_some).collect()
    }

    /// Whether `node` holds a map at level `l`.
    pub fn is_valid(&self, node: NodeId, l: usize) -> bool {
        self.score_map(node, l).is_some()
    }

    /// Score of `node` at `(l, y, x)`, `None` for invalid levels or cells.
    pub fn score(&self, node: NodeId, l: usize, y: usize, x: usize) -> Option<f64> {
        self.score_map(node, l)
            .and_then(|m| m.get_checked(y as i64, x as i64))
    }

    pub(crate) fn set_scores(&mut self, node: NodeId, maps: Vec<Option<ScoreMap>>) {
        self.nodes[node.index()].state.scores = maps;
    }

    pub(crate) fn scores_mut(&mut self, node: NodeId) -> &mut [Option<ScoreMap>] {
        &mut self.nodes[node.index()].state.scores
    }

    /// Displacement maps of a deformable `node` at level `l`.
    pub fn displacement(&self, node: NodeId, l: usize) -> Option<&Displacement> {
        self.nodes
            .get(node.index())
            .and_then(|n| n.displacements.get(l))
            .and_then(Option::as_ref)
    }

    pub(crate) fn set_displacements(&mut self, node: NodeId, maps: Vec<Option<Displacement>>) {
        self.nodes[node.index()].displacements = maps;
    }

    /// Loss overlay of `node` at level `l`.
    pub fn loss_map(&self, node: NodeId, l: usize) -> Option<&ScoreMap> {
        self.nodes
            .get(node.index())
            .and_then(|n| n.state.loss.as_ref())
            .and_then(|levels| levels.get(l))
            .and_then(Option::as_ref)
    }

    pub(crate) fn set_loss(&mut self, node: NodeId, maps: Vec<Option<ScoreMap>>) {
        self.nodes[node.index()].state.loss = Some(maps);
    }

    /// Snapshot the working maps and loss overlay of `node`. An existing
    /// snapshot is kept, so repeated mutations still recover to the first
    /// pristine state.
    pub(crate) fn backup(&mut self, node: NodeId) {
        let entry = &mut self.nodes[node.index()];
        if entry.pristine.is_none() {
            entry.pristine = Some(entry.state.clone());
        }
    }

    /// Copy of everything [`Self::restore`] puts back for `node`.
    pub(crate) fn checkpoint(&self, node: NodeId) -> Checkpoint {
        let entry = &self.nodes[node.index()];
        Checkpoint {
            node,
            state: entry.state.clone(),
            pristine: entry.pristine.clone(),
        }
    }

    /// Put `checkpoint` back, snapshot slot included.
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        let Some(entry) = self.nodes.get_mut(checkpoint.node.index()) else {
            return;
        };
        entry.state = checkpoint.state;
        entry.pristine = checkpoint.pristine;
    }

    /// Whether any node holds a snapshot.
    pub fn has_backup(&self) -> bool {
        self.nodes.iter().any(|n| n.pristine.is_some())
    }

    /// Restore every snapshot, loss overlays included. Returns the number of
    /// nodes restored.
    pub(crate) fn recover_all(&mut self) -> usize {
        let mut restored = 0;
        for entry in &mut self.nodes {
            if let Some(pristine) = entry.pristine.take() {
                entry.state = pristine;
                restored += 1;
            }
        }
        restored
    }

    /// Forget every snapshot, keeping the working maps.
    pub fn discard_backups(&mut self) {
        for entry in &mut self.nodes {
            entry.pristine = None;
        }
    }
}
