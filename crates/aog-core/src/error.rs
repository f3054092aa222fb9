//! Error types for grammar validation and inference.

use crate::grammar::NodeId;
use thiserror::Error;

/// A malformed grammar. Reported before any score is computed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    /// No root node was set.
    #[error("grammar has no root node")]
    MissingRoot,
    /// A node references a child id outside the arena.
    #[error("node {parent} references missing child {child}")]
    DanglingChild {
        /// The referencing node.
        parent: NodeId,
        /// The missing child id.
        child: NodeId,
    },
    /// The graph reachable from the root is not acyclic.
    #[error("cycle detected through node {0}")]
    Cycle(NodeId),
    /// A switching or composing node has an empty child list.
    #[error("node {0} has no children")]
    NoChildren(NodeId),
    /// A deformable node selects a part index it does not have.
    #[error("deformable node {node} deforms part {index} but has {len} parts")]
    DeformedIndex {
        /// The deformable node.
        node: NodeId,
        /// The requested part index.
        index: usize,
        /// Number of parts declared.
        len: usize,
    },
    /// A part offset is negative.
    #[error("node {0} places a child at a negative offset")]
    NegativeOffset(NodeId),
    /// A reachable node fits no level of the supplied pyramid.
    #[error("node {0} is valid at no pyramid level")]
    NeverValid(NodeId),
}

/// Errors surfaced by the inference engine.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The grammar is malformed, or cannot be evaluated on this pyramid.
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    /// The pyramid has no levels.
    #[error("feature pyramid has no levels")]
    EmptyPyramid,
    /// A terminal's feature dimension does not match the pyramid.
    #[error("feature dimension mismatch: filter expects {expected}, level has {found}")]
    FeatureDimension {
        /// Dimension the appearance model expects.
        expected: usize,
        /// Dimension of the pyramid level.
        found: usize,
    },
    /// A buffer does not match the requested grid shape.
    #[error("buffer of length {len} does not match a {rows}x{cols}x{depth} layout")]
    Shape {
        /// Requested rows.
        rows: usize,
        /// Requested columns.
        cols: usize,
        /// Requested values per cell.
        depth: usize,
        /// Actual buffer length.
        len: usize,
    },
    /// Score maps were requested before `propagate` or after `release`.
    #[error("score maps are stale: propagate has not run since the last release")]
    StaleCache,
    /// `recover` was called without a prior backup.
    #[error("no score map backup to recover")]
    MissingBackup,
    /// An anchor lies outside the valid score maps.
    #[error("anchor (level {level}, x {x}, y {y}) is outside the valid score maps")]
    InvalidAnchor {
        /// Pyramid level.
        level: usize,
        /// Column.
        x: usize,
        /// Row.
        y: usize,
    },
    /// A box index is out of range.
    #[error("box index {index} out of range for {count} boxes")]
    BoxIndex {
        /// Requested index.
        index: usize,
        /// Number of boxes available.
        count: usize,
    },
    /// Overlap maps were computed for a different grammar or pyramid.
    #[error("overlap maps do not match the current score maps")]
    OverlapMismatch,
}

/// Result alias for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
