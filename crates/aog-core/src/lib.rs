//! Core inference logic for AND-OR grammar models.
//!
//! An AND-OR grammar describes an object as alternatives (OR nodes) of
//! compositions (AND nodes) of parts, down to terminal appearance templates.
//! This crate evaluates such a grammar over a multi-scale feature pyramid and
//! turns the best-scoring anchors into parse trees.
//!
//! # Architecture Overview
//!
//! 1. **Score propagation** ([`propagate`]):
//!    - Post-order dynamic programming over the grammar arena.
//!    - Level-parallel terminal responses and rigid combinations with `rayon`.
//!    - Multiversion SIMD kernels for row max/add.
//!
//! 2. **Deformation** ([`dt`]):
//!    - O(n) generalized distance transform per scanline.
//!    - Scratch buffers from a reusable `bumpalo` arena.
//!
//! 3. **Selection** ([`select`]):
//!    - Threshold, stable descending sort, greedy duplicate suppression.
//!
//! 4. **Parsing** ([`parse`]):
//!    - Breadth-first backtracking through the cached maps.
//!
//! 5. **Loss augmentation** ([`loss`]):
//!    - Overlap maps, output inhibition, margin injection and scoped restore.
//!
//! # Configuration
//!
//! The engine supports two levels of configuration:
//! - [`config::InferenceConfig`]: Engine-level settings (immutable after construction)
//! - [`config::DetectOptions`]: Per-call selection options
//!
//! # Example
//!
//! ```
//! use aog_core::{Inference, config::DetectOptions};
//! use aog_core::filter::LinearFilter;
//! use aog_core::grammar::{Deformation, Grammar, Offset, Part};
//! use aog_core::parse::Anchor;
//! use aog_core::pyramid::{FeatureLevel, FeaturePyramid};
//!
//! // One movable part under an OR root
//! let mut grammar = Grammar::new();
//! let part = grammar.add_terminal("part", LinearFilter::channel(1, 0)?);
//! let object = grammar.add_deformable(
//!     "object",
//!     &[Part::new(part, Offset::new(0, 0))],
//!     0,
//!     Deformation::quadratic(0.5),
//!     0,
//!     0.0,
//! );
//! let root = grammar.add_switching("root", &[object]);
//! grammar.set_root(root);
//!
//! // A single 8x8 level with one strong cell
//! let mut features = vec![0.0f32; 64];
//! features[3 * 8 + 3] = 3.0;
//! let level = FeatureLevel::new(8, 8, 1, 4.0, features)?;
//! let pyramid = FeaturePyramid::new(vec![level], 0, 0, 1)?;
//!
//! let mut engine = Inference::new(&grammar)?;
//! let detections = engine.detect(&pyramid, &DetectOptions::with_threshold(2.6))?;
//! assert_eq!(detections.len(), 1);
//! assert_eq!(detections[0].candidate.anchor, Anchor { level: 0, x: 3, y: 3 });
//! # Ok::<(), aog_core::InferenceError>(())
//! ```

/// Per-node, per-level score map storage.
pub mod cache;
/// Configuration types for the inference engine.
pub mod config;
/// Generalized distance transform.
pub mod dt;
/// Error types.
pub mod error;
/// Terminal appearance models.
pub mod filter;
/// Grammar arena, node kinds and traversal orders.
pub mod grammar;
/// Dense 2D grids.
pub mod grid;
/// Loss-augmented inference.
pub mod loss;
/// Backtracking into parse trees.
pub mod parse;
/// Bottom-up score propagation.
pub mod propagate;
/// Feature pyramid input.
pub mod pyramid;
/// Candidate selection and duplicate suppression.
pub mod select;
/// Utilities for testing and synthetic data generation.
pub mod test_utils;

pub use crate::config::{DetectOptions, InferenceConfig, LossKind, OverlapMetric};
pub use crate::error::{GrammarError, InferenceError, Result};
pub use crate::grammar::{Grammar, NodeId};
pub use crate::parse::{Anchor, ParseTree};
pub use crate::pyramid::FeaturePyramid;
pub use crate::select::{BoundingBox, Candidate, Selection};

use crate::cache::ScoreCache;
use crate::grammar::TraversalOrder;
use bumpalo::Bump;
use std::time::Instant;

/// A selected candidate together with its parse.
#[derive(Clone, Debug)]
pub struct Detection {
    /// The selected anchor and its window.
    pub candidate: Candidate,
    /// The backtracked parse tree.
    pub parse: ParseTree,
}

/// Statistics for the inference pipeline stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct InferenceStats {
    /// Time taken for score propagation in milliseconds.
    pub propagation_ms: f64,
    /// Time taken for thresholding and suppression in milliseconds.
    pub selection_ms: f64,
    /// Time taken for backtracking in milliseconds.
    pub parsing_ms: f64,
    /// Total pipeline time in milliseconds.
    pub total_ms: f64,
    /// Number of pyramid levels where the root is valid.
    pub num_valid_levels: usize,
    /// Number of root cells above the threshold.
    pub num_above_threshold: usize,
    /// Number of final detections.
    pub num_detections: usize,
}

/// Full result of an extended detection call.
#[derive(Clone, Debug)]
pub struct ExtendedDetections {
    /// Parsed detections, unsuppressed.
    pub detections: Vec<Detection>,
    /// Every above-threshold candidate, best first.
    pub raw: Vec<Candidate>,
    /// Pipeline statistics.
    pub stats: InferenceStats,
}

/// The main entry point for grammar inference.
///
/// The engine borrows a validated grammar, owns the score cache of the last
/// propagation run and a reusable scratch arena. It is configured at
/// construction time via [`InferenceConfig`].
pub struct Inference<'g> {
    grammar: &'g Grammar,
    config: InferenceConfig,
    root: NodeId,
    objects: Vec<NodeId>,
    order: TraversalOrder,
    extents: Vec<(usize, usize)>,
    cache: ScoreCache,
    arena: Bump,
}

impl<'g> Inference<'g> {
    /// Create an engine with default configuration.
    ///
    /// Fails when the grammar is malformed.
    pub fn new(grammar: &'g Grammar) -> Result<Self> {
        Self::with_config(grammar, InferenceConfig::default())
    }

    /// Create an engine with custom configuration.
    pub fn with_config(grammar: &'g Grammar, config: InferenceConfig) -> Result<Self> {
        let order = grammar.traversal()?;
        let root = grammar.root().ok_or(GrammarError::MissingRoot)?;
        let extents = grammar.extents(&order);
        tracing::debug!(nodes = order.postorder.len(), root = %root, "grammar validated");
        Ok(Self {
            grammar,
            config,
            root,
            objects: grammar.object_nodes(),
            order,
            extents,
            cache: ScoreCache::default(),
            arena: Bump::new(),
        })
    }

    /// Get the engine configuration.
    pub fn config(&self) -> InferenceConfig {
        self.config
    }

    /// The grammar this engine evaluates.
    pub fn grammar(&self) -> &'g Grammar {
        self.grammar
    }

    /// The start symbol.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Nodes whose windows define detections.
    pub fn object_nodes(&self) -> &[NodeId] {
        &self.objects
    }

    /// Traversal orders over the reachable nodes.
    pub fn order(&self) -> &TraversalOrder {
        &self.order
    }

    /// Receptive field `(rows, cols)` of every node.
    pub fn extents(&self) -> &[(usize, usize)] {
        &self.extents
    }

    /// Score maps of the last propagation run.
    pub fn cache(&self) -> &ScoreCache {
        &self.cache
    }

    /// Drop every score map. Later reads fail with [`InferenceError::StaleCache`].
    pub fn release(&mut self) {
        self.cache.release();
        self.arena.reset();
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.cache.is_ready() {
            Ok(())
        } else {
            Err(InferenceError::StaleCache)
        }
    }

    /// Propagate, select with `options`, and parse every kept candidate.
    pub fn detect(&mut self, pyramid: &FeaturePyramid, options: &DetectOptions) -> Result<Vec<Detection>> {
        self.detect_with_stats(pyramid, options).map(|(d, _)| d)
    }

    /// Detection with detailed timing statistics.
    pub fn detect_with_stats(
        &mut self,
        pyramid: &FeaturePyramid,
        options: &DetectOptions,
    ) -> Result<(Vec<Detection>, InferenceStats)> {
        let res = self.detect_internal(pyramid, options)?;
        Ok((res.detections, res.stats))
    }

    /// Unsuppressed detection above `threshold`, also returning every raw
    /// above-threshold candidate.
    pub fn detect_ext(&mut self, pyramid: &FeaturePyramid, threshold: f64) -> Result<ExtendedDetections> {
        self.detect_internal(pyramid, &DetectOptions::extended(threshold))
    }

    fn detect_internal(&mut self, pyramid: &FeaturePyramid, options: &DetectOptions) -> Result<ExtendedDetections> {
        let mut stats = InferenceStats::default();
        let start_total = Instant::now();

        let start_prop = Instant::now();
        self.propagate(pyramid)?;
        stats.propagation_ms = start_prop.elapsed().as_secs_f64() * 1000.0;
        stats.num_valid_levels = self.cache.status(self.root).iter().filter(|v| **v).count();

        let start_select = Instant::now();
        let selection = self.select_candidates(options)?;
        stats.selection_ms = start_select.elapsed().as_secs_f64() * 1000.0;
        stats.num_above_threshold = selection.num_above_threshold;

        let start_parse = Instant::now();
        let detections = {
            let _span = tracing::info_span!("parse_candidates", count = selection.candidates.len()).entered();
            selection
                .candidates
                .into_iter()
                .map(|candidate| {
                    let parse = self.parse(&candidate.anchor, false)?;
                    Ok(Detection { candidate, parse })
                })
                .collect::<Result<Vec<_>>>()?
        };
        stats.parsing_ms = start_parse.elapsed().as_secs_f64() * 1000.0;
        stats.num_detections = detections.len();
        stats.total_ms = start_total.elapsed().as_secs_f64() * 1000.0;

        Ok(ExtendedDetections {
            detections,
            raw: selection.raw,
            stats,
        })
    }
}
