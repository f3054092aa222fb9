//! Candidate selection and duplicate suppression.
//!
//! Every root cell above the threshold is a detection. Detections are
//! sorted by descending score (stable, so ties keep level/row/column order)
//! and, in suppressed mode, greedily filtered: a detection survives only
//! if it overlaps no already kept detection by more than `nms_overlap`.

use crate::Inference;
use crate::config::{DetectOptions, OverlapMetric};
use crate::error::Result;
use crate::grammar::{NodeId, NodeKind};
use crate::parse::Anchor;
use crate::pyramid::LevelGeometry;

/// Axis-aligned window in image pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

impl BoundingBox {
    /// Create a box from its top-left corner and size.
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Area, zero for degenerate boxes.
    #[inline]
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Area of the intersection with `other`.
    #[inline]
    pub fn intersection(&self, other: &Self) -> f64 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
    }

    /// Intersection over union.
    pub fn iou(&self, other: &Self) -> f64 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Overlap ratio under `metric`.
    pub fn overlap(&self, other: &Self, metric: OverlapMetric) -> f64 {
        match metric {
            OverlapMetric::Union => self.iou(other),
            OverlapMetric::Smaller => {
                let smaller = self.area().min(other.area());
                if smaller <= 0.0 {
                    0.0
                } else {
                    self.intersection(other) / smaller
                }
            }
        }
    }
}

/// Image-space window of a node with receptive field `extent` anchored at
/// cell `(x, y)` of a level with geometry `geom`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn window(extent: (usize, usize), x: usize, y: usize, geom: LevelGeometry, pad: (usize, usize)) -> BoundingBox {
    let (rows, cols) = extent;
    BoundingBox {
        x: (x as f64 - pad.0 as f64) * geom.scale,
        y: (y as f64 - pad.1 as f64) * geom.scale,
        width: cols as f64 * geom.scale,
        height: rows as f64 * geom.scale,
    }
}

/// A detection: a root anchor above the threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    /// Root anchor.
    pub anchor: Anchor,
    /// Root score at the anchor.
    pub score: f64,
    /// Window of the object node in image pixels.
    pub bbox: BoundingBox,
    /// Object node defining the window.
    pub object: NodeId,
}

/// Output of [`Inference::select_candidates`].
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// Kept candidates, best first.
    pub candidates: Vec<Candidate>,
    /// Every above-threshold candidate, best first. Filled only with
    /// [`DetectOptions::keep_raw`].
    pub raw: Vec<Candidate>,
    /// Number of root cells above the threshold.
    pub num_above_threshold: usize,
}

impl Inference<'_> {
    /// Pick detections from the root score maps.
    pub fn select_candidates(&self, options: &DetectOptions) -> Result<Selection> {
        let _span = tracing::info_span!("select", threshold = options.threshold).entered();
        self.ensure_ready()?;
        let root = self.root();

        let mut detections = Vec::new();
        for l in 0..self.cache().num_levels() {
            let Some(map) = self.cache().score_map(root, l) else {
                continue;
            };
            for (y, x, score) in map.cells() {
                // the second test only matters for a -inf threshold
                if score > options.threshold && score != f64::NEG_INFINITY {
                    let anchor = Anchor { level: l, x, y };
                    let object = self.object_at(&anchor);
                    detections.push(Candidate {
                        anchor,
                        score,
                        bbox: self.window_of(object, &anchor),
                        object,
                    });
                }
            }
        }
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        let num_above_threshold = detections.len();
        let cap = options.max_detections.unwrap_or(usize::MAX);

        let candidates = if options.suppress {
            suppress(&detections, self.config().nms_overlap, self.config().overlap_metric, cap)
        } else {
            detections.iter().take(cap).copied().collect()
        };
        tracing::debug!(
            above = num_above_threshold,
            kept = candidates.len(),
            suppressed = options.suppress,
            "selection done"
        );

        Ok(Selection {
            candidates,
            raw: if options.keep_raw { detections } else { Vec::new() },
            num_above_threshold,
        })
    }

    /// Object node whose window describes a root anchor: the first root
    /// child attaining the root score when the root is an OR node.
    pub(crate) fn object_at(&self, anchor: &Anchor) -> NodeId {
        let root = self.root();
        match &self.grammar().node(root).kind {
            NodeKind::Switching { children } => {
                best_child(self, children, anchor).unwrap_or(root)
            }
            _ => root,
        }
    }

    /// Image-space window of `node` anchored at `anchor`.
    pub(crate) fn window_of(&self, node: NodeId, anchor: &Anchor) -> BoundingBox {
        let cache = self.cache();
        window(
            self.extents()[node.index()],
            anchor.x,
            anchor.y,
            cache.geometry(anchor.level),
            cache.pad(),
        )
    }
}

/// First child with the highest finite score at `anchor`.
pub(crate) fn best_child(engine: &Inference<'_>, children: &[NodeId], anchor: &Anchor) -> Option<NodeId> {
    let mut best: Option<(NodeId, f64)> = None;
    for &child in children {
        let Some(v) = engine.cache().score(child, anchor.level, anchor.y, anchor.x) else {
            continue;
        };
        if v != f64::NEG_INFINITY && best.is_none_or(|(_, b)| v > b) {
            best = Some((child, v));
        }
    }
    best.map(|(id, _)| id)
}

/// Greedy suppression over candidates sorted best first.
fn suppress(sorted: &[Candidate], max_overlap: f64, metric: OverlapMetric, cap: usize) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in sorted {
        if kept.len() >= cap {
            break;
        }
        if kept
            .iter()
            .all(|k| k.bbox.overlap(&cand.bbox, metric) <= max_overlap)
        {
            kept.push(*cand);
        }
    }
    kept
}
