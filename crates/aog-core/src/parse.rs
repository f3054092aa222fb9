//! Top-down backtracking into parse trees.
//!
//! Starting from a root anchor, every node re-derives the choice that
//! produced its cached score: the attaining child of an OR node, the forced
//! anchors of AND parts, and the displacement the distance transform picked
//! for a deformed part. Nodes are expanded breadth-first, so the tree is a
//! flat arena in that order with the root at index 0.

use crate::Inference;
use crate::error::{InferenceError, Result};
use crate::grammar::{NodeId, NodeKind, Part};
use crate::propagate::{child_cell, child_level};
use crate::select::{BoundingBox, best_child};
use std::collections::VecDeque;

/// A cell of a pyramid level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Anchor {
    /// Pyramid level.
    pub level: usize,
    /// Column.
    pub x: usize,
    /// Row.
    pub y: usize,
}

/// One instantiated grammar node.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseNode {
    /// Grammar node.
    pub node: NodeId,
    /// Where the node is instantiated.
    pub anchor: Anchor,
    /// Subtree score, without loss when parsed with loss.
    pub score: f64,
    /// Loss carried by this node, zero without loss.
    pub loss: f64,
    /// Displacement `(dx, dy)` from the nominal cell, set on deformed parts.
    pub displacement: Option<[i32; 2]>,
    /// Window in image pixels.
    pub bbox: BoundingBox,
    /// Indices of the children in [`ParseTree::nodes`].
    pub children: Vec<usize>,
}

/// A parse in breadth-first order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParseTree {
    nodes: Vec<ParseNode>,
}

impl ParseTree {
    /// The root node.
    ///
    /// # Panics
    /// Panics if the tree is empty; trees built by [`Inference::parse`] never are.
    pub fn root(&self) -> &ParseNode {
        &self.nodes[0]
    }

    /// All nodes, breadth-first.
    pub fn nodes(&self) -> &[ParseNode] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a tree without nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of node `index`.
    pub fn children(&self, index: usize) -> impl Iterator<Item = &ParseNode> + '_ {
        self.nodes[index].children.iter().map(|&c| &self.nodes[c])
    }

    /// Sum of the loss over every node.
    pub fn total_loss(&self) -> f64 {
        self.nodes.iter().map(|n| n.loss).sum()
    }

    /// Root score.
    pub fn score(&self) -> f64 {
        self.nodes.first().map_or(f64::NEG_INFINITY, |n| n.score)
    }
}

impl Inference<'_> {
    /// Backtrack the root at `anchor` into a parse tree.
    ///
    /// With `with_loss`, nodes carrying a loss overlay report it and their
    /// score excludes it.
    pub fn parse(&self, anchor: &Anchor, with_loss: bool) -> Result<ParseTree> {
        let _span = tracing::trace_span!("parse", level = anchor.level, x = anchor.x, y = anchor.y).entered();
        self.ensure_ready()?;
        let invalid = |a: &Anchor| InferenceError::InvalidAnchor {
            level: a.level,
            x: a.x,
            y: a.y,
        };

        let root = self.root();
        match self.cache().score(root, anchor.level, anchor.y, anchor.x) {
            Some(v) if v != f64::NEG_INFINITY => {}
            _ => return Err(invalid(anchor)),
        }

        let mut nodes = vec![self.parse_node(root, *anchor, None, with_loss)?];
        let mut queue = VecDeque::from([0usize]);

        while let Some(index) = queue.pop_front() {
            let (id, at) = (nodes[index].node, nodes[index].anchor);
            let mut expanded = Vec::new();
            match &self.grammar().node(id).kind {
                NodeKind::Terminal { .. } => {}
                NodeKind::Switching { children } => {
                    let child = best_child(self, children, &at).ok_or_else(|| invalid(&at))?;
                    expanded.push((child, at, None));
                }
                NodeKind::Compositional { parts, .. } => {
                    for part in parts {
                        expanded.push((part.child, self.part_anchor(part, &at)?, None));
                    }
                }
                NodeKind::Deformable {
                    parts,
                    deformed,
                    shift,
                    ..
                } => {
                    for (i, part) in parts.iter().enumerate() {
                        let nominal = self.part_anchor(part, &at)?;
                        if i == *deformed {
                            let (moved, delta) = self.displaced(id, &at, nominal, *shift)?;
                            expanded.push((part.child, moved, Some(delta)));
                        } else {
                            expanded.push((part.child, nominal, None));
                        }
                    }
                }
            }

            for (child, child_anchor, displacement) in expanded {
                let next = nodes.len();
                nodes.push(self.parse_node(child, child_anchor, displacement, with_loss)?);
                nodes[index].children.push(next);
                queue.push_back(next);
            }
        }

        Ok(ParseTree { nodes })
    }

    fn parse_node(&self, node: NodeId, anchor: Anchor, displacement: Option<[i32; 2]>, with_loss: bool) -> Result<ParseNode> {
        let cache = self.cache();
        let cached = cache
            .score(node, anchor.level, anchor.y, anchor.x)
            .ok_or(InferenceError::InvalidAnchor {
                level: anchor.level,
                x: anchor.x,
                y: anchor.y,
            })?;
        let loss = if with_loss {
            cache
                .loss_map(node, anchor.level)
                .map_or(0.0, |m| m.get(anchor.y, anchor.x))
        } else {
            0.0
        };
        Ok(ParseNode {
            node,
            anchor,
            score: cached - loss,
            loss,
            displacement,
            bbox: self.window_of(node, &anchor),
            children: Vec::new(),
        })
    }

    /// Forced anchor of `part` under a parent anchored at `at`.
    fn part_anchor(&self, part: &Part, at: &Anchor) -> Result<Anchor> {
        let invalid = || InferenceError::InvalidAnchor {
            level: at.level,
            x: at.x,
            y: at.y,
        };
        let level = child_level(at.level, part.offset, self.cache().interval()).ok_or_else(invalid)?;
        let (cy, cx) = child_cell(at.y, at.x, part.offset);
        let y = usize::try_from(cy).map_err(|_| invalid())?;
        let x = usize::try_from(cx).map_err(|_| invalid())?;
        Ok(Anchor { level, x, y })
    }

    /// Move a deformed part from its nominal anchor by the cached displacement.
    #[allow(clippy::cast_possible_wrap)]
    fn displaced(&self, node: NodeId, at: &Anchor, nominal: Anchor, shift: i32) -> Result<(Anchor, [i32; 2])> {
        let invalid = || InferenceError::InvalidAnchor {
            level: at.level,
            x: at.x,
            y: at.y,
        };
        let disp = self.cache().displacement(node, at.level).ok_or_else(invalid)?;
        let sx = disp
            .dx
            .get_checked(nominal.y as i64, nominal.x as i64)
            .ok_or_else(invalid)?;
        let sy = disp
            .dy
            .get_checked(nominal.y as i64, nominal.x as i64)
            .ok_or_else(invalid)?;
        let (dx, dy) = (sx - shift, sy - shift);
        let x = usize::try_from(nominal.x as i64 + i64::from(dx)).map_err(|_| invalid())?;
        let y = usize::try_from(nominal.y as i64 + i64::from(dy)).map_err(|_| invalid())?;
        Ok((
            Anchor {
                level: nominal.level,
                x,
                y,
            },
            [dx, dy],
        ))
    }
}
