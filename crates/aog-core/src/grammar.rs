//! AND-OR grammar arena.
//!
//! Nodes live in a flat arena and refer to their children by [`NodeId`], so
//! a grammar can be shared read-only by any number of engines. Validation
//! and traversal orders are computed once, when an engine is built.

use crate::error::GrammarError;
use crate::filter::Appearance;
use std::collections::VecDeque;
use std::fmt;

/// Stable identifier of a node: its index in the grammar arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    /// Id of the node stored at arena index `index`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Placement of a child relative to its parent's anchor.
///
/// The child is evaluated `ds` octaves finer (pyramid level
/// `l - ds * interval`) at cell `(x * 2^ds + dx, y * 2^ds + dy)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Offset {
    /// Column offset in child cells.
    pub dx: i32,
    /// Row offset in child cells.
    pub dy: i32,
    /// Octave shift towards finer levels.
    pub ds: u8,
}

impl Offset {
    /// Same-level offset.
    #[must_use]
    pub const fn new(dx: i32, dy: i32) -> Self {
        Self { dx, dy, ds: 0 }
    }

    /// Offset one octave finer than the parent.
    #[must_use]
    pub const fn finer(dx: i32, dy: i32) -> Self {
        Self { dx, dy, ds: 1 }
    }

    /// Resolution factor `2^ds`.
    #[inline]
    pub const fn step(self) -> i64 {
        1 << self.ds
    }
}

/// A child together with its placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Part {
    /// Child node.
    pub child: NodeId,
    /// Placement relative to the parent anchor.
    pub offset: Offset,
}

impl Part {
    /// Create a part.
    #[must_use]
    pub const fn new(child: NodeId, offset: Offset) -> Self {
        Self { child, offset }
    }
}

/// Quadratic deformation cost `ax*dx^2 + bx*dx + ay*dy^2 + by*dy`,
/// where `(dx, dy)` is the child displacement from its nominal cell.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Deformation {
    /// Quadratic coefficient along x.
    pub ax: f64,
    /// Linear coefficient along x.
    pub bx: f64,
    /// Quadratic coefficient along y.
    pub ay: f64,
    /// Linear coefficient along y.
    pub by: f64,
}

impl Deformation {
    /// Isotropic quadratic cost `a * (dx^2 + dy^2)`.
    #[must_use]
    pub const fn quadratic(a: f64) -> Self {
        Self {
            ax: a,
            bx: 0.0,
            ay: a,
            by: 0.0,
        }
    }

    /// Cost of displacement `(dx, dy)`.
    #[inline]
    pub fn cost(&self, dx: i32, dy: i32) -> f64 {
        let (dx, dy) = (f64::from(dx), f64::from(dy));
        self.ax * dx * dx + self.bx * dx + self.ay * dy * dy + self.by * dy
    }
}

/// The rule a node applies to its children.
pub enum NodeKind {
    /// Leaf scored by an appearance model.
    Terminal {
        /// Scoring capability.
        appearance: Box<dyn Appearance>,
    },
    /// OR node: best child at every anchor. Ties go to the first child.
    Switching {
        /// Alternatives, in priority order.
        children: Vec<NodeId>,
    },
    /// AND node: sum of children at fixed offsets, plus bias.
    Compositional {
        /// Children and their placements.
        parts: Vec<Part>,
        /// Constant added to every anchor.
        bias: f64,
    },
    /// AND node where `parts[deformed]` may move, at a quadratic cost.
    Deformable {
        /// Children and their nominal placements.
        parts: Vec<Part>,
        /// Index of the deformed part.
        deformed: usize,
        /// Cost coefficients.
        deformation: Deformation,
        /// Origin of the stored displacement values.
        shift: i32,
        /// Constant added to every anchor.
        bias: f64,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal { appearance } => f
                .debug_struct("Terminal")
                .field("extent", &appearance.extent())
                .finish(),
            Self::Switching { children } => f
                .debug_struct("Switching")
                .field("children", children)
                .finish(),
            Self::Compositional { parts, bias } => f
                .debug_struct("Compositional")
                .field("parts", parts)
                .field("bias", bias)
                .finish(),
            Self::Deformable {
                parts,
                deformed,
                deformation,
                shift,
                bias,
            } => f
                .debug_struct("Deformable")
                .field("parts", parts)
                .field("deformed", deformed)
                .field("deformation", deformation)
                .field("shift", shift)
                .field("bias", bias)
                .finish(),
        }
    }
}

/// A named grammar node.
#[derive(Debug)]
pub struct Node {
    /// Human-readable label, used in logs.
    pub name: String,
    /// Rule.
    pub kind: NodeKind,
}

impl Node {
    /// Create a node.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Children ids in declared order.
    pub fn children(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Terminal { .. } => Vec::new(),
            NodeKind::Switching { children } => children.clone(),
            NodeKind::Compositional { parts, .. } | NodeKind::Deformable { parts, .. } => {
                parts.iter().map(|p| p.child).collect()
            }
        }
    }
}

/// Precomputed visiting orders over the nodes reachable from the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraversalOrder {
    /// Children before parents; the root is last.
    pub postorder: Vec<NodeId>,
    /// Breadth-first from the root, each node once.
    pub breadth_first: Vec<NodeId>,
}

/// An immutable-after-build AND-OR grammar.
#[derive(Debug, Default)]
pub struct Grammar {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Grammar {
    /// Empty grammar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grammar from prebuilt nodes; children refer to indices in `nodes`.
    #[must_use]
    pub fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Self {
        Self {
            nodes,
            root: Some(root),
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Add a terminal node.
    pub fn add_terminal(&mut self, name: &str, appearance: impl Appearance + 'static) -> NodeId {
        self.push(Node::new(
            name,
            NodeKind::Terminal {
                appearance: Box::new(appearance),
            },
        ))
    }

    /// Add an OR node.
    pub fn add_switching(&mut self, name: &str, children: &[NodeId]) -> NodeId {
        self.push(Node::new(
            name,
            NodeKind::Switching {
                children: children.to_vec(),
            },
        ))
    }

    /// Add a rigid AND node.
    pub fn add_compositional(&mut self, name: &str, parts: &[Part], bias: f64) -> NodeId {
        self.push(Node::new(
            name,
            NodeKind::Compositional {
                parts: parts.to_vec(),
                bias,
            },
        ))
    }

    /// Add an AND node whose part `deformed` is placed by the distance transform.
    pub fn add_deformable(
        &mut self,
        name: &str,
        parts: &[Part],
        deformed: usize,
        deformation: Deformation,
        shift: i32,
        bias: f64,
    ) -> NodeId {
        self.push(Node::new(
            name,
            NodeKind::Deformable {
                parts: parts.to_vec(),
                deformed,
                deformation,
                shift,
                bias,
            },
        ))
    }

    /// Set the start symbol.
    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    /// The start symbol.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Node `id`.
    ///
    /// # Panics
    /// Panics if `id` is not in the arena.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// All nodes, indexed by [`NodeId::index`].
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Arena size.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the arena holds no node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes whose windows define detections: the root's children when the
    /// root is an OR node, otherwise the root alone.
    pub fn object_nodes(&self) -> Vec<NodeId> {
        match self.root {
            None => Vec::new(),
            Some(root) => match &self.nodes[root.index()].kind {
                NodeKind::Switching { children } => children.clone(),
                _ => vec![root],
            },
        }
    }

    fn check_node(&self, id: NodeId) -> Result<(), GrammarError> {
        let node = &self.nodes[id.index()];
        for child in node.children() {
            if child.index() >= self.nodes.len() {
                return Err(GrammarError::DanglingChild { parent: id, child });
            }
        }
        match &node.kind {
            NodeKind::Terminal { .. } => {}
            NodeKind::Switching { children } if children.is_empty() => {
                return Err(GrammarError::NoChildren(id));
            }
            NodeKind::Switching { .. } => {}
            NodeKind::Compositional { parts, .. } => {
                if parts.is_empty() {
                    return Err(GrammarError::NoChildren(id));
                }
                if parts.iter().any(|p| p.offset.dx < 0 || p.offset.dy < 0) {
                    return Err(GrammarError::NegativeOffset(id));
                }
            }
            NodeKind::Deformable {
                parts, deformed, ..
            } => {
                if parts.is_empty() {
                    return Err(GrammarError::NoChildren(id));
                }
                if *deformed >= parts.len() {
                    return Err(GrammarError::DeformedIndex {
                        node: id,
                        index: *deformed,
                        len: parts.len(),
                    });
                }
                if parts.iter().any(|p| p.offset.dx < 0 || p.offset.dy < 0) {
                    return Err(GrammarError::NegativeOffset(id));
                }
            }
        }
        Ok(())
    }

    /// Validate the reachable graph and compute its traversal orders.
    pub fn traversal(&self) -> Result<TraversalOrder, GrammarError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let root = self.root.ok_or(GrammarError::MissingRoot)?;
        if root.index() >= self.nodes.len() {
            return Err(GrammarError::MissingRoot);
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut postorder = Vec::new();
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> = Vec::new();

        self.check_node(root)?;
        marks[root.index()] = Mark::Open;
        stack.push((root, self.node(root).children(), 0));

        while let Some((id, children, next)) = stack.last_mut() {
            if let Some(&child) = children.get(*next) {
                *next += 1;
                match marks[child.index()] {
                    Mark::Open => return Err(GrammarError::Cycle(child)),
                    Mark::Done => {}
                    Mark::New => {
                        self.check_node(child)?;
                        marks[child.index()] = Mark::Open;
                        let grand = self.node(child).children();
                        stack.push((child, grand, 0));
                    }
                }
            } else {
                let id = *id;
                marks[id.index()] = Mark::Done;
                postorder.push(id);
                stack.pop();
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut breadth_first = Vec::with_capacity(postorder.len());
        let mut queue = VecDeque::from([root]);
        seen[root.index()] = true;
        while let Some(id) = queue.pop_front() {
            breadth_first.push(id);
            for child in self.node(id).children() {
                if !seen[child.index()] {
                    seen[child.index()] = true;
                    queue.push_back(child);
                }
            }
        }

        Ok(TraversalOrder {
            postorder,
            breadth_first,
        })
    }

    /// Receptive field `(rows, cols)` of every node, in cells at the node's
    /// own level. Unreachable nodes get `(0, 0)`.
    pub fn extents(&self, order: &TraversalOrder) -> Vec<(usize, usize)> {
        let mut extents = vec![(0usize, 0usize); self.nodes.len()];
        for &id in &order.postorder {
            let ext = match &self.node(id).kind {
                NodeKind::Terminal { appearance } => appearance.extent(),
                NodeKind::Switching { children } => children
                    .iter()
                    .map(|c| extents[c.index()])
                    .fold((0, 0), |(h, w), (ch, cw)| (h.max(ch), w.max(cw))),
                NodeKind::Compositional { parts, .. } | NodeKind::Deformable { parts, .. } => {
                    parts.iter().fold((0, 0), |(h, w), p| {
                        let (ch, cw) = extents[p.child.index()];
                        let step = p.offset.step().unsigned_abs() as usize;
                        #[allow(clippy::cast_sign_loss)]
                        let (dy, dx) = (p.offset.dy as usize, p.offset.dx as usize);
                        (h.max((dy + ch).div_ceil(step)), w.max((dx + cw).div_ceil(step)))
                    })
                }
            };
            extents[id.index()] = ext;
        }
        extents
    }
}
