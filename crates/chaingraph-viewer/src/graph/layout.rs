use chaingraph_core::{LayoutOptions, NodeKey};
use std::collections::{BTreeMap, BTreeSet};

use crate::content::ContentRegistry;
use crate::graph::ranker::{
    LayoutError, LongestPath, RankDir, RankEdge, RankGraph, RankNode, RankedLayout,
};
use crate::graph::surface::{batch, Node, Point, Surface};

// Numerator of the edge weight; short edges pull harder.
pub const EDGE_WEIGHT_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Default)]
pub struct LayoutEngine<L = LongestPath> {
    ranker: L,
}

impl LayoutEngine<LongestPath> {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compound_keys(surface: &dyn Surface) -> BTreeSet<NodeKey> {
    surface.nodes().filter_map(|n| n.parent.clone()).collect()
}

fn is_pinned(node: &Node, registry: &ContentRegistry) -> bool {
    node.content
        .and_then(|c| registry.get(c))
        .is_some_and(|h| h.pinned(node))
}

fn min_len(source: &Node, target: &Node, opts: &LayoutOptions) -> u32 {
    if opts.compact {
        return 1;
    }
    match (source.slot, target.slot) {
        (Some(a), Some(b)) => u32::try_from(a.abs_diff(b)).unwrap_or(u32::MAX),
        _ => 1,
    }
}

// Rank model over every node that is neither a compound nor pinned by its
// content type. Surface edges point from a block to its predecessor and
// ranks grow the other way, so each edge is reversed.
pub fn build_model(
    surface: &dyn Surface,
    registry: &ContentRegistry,
    opts: &LayoutOptions,
) -> RankGraph {
    let compound = compound_keys(surface);
    let mut index: BTreeMap<&NodeKey, usize> = BTreeMap::new();
    let mut nodes = Vec::new();
    for n in surface
        .nodes()
        .filter(|n| !compound.contains(&n.key) && !is_pinned(n, registry))
    {
        index.insert(&n.key, nodes.len());
        nodes.push(RankNode {
            key: n.key.clone(),
            width: n.width,
            height: n.height,
        });
    }

    let mut edges = Vec::new();
    for e in surface.edges() {
        let (Some(&from), Some(&to)) = (index.get(e.target()), index.get(e.source())) else {
            continue;
        };
        let (Some(source), Some(target)) = (surface.node(e.source()), surface.node(e.target()))
        else {
            continue;
        };
        let min_len = min_len(source, target, opts);
        edges.push(RankEdge {
            from,
            to,
            min_len,
            weight: EDGE_WEIGHT_SCALE / (f64::from(min_len) + 1.0),
        });
    }

    RankGraph {
        nodes,
        edges,
        node_sep: opts.node_sep,
        edge_sep: opts.edge_sep,
        rank_sep: opts.slot_sep,
        dir: RankDir::LeftRight,
    }
}

impl<L: RankedLayout> LayoutEngine<L> {
    pub fn with_ranker(ranker: L) -> Self {
        Self { ranker }
    }

    pub fn compute(
        &self,
        surface: &dyn Surface,
        registry: &ContentRegistry,
        opts: &LayoutOptions,
    ) -> Result<BTreeMap<NodeKey, Point>, LayoutError> {
        let model = build_model(surface, registry, opts);
        let points = self.ranker.layout(&model)?;
        let temporal = opts.temporal();

        let mut out = BTreeMap::new();
        for n in surface.nodes() {
            let Some(handler) = n.content.and_then(|c| registry.get(c)) else {
                continue;
            };
            if handler.pinned(n) {
                out.insert(n.key.clone(), handler.transform(n, n.position));
            }
        }
        for (rn, pt) in model.nodes.iter().zip(points) {
            let Some(node) = surface.node(&rn.key) else {
                continue;
            };
            let pt = match node.content.and_then(|c| registry.get(c)) {
                Some(handler) if temporal => handler.transform(node, pt),
                _ => pt,
            };
            out.insert(rn.key.clone(), pt);
        }

        // Groups sit at the centroid of their placed children.
        let mut sums: BTreeMap<NodeKey, (f64, f64, u32)> = BTreeMap::new();
        for n in surface.nodes() {
            let (Some(parent), Some(pt)) = (&n.parent, out.get(&n.key)) else {
                continue;
            };
            let e = sums.entry(parent.clone()).or_insert((0.0, 0.0, 0));
            e.0 += pt.x;
            e.1 += pt.y;
            e.2 += 1;
        }
        for (key, (x, y, count)) in sums {
            if surface.node(&key).is_some() && !out.contains_key(&key) {
                let c = f64::from(count);
                out.insert(key, Point::new(x / c, y / c));
            }
        }
        Ok(out)
    }

    pub fn run(
        &self,
        surface: &mut dyn Surface,
        registry: &ContentRegistry,
        opts: &LayoutOptions,
    ) -> Result<usize, LayoutError> {
        let positions = self.compute(surface, registry, opts)?;
        let moved = batch(surface, |surface| {
            let mut moved = 0;
            for (key, pt) in &positions {
                if let Some(node) = surface.node_mut(key) {
                    if node.position != *pt {
                        node.position = *pt;
                        moved += 1;
                    }
                }
            }
            moved
        });
        tracing::debug!(
            nodes = positions.len(),
            moved,
            compact = opts.compact,
            pull_latest = opts.pull_latest,
            "layout applied"
        );
        Ok(moved)
    }
}
