use chaingraph_core::NodeKey;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use thiserror::Error;

use crate::graph::surface::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankDir {
    #[default]
    LeftRight,
    TopBottom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankNode {
    pub key: NodeKey,
    pub width: f64,
    pub height: f64,
}

// Directed from lower to higher rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankEdge {
    pub from: usize,
    pub to: usize,
    pub min_len: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RankGraph {
    pub nodes: Vec<RankNode>,
    pub edges: Vec<RankEdge>,
    pub node_sep: f64,
    pub edge_sep: f64,
    pub rank_sep: f64,
    pub dir: RankDir,
}

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("graph has a cycle through {0}")]
    Cycle(NodeKey),
    #[error("edge references node index {index} but graph has {len} nodes")]
    UnknownNode { index: usize, len: usize },
    #[error("layout needs {ranks} ranks and {virtual_nodes} virtual nodes")]
    Oversized { ranks: u64, virtual_nodes: u64 },
}

pub const MAX_RANKS: u64 = 1 << 16;
pub const MAX_VIRTUAL_NODES: u64 = 1 << 20;

pub trait RankedLayout {
    fn layout(&self, graph: &RankGraph) -> Result<Vec<Point>, LayoutError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LongestPath;

#[derive(Debug, Clone, Copy)]
struct Slot {
    // Index into the input nodes; `None` for virtual nodes on long edges.
    real: Option<usize>,
    extent: f64,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    upper: usize,
    lower: usize,
    weight: f64,
}

impl RankedLayout for LongestPath {
    fn layout(&self, graph: &RankGraph) -> Result<Vec<Point>, LayoutError> {
        let n = graph.nodes.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        for e in &graph.edges {
            for index in [e.from, e.to] {
                if index >= n {
                    return Err(LayoutError::UnknownNode { index, len: n });
                }
            }
        }

        let ranks = assign_ranks(graph)?;
        check_span(graph, &ranks)?;
        let (slots, segments, mut layers) = split_long_edges(graph, &ranks);
        order_layers(&mut layers, &segments, slots.len());
        Ok(place(graph, &ranks, &slots, &layers))
    }
}

fn assign_ranks(graph: &RankGraph) -> Result<Vec<u32>, LayoutError> {
    let mut g: DiGraph<usize, u32> = DiGraph::with_capacity(graph.nodes.len(), graph.edges.len());
    let idx: Vec<NodeIndex> = (0..graph.nodes.len()).map(|i| g.add_node(i)).collect();
    for e in &graph.edges {
        g.add_edge(idx[e.from], idx[e.to], e.min_len);
    }

    let order = toposort(&g, None)
        .map_err(|c| LayoutError::Cycle(graph.nodes[g[c.node_id()]].key.clone()))?;

    let mut ranks = vec![0u32; graph.nodes.len()];
    for ni in order {
        let rank = g
            .edges_directed(ni, Direction::Incoming)
            .map(|e| ranks[g[e.source()]].saturating_add(*e.weight()))
            .max()
            .unwrap_or(0);
        ranks[g[ni]] = rank;
    }
    Ok(ranks)
}

// Bounds what `split_long_edges` would allocate.
fn check_span(graph: &RankGraph, ranks: &[u32]) -> Result<(), LayoutError> {
    let ranks_needed = ranks.iter().copied().max().map_or(0, |r| u64::from(r) + 1);
    let virtual_nodes: u64 = graph
        .edges
        .iter()
        .map(|e| u64::from(ranks[e.to].saturating_sub(ranks[e.from])).saturating_sub(1))
        .sum();
    if ranks_needed > MAX_RANKS || virtual_nodes > MAX_VIRTUAL_NODES {
        return Err(LayoutError::Oversized {
            ranks: ranks_needed,
            virtual_nodes,
        });
    }
    Ok(())
}

fn split_long_edges(
    graph: &RankGraph,
    ranks: &[u32],
) -> (Vec<Slot>, Vec<Segment>, Vec<Vec<usize>>) {
    let across = |node: &RankNode| match graph.dir {
        RankDir::LeftRight => node.height,
        RankDir::TopBottom => node.width,
    };

    let max_rank = ranks.iter().copied().max().unwrap_or(0) as usize;
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); max_rank + 1];
    let mut slots: Vec<Slot> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| Slot {
            real: Some(i),
            extent: across(node),
        })
        .collect();
    for (i, &rank) in ranks.iter().enumerate() {
        layers[rank as usize].push(i);
    }

    let mut segments = Vec::with_capacity(graph.edges.len());
    for e in &graph.edges {
        let (from_rank, to_rank) = (ranks[e.from], ranks[e.to]);
        if to_rank <= from_rank + 1 {
            if to_rank > from_rank {
                segments.push(Segment {
                    upper: e.from,
                    lower: e.to,
                    weight: e.weight,
                });
            }
            continue;
        }
        let mut prev = e.from;
        for r in from_rank + 1..to_rank {
            let v = slots.len();
            slots.push(Slot {
                real: None,
                extent: 0.0,
            });
            layers[r as usize].push(v);
            segments.push(Segment {
                upper: prev,
                lower: v,
                weight: e.weight,
            });
            prev = v;
        }
        segments.push(Segment {
            upper: prev,
            lower: e.to,
            weight: e.weight,
        });
    }
    (slots, segments, layers)
}

fn order_layers(layers: &mut [Vec<usize>], segments: &[Segment], slot_count: usize) {
    let mut pos = vec![0.0f64; slot_count];
    let reindex = |layer: &[usize], pos: &mut [f64]| {
        for (i, &s) in layer.iter().enumerate() {
            pos[s] = i as f64;
        }
    };
    for layer in layers.iter() {
        reindex(layer, &mut pos);
    }

    let mut ups: Vec<Vec<(usize, f64)>> = vec![Vec::new(); slot_count];
    let mut downs: Vec<Vec<(usize, f64)>> = vec![Vec::new(); slot_count];
    for s in segments {
        ups[s.lower].push((s.upper, s.weight));
        downs[s.upper].push((s.lower, s.weight));
    }

    let sweep = |layer: &mut Vec<usize>, neighbors: &[Vec<(usize, f64)>], pos: &[f64]| {
        let mut keyed: Vec<(f64, f64, usize)> = layer
            .iter()
            .map(|&s| {
                let (sum, total) = neighbors[s]
                    .iter()
                    .fold((0.0, 0.0), |(sum, total), &(o, w)| (sum + pos[o] * w, total + w));
                let bary = if total > 0.0 { sum / total } else { pos[s] };
                (bary, pos[s], s)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        *layer = keyed.into_iter().map(|(_, _, s)| s).collect();
    };

    for r in 1..layers.len() {
        sweep(&mut layers[r], &ups, &pos);
        reindex(&layers[r], &mut pos);
    }
    for r in (0..layers.len().saturating_sub(1)).rev() {
        sweep(&mut layers[r], &downs, &pos);
        reindex(&layers[r], &mut pos);
    }
}

fn place(graph: &RankGraph, ranks: &[u32], slots: &[Slot], layers: &[Vec<usize>]) -> Vec<Point> {
    let rank_extent = graph
        .nodes
        .iter()
        .map(|n| match graph.dir {
            RankDir::LeftRight => n.width,
            RankDir::TopBottom => n.height,
        })
        .fold(0.0f64, f64::max);
    let step = rank_extent + graph.rank_sep;

    let mut secondary = vec![0.0f64; slots.len()];
    for layer in layers {
        let mut cursor = 0.0;
        let mut prev: Option<Slot> = None;
        for &s in layer {
            let slot = slots[s];
            if let Some(p) = prev {
                cursor += p.extent / 2.0 + separation(graph, p, slot) + slot.extent / 2.0;
            }
            secondary[s] = cursor;
            prev = Some(slot);
        }
        let shift = cursor / 2.0;
        for &s in layer {
            secondary[s] -= shift;
        }
    }

    (0..graph.nodes.len())
        .map(|i| {
            let along = f64::from(ranks[i]) * step;
            match graph.dir {
                RankDir::LeftRight => Point::new(along, secondary[i]),
                RankDir::TopBottom => Point::new(secondary[i], along),
            }
        })
        .collect()
}

fn separation(graph: &RankGraph, a: Slot, b: Slot) -> f64 {
    let side = |s: Slot| if s.real.is_some() { graph.node_sep } else { graph.edge_sep };
    (side(a) + side(b)) / 2.0
}
