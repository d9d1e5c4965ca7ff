//! Connectivity graph: edges and circular layout.
//!
//! Edges are undirected and stored normalized, so (a, b) and (b, a) are the
//! same edge. Layout is recomputed from scratch on every call; fine for the
//! tens of nodes this is meant for, but O(N) per mutation if that ever
//! grows unbounded.

use serde::Serialize;
use std::collections::BTreeSet;
use std::f64::consts::PI;

/// Undirected edge, normalized so `from <= to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(a: &str, b: &str) -> Self {
        let (from, to) = if a <= b { (a, b) } else { (b, a) };
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn touches(&self, identity: &str) -> bool {
        self.from == identity || self.to == identity
    }
}

/// Set of edges with no duplicates and no self-loops.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    edges: BTreeSet<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Returns false for duplicates and self-loops.
    pub fn add_edge(&mut self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        self.edges.insert(Edge::new(a, b))
    }

    /// Connect `identity` to every node in `others` (full mesh step).
    ///
    /// Returns the number of edges added.
    pub fn connect_all<'a>(
        &mut self,
        identity: &str,
        others: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        others
            .into_iter()
            .filter(|other| self.add_edge(identity, other))
            .count()
    }

    /// Remove every edge touching `identity`, returning them.
    pub fn remove_touching(&mut self, identity: &str) -> Vec<Edge> {
        let removed: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.touches(identity))
            .cloned()
            .collect();
        for edge in &removed {
            self.edges.remove(edge);
        }
        removed
    }

    pub fn contains(&self, a: &str, b: &str) -> bool {
        self.edges.contains(&Edge::new(a, b))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }
}

/// Point on the layout canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Canvas parameters for the circular layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutParams {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            center_x: 400.0,
            center_y: 300.0,
            radius: 200.0,
        }
    }
}

/// Circular layout for `count` nodes.
///
/// A single node sits at the center. Otherwise node i sits at angle
/// 2πi/N − π/2, so node 0 is at the top.
pub fn circular_layout(count: usize, params: &LayoutParams) -> Vec<Position> {
    if count == 1 {
        return vec![Position {
            x: params.center_x,
            y: params.center_y,
        }];
    }

    (0..count)
        .map(|i| {
            let theta = 2.0 * PI * i as f64 / count as f64 - PI / 2.0;
            Position {
                x: params.center_x + params.radius * theta.cos(),
                y: params.center_y + params.radius * theta.sin(),
            }
        })
        .collect()
}
