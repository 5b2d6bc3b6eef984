//! Hierarchical Graph
//!
//! Directed graph of code blocks with per-node and per-edge properties,
//! hierarchical-root annotation for function entries, finite path
//! enumeration, connected-component extraction and a keyed node factory.
//!
//! Node identifiers are caller-chosen (`u64`, typically the code-block
//! virtual address). Edge identifiers are dense indices assigned in
//! insertion order, which keeps per-node edge lists small and stable.
//!
//! # Path Enumeration
//! Paths are enumerated depth-first with a "visited along this path" set, so
//! cycles cannot produce unbounded output: a cycle edge emits the acyclic
//! prefix at most once per node expansion.

use smallvec::SmallVec;
use std::collections::{HashMap, HashSet, VecDeque};

pub type NodeId = u64;
pub type EdgeId = u64;

/// Properties carried by every node. Analysis fills `cbva`/`cbsize`; the
/// renderer fills `size`; the layout passes fill the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeProps {
    /// Code-block start address.
    pub cbva: u64,
    /// Code-block size in bytes.
    pub cbsize: u64,
    pub row: i64,
    pub col: i64,
    pub row_count: i64,
    pub col_count: i64,
    /// Rendered node extent `(w, h)`, populated by the renderer before
    /// layout.
    pub size: (i64, i64),
    /// Top-left corner assigned by the layout.
    pub position: (i64, i64),
    pub input_edge_distance: i64,
    pub input_edge_start: Option<(i64, i64)>,
    pub output_edge_distance: i64,
    pub output_edge_start: Option<(i64, i64)>,
}

/// Properties carried by every edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeProps {
    /// Routed polyline, filled by the layout's edge pass.
    pub edge_points: Vec<(i64, i64)>,
}

#[derive(Debug, Clone)]
struct Edge {
    src: NodeId,
    dst: NodeId,
    props: EdgeProps,
}

/// Directed graph with hierarchical-root annotations.
#[derive(Debug, Clone, Default)]
pub struct HierGraph {
    nodes: HashMap<NodeId, NodeProps>,
    node_order: Vec<NodeId>,
    edges: Vec<Edge>,
    edges_from: HashMap<NodeId, SmallVec<[EdgeId; 2]>>,
    edges_to: HashMap<NodeId, SmallVec<[EdgeId; 2]>>,
    roots: Vec<NodeId>,
    formed: HashMap<(String, u64), NodeId>,
}

impl HierGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Returns `false` (leaving the node untouched) when the
    /// id already exists.
    pub fn add_node(&mut self, nid: NodeId) -> bool {
        if self.nodes.contains_key(&nid) {
            return false;
        }
        self.nodes.insert(nid, NodeProps::default());
        self.node_order.push(nid);
        true
    }

    /// Insert a node and mark it as a hierarchical root (function entry).
    pub fn add_hier_root_node(&mut self, nid: NodeId) {
        self.add_node(nid);
        if !self.roots.contains(&nid) {
            self.roots.push(nid);
        }
    }

    /// Hierarchical roots in insertion order.
    pub fn hier_root_nodes(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, nid: NodeId) -> Option<&NodeProps> {
        self.nodes.get(&nid)
    }

    pub fn node_mut(&mut self, nid: NodeId) -> Option<&mut NodeProps> {
        self.nodes.get_mut(&nid)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeProps)> {
        self.node_order.iter().map(move |nid| (*nid, &self.nodes[nid]))
    }

    pub fn node_count(&self) -> usize {
        self.node_order.len()
    }

    /// Connect two nodes (created on demand) and return the new edge id.
    pub fn add_edge_by_nids(&mut self, src: NodeId, dst: NodeId) -> EdgeId {
        self.add_node(src);
        self.add_node(dst);
        let eid = self.edges.len() as EdgeId;
        self.edges.push(Edge {
            src,
            dst,
            props: EdgeProps::default(),
        });
        self.edges_from.entry(src).or_default().push(eid);
        self.edges_to.entry(dst).or_default().push(eid);
        eid
    }

    /// `(src, dst)` endpoints of an edge.
    pub fn edge(&self, eid: EdgeId) -> Option<(NodeId, NodeId)> {
        self.edges.get(eid as usize).map(|e| (e.src, e.dst))
    }

    pub fn edge_props(&self, eid: EdgeId) -> Option<&EdgeProps> {
        self.edges.get(eid as usize).map(|e| &e.props)
    }

    pub fn edge_props_mut(&mut self, eid: EdgeId) -> Option<&mut EdgeProps> {
        self.edges.get_mut(eid as usize).map(|e| &mut e.props)
    }

    /// Every edge as `(eid, src, dst)`, in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, NodeId, NodeId)> + '_ {
        self.edges
            .iter()
            .enumerate()
            .map(|(i, e)| (i as EdgeId, e.src, e.dst))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Outgoing edge ids of a node.
    pub fn refs_from(&self, nid: NodeId) -> &[EdgeId] {
        self.edges_from.get(&nid).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Incoming edge ids of a node.
    pub fn refs_to(&self, nid: NodeId) -> &[EdgeId] {
        self.edges_to.get(&nid).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Successor node ids, one entry per outgoing edge.
    pub fn successors(&self, nid: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.refs_from(nid)
            .iter()
            .map(move |eid| self.edges[*eid as usize].dst)
    }

    /// Keyed create-or-return node factory. The constructor runs once, when
    /// the `(kind, key)` pair first creates its node.
    pub fn form_node(
        &mut self,
        kind: &str,
        key: u64,
        ctor: impl FnOnce(&mut NodeProps),
    ) -> NodeId {
        if let Some(nid) = self.formed.get(&(kind.to_string(), key)) {
            return *nid;
        }
        let nid = self.alloc_nid();
        self.add_node(nid);
        self.formed.insert((kind.to_string(), key), nid);
        ctor(self.nodes.get_mut(&nid).expect("freshly added node"));
        nid
    }

    fn alloc_nid(&self) -> NodeId {
        let mut nid = self.node_order.len() as NodeId;
        while self.nodes.contains_key(&nid) {
            nid += 1;
        }
        nid
    }

    // ------------------------------------------------------------------
    // hierarchical path enumeration

    fn walk_from(
        &self,
        nid: NodeId,
        path: &mut Vec<NodeId>,
        out: &mut Vec<Vec<NodeId>>,
        leaf_only: bool,
    ) {
        path.push(nid);
        let outs = self.refs_from(nid);
        if outs.is_empty() {
            out.push(path.clone());
        } else {
            let mut cycle_emitted = false;
            for eid in outs {
                let dst = self.edges[*eid as usize].dst;
                if path.contains(&dst) {
                    // the prefix up to the cycle is itself a path, once
                    if !leaf_only && !cycle_emitted {
                        out.push(path.clone());
                        cycle_emitted = true;
                    }
                } else {
                    self.walk_from(dst, path, out, leaf_only);
                }
            }
        }
        path.pop();
    }

    fn walk_to(&self, nid: NodeId, path: &mut Vec<NodeId>, out: &mut Vec<Vec<NodeId>>) {
        path.push(nid);
        let ins = self.refs_to(nid);
        if self.roots.contains(&nid) || ins.is_empty() {
            let mut found: Vec<NodeId> = path.clone();
            found.reverse();
            out.push(found);
        } else {
            for eid in ins {
                let src = self.edges[*eid as usize].src;
                if !path.contains(&src) {
                    self.walk_to(src, path, out);
                }
            }
        }
        path.pop();
    }

    /// All paths from `nid` downward. A path ends at a leaf or where it
    /// would re-enter itself.
    pub fn hier_paths_from(&self, nid: NodeId) -> Vec<Vec<NodeId>> {
        let mut out = Vec::new();
        self.walk_from(nid, &mut Vec::new(), &mut out, false);
        out
    }

    /// All paths reaching `nid` from a hierarchical root (or a node with no
    /// predecessors), in forward order.
    pub fn hier_paths_to(&self, nid: NodeId) -> Vec<Vec<NodeId>> {
        let mut out = Vec::new();
        self.walk_to(nid, &mut Vec::new(), &mut out);
        out
    }

    /// All paths passing through `nid`: every way in joined with every way
    /// out.
    pub fn hier_paths_thru(&self, nid: NodeId) -> Vec<Vec<NodeId>> {
        let tos = self.hier_paths_to(nid);
        let froms = self.hier_paths_from(nid);
        let mut out = Vec::new();
        for to in tos.iter() {
            for from in froms.iter() {
                let mut path = to.clone();
                path.extend_from_slice(&from[1..]);
                out.push(path);
            }
        }
        out
    }

    /// Number of acyclic root-to-leaf paths.
    pub fn hier_path_count(&self) -> usize {
        let mut out = Vec::new();
        for root in self.roots.iter() {
            self.walk_from(*root, &mut Vec::new(), &mut out, true);
        }
        out.len()
    }

    // ------------------------------------------------------------------
    // clusters

    /// Split the graph into its weakly connected components.
    pub fn cluster_graphs(&self) -> Vec<HierGraph> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut clusters = Vec::new();

        for seed in self.node_order.iter() {
            if seen.contains(seed) {
                continue;
            }
            // undirected reachability from the seed
            let mut members: HashSet<NodeId> = HashSet::new();
            let mut todo: VecDeque<NodeId> = VecDeque::from([*seed]);
            while let Some(nid) = todo.pop_front() {
                if !members.insert(nid) {
                    continue;
                }
                for eid in self.refs_from(nid) {
                    todo.push_back(self.edges[*eid as usize].dst);
                }
                for eid in self.refs_to(nid) {
                    todo.push_back(self.edges[*eid as usize].src);
                }
            }
            seen.extend(members.iter().copied());

            let mut sub = HierGraph::new();
            for nid in self.node_order.iter().filter(|n| members.contains(n)) {
                sub.add_node(*nid);
                *sub.node_mut(*nid).expect("just added") = self.nodes[nid].clone();
                if self.roots.contains(nid) {
                    sub.add_hier_root_node(*nid);
                }
            }
            for edge in self.edges.iter() {
                if members.contains(&edge.src) {
                    let eid = sub.add_edge_by_nids(edge.src, edge.dst);
                    *sub.edge_props_mut(eid).expect("just added") = edge.props.clone();
                }
            }
            clusters.push(sub);
        }

        clusters
    }
}
