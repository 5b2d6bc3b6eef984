//! CFG Layout Engine
//!
//! Positions basic blocks into a row/column grid and routes edges as
//! polylines.
//!
//! # Passes
//! 1. **Grid assignment** - recursive descent from the hierarchical root
//!    computing `row`/`col` and the `row_count`/`col_count` subtree extents,
//!    shifting subtrees sideways so siblings never overlap.
//! 2. **Position assignment** - rows and columns become pixel cells sized by
//!    their largest occupant plus padding; each node is centered in its cell.
//! 3. **Edge routing** - outgoing anchor points are distributed across the
//!    bottom edge of the source (inbound across the top of the destination)
//!    and connected with short vertical escapes into the inter-row gap.
//!
//! The grid pass walks a spanning tree of the graph: the first parent to
//! discover a node owns it, so merge points and loops are positioned exactly
//! once and subtree shifts never double-apply.

use std::collections::{HashMap, HashSet};

use crate::graph::{EdgeId, HierGraph, NodeId};

use super::GraphLayout;

/// Column-spacing variant for the grid pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutStyle {
    /// Two-child nodes spread their subtrees side by side and widen the
    /// parent to the combined width.
    Wide,
    /// Parent column is the midpoint of its children's columns.
    Medium,
    /// Parent sits over a single child, or centers over `(col - 2) / 2`.
    #[default]
    Narrow,
}

/// Hierarchical row/column layout with polyline edge routing.
pub struct ReflowLayout<'a> {
    graph: &'a mut HierGraph,
    pub style: LayoutStyle,
    pub width_pad: i64,
    pub height_pad: i64,
    /// Cap on the spacing between adjacent edge anchors on one node.
    pub node_edge_distance: i64,
    width: i64,
    height: i64,
    table_row_size: HashMap<i64, i64>,
    table_col_size: HashMap<i64, i64>,
    cell_row_pos: HashMap<i64, i64>,
    cell_col_pos: HashMap<i64, i64>,
    /// First-parent spanning tree built by the grid pass.
    tree: HashMap<NodeId, Vec<NodeId>>,
}

impl<'a> ReflowLayout<'a> {
    pub fn new(graph: &'a mut HierGraph) -> Self {
        Self::with_style(graph, LayoutStyle::default())
    }

    pub fn with_style(graph: &'a mut HierGraph, style: LayoutStyle) -> Self {
        Self {
            graph,
            style,
            width_pad: 80,
            height_pad: 80,
            node_edge_distance: 10,
            width: 0,
            height: 0,
            table_row_size: HashMap::new(),
            table_col_size: HashMap::new(),
            cell_row_pos: HashMap::new(),
            cell_col_pos: HashMap::new(),
            tree: HashMap::new(),
        }
    }

    /// Reset the transient layout keys on every node.
    fn prepare_metadata(&mut self) {
        let nids: Vec<NodeId> = self.graph.nodes().map(|(nid, _)| nid).collect();
        for nid in nids {
            let props = self.graph.node_mut(nid).expect("listed node");
            props.row = 0;
            props.col = 0;
            props.row_count = 0;
            props.col_count = 0;
            props.input_edge_start = None;
            props.output_edge_start = None;
        }
    }

    // ------------------------------------------------------------------
    // pass 1: grid assignment

    /// Shift a subtree (along the spanning tree) by `(col, row)`.
    fn adjust_layout(&mut self, node: NodeId, col: i64, row: i64) {
        if let Some(props) = self.graph.node_mut(node) {
            props.col += col;
            props.row += row;
        }
        let kids = self.tree.get(&node).cloned().unwrap_or_default();
        for kid in kids {
            self.adjust_layout(kid, col, row);
        }
    }

    fn compute_layout(&mut self, node: NodeId, visited: &mut HashSet<NodeId>) {
        visited.insert(node);

        // the first parent to reach a node owns it; merge points and back
        // edges never re-enter the descent
        let all_kids: Vec<NodeId> = self.graph.successors(node).collect();
        let mut kids = Vec::new();
        for kid in all_kids {
            if visited.contains(&kid) {
                continue;
            }
            self.compute_layout(kid, visited);
            kids.push(kid);
        }
        self.tree.insert(node, kids.clone());

        let mut row_count = 1;
        let mut child_column = 0;
        for kid in kids.iter() {
            let kprops = self.graph.node(*kid).expect("computed child");
            if kprops.row_count + 1 > row_count {
                row_count = kprops.row_count + 1;
            }
            child_column = kprops.col;
        }
        let single_child = kids.len() == 1;

        if self.style == LayoutStyle::Wide && kids.len() == 2 {
            let (left, right) = (kids[0], kids[1]);
            let lcount = self.graph.node(left).expect("left child").col_count;
            let rcount = self.graph.node(right).expect("right child").col_count;

            self.adjust_layout(left, 0, 1);
            self.adjust_layout(right, lcount, 1);

            let col = lcount + rcount;
            let props = self.graph.node_mut(node).expect("current node");
            props.col_count = col.max(2);
            props.col = (col - 2) / 2;
        } else {
            let mut col = 0;
            for kid in kids.iter() {
                self.adjust_layout(*kid, col, 1);
                col += self.graph.node(*kid).expect("adjusted child").col_count;
            }

            let props = self.graph.node_mut(node).expect("current node");
            if col >= 2 {
                props.col = if single_child { child_column } else { (col - 2) / 2 };
                props.col_count = col;
            } else {
                props.col = 0;
                props.col_count = 2;
            }
        }

        if self.style == LayoutStyle::Medium && !kids.is_empty() {
            let first = self.graph.node(kids[0]).expect("first child").col;
            let last = self.graph.node(*kids.last().expect("children")).expect("last child").col;
            self.graph.node_mut(node).expect("current node").col = (first + last) / 2;
        }

        let props = self.graph.node_mut(node).expect("current node");
        props.row = 0;
        props.row_count = row_count;
    }

    // ------------------------------------------------------------------
    // pass 2: position assignment

    fn position_nodes(&mut self) {
        self.table_row_size.clear();
        self.table_col_size.clear();
        self.cell_row_pos.clear();
        self.cell_col_pos.clear();

        let mut num_rows = 0;
        let mut num_cols = 0;
        for (_, props) in self.graph.nodes() {
            let (xsize, ysize) = props.size;
            let (row, col) = (props.row, props.col);
            let csz = self.table_col_size.entry(col).or_insert(0);
            *csz = (*csz).max(xsize);
            let rsz = self.table_row_size.entry(row).or_insert(0);
            *rsz = (*rsz).max(ysize);
            num_rows = num_rows.max(row);
            num_cols = num_cols.max(col);
        }

        let mut height = 0;
        for r in 0..=num_rows {
            height += self.height_pad;
            self.cell_row_pos.insert(r, height);
            height += self.table_row_size.get(&r).copied().unwrap_or(0);
        }
        height += self.height_pad;

        let mut width = 0;
        for c in 0..=num_cols {
            width += self.width_pad;
            self.cell_col_pos.insert(c, width);
            width += self.table_col_size.get(&c).copied().unwrap_or(0);
        }
        width += self.width_pad;

        let nids: Vec<NodeId> = self.graph.nodes().map(|(nid, _)| nid).collect();
        for nid in nids {
            let props = self.graph.node_mut(nid).expect("listed node");
            let (xsize, ysize) = props.size;
            let col_sz = self.table_col_size.get(&props.col).copied().unwrap_or(0);
            let row_sz = self.table_row_size.get(&props.row).copied().unwrap_or(0);
            let cell_x = self.cell_col_pos.get(&props.col).copied().unwrap_or(0);
            let cell_y = self.cell_row_pos.get(&props.row).copied().unwrap_or(0);
            props.position = (cell_x + (col_sz - xsize) / 2, cell_y + (row_sz - ysize) / 2);
        }

        self.width = width;
        self.height = height;
    }

    // ------------------------------------------------------------------
    // pass 3: edge routing

    /// Distribute anchor points across a node's top and bottom edges.
    fn calc_node_edge_start(&mut self, nid: NodeId) {
        let inputs = self.graph.refs_to(nid).len() as i64;
        let outputs = self.graph.refs_from(nid).len() as i64;
        let cap = self.node_edge_distance;

        let props = self.graph.node_mut(nid).expect("routing node");
        let (nwidth, nheight) = props.size;
        let (xpos, ypos) = props.position;

        let spread = |count: i64| -> (i64, i64) {
            if count == 0 {
                return (0, 0);
            }
            let distance = cap.min(nwidth / count);
            (distance, nwidth / 2 - (count / 2) * distance)
        };

        let (i_d, i_start) = spread(inputs);
        props.input_edge_distance = i_d;
        props.input_edge_start = Some((xpos + i_start, ypos));

        let (o_d, o_start) = spread(outputs);
        props.output_edge_distance = o_d;
        props.output_edge_start = Some((xpos + o_start, ypos + nheight));
    }

    /// Pixel endpoints of an edge on its source/destination anchor rows.
    fn edge_points(&self, eid: EdgeId) -> ((i64, i64), (i64, i64)) {
        let (nsrc, ndst) = self.graph.edge(eid).expect("routed edge");

        let sidx = self
            .graph
            .refs_from(nsrc)
            .iter()
            .position(|e| *e == eid)
            .expect("edge listed on source") as i64;
        let sprops = self.graph.node(nsrc).expect("source node");
        let (mut src_x, src_y) = sprops.output_edge_start.expect("anchors computed");
        src_x += sidx * sprops.output_edge_distance;

        let didx = self
            .graph
            .refs_to(ndst)
            .iter()
            .position(|e| *e == eid)
            .expect("edge listed on destination") as i64;
        let dprops = self.graph.node(ndst).expect("destination node");
        let (mut dst_x, dst_y) = dprops.input_edge_start.expect("anchors computed");
        dst_x += didx * dprops.input_edge_distance;

        ((src_x, src_y), (dst_x, dst_y))
    }

    fn calc_edge_lines(&mut self) {
        let h_vpad = self.height_pad / 2;

        let nids: Vec<NodeId> = self.graph.nodes().map(|(nid, _)| nid).collect();
        for nid in nids {
            self.calc_node_edge_start(nid);
        }

        let edges: Vec<(EdgeId, NodeId, NodeId)> = self.graph.edges().collect();
        for (eid, n1, n2) in edges {
            let prow = self.graph.node(n1).expect("source node").row;
            let krow = self.graph.node(n2).expect("destination node").row;
            let ((x1, y1), (x2, y2)) = self.edge_points(eid);

            let points = if prow == krow {
                vec![(x1, y1), (x1, y1 - h_vpad), (x2, y2 - h_vpad), (x2, y2)]
            } else if prow < krow {
                vec![(x1, y1), (x1, y1 + h_vpad), (x2, y2 - h_vpad), (x2, y2)]
            } else {
                // back edge: doubled exit points let the renderer leave the
                // node cleanly before reversing direction
                vec![
                    (x1, y1),
                    (x1, y1),
                    (x1, y1),
                    (x1, y1 + h_vpad),
                    (x2, y2 - h_vpad),
                    (x2, y2),
                ]
            };

            self.graph.edge_props_mut(eid).expect("routed edge").edge_points = points;
        }
    }
}

impl GraphLayout for ReflowLayout<'_> {
    fn layout_graph(&mut self) {
        let Some(root) = self.graph.hier_root_nodes().first().copied() else {
            log::warn!("layout requested for a graph with no hierarchical root");
            return;
        };

        self.prepare_metadata();
        self.tree.clear();
        self.compute_layout(root, &mut HashSet::new());
        self.position_nodes();
        self.calc_edge_lines();
    }

    fn layout_size(&self) -> (i64, i64) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> HierGraph {
        // a -> {b, c} -> d
        let mut g = HierGraph::new();
        g.add_hier_root_node(1);
        for n in [2, 3, 4] {
            g.add_node(n);
        }
        g.add_edge_by_nids(1, 2);
        g.add_edge_by_nids(1, 3);
        g.add_edge_by_nids(2, 4);
        g.add_edge_by_nids(3, 4);
        for nid in [1, 2, 3, 4] {
            g.node_mut(nid).unwrap().size = (100, 40);
        }
        g
    }

    #[test]
    fn grid_rows_follow_depth() {
        let mut g = diamond();
        let mut layout = ReflowLayout::new(&mut g);
        layout.layout_graph();

        assert_eq!(g.node(1).unwrap().row, 0);
        assert_eq!(g.node(2).unwrap().row, 1);
        assert_eq!(g.node(3).unwrap().row, 1);
        assert_eq!(g.node(4).unwrap().row, 2);
    }

    #[test]
    fn siblings_get_distinct_columns() {
        let mut g = diamond();
        let mut layout = ReflowLayout::new(&mut g);
        layout.layout_graph();
        assert_ne!(g.node(2).unwrap().col, g.node(3).unwrap().col);
    }

    #[test]
    fn layout_size_covers_all_cells() {
        let mut g = diamond();
        let (w, h) = {
            let mut layout = ReflowLayout::new(&mut g);
            layout.layout_graph();
            layout.layout_size()
        };
        assert!(w > 0 && h > 0);
        for (_, props) in g.nodes() {
            let (x, y) = props.position;
            let (nw, nh) = props.size;
            assert!(x >= 0 && y >= 0);
            assert!(x + nw <= w);
            assert!(y + nh <= h);
        }
    }

    #[test]
    fn empty_rooted_graph_is_a_noop() {
        let mut g = HierGraph::new();
        let mut layout = ReflowLayout::new(&mut g);
        layout.layout_graph();
        assert_eq!(layout.layout_size(), (0, 0));
    }
}
