//! Graph Layout Managers
//!
//! A layout consumes a [`HierGraph`](crate::graph::HierGraph) whose node
//! `size` properties were populated by a renderer, and fills in `position`
//! for every node and `edge_points` for every edge.

use crate::graph::NodeProps;

pub mod reflow;

/// Common surface of the layout managers.
pub trait GraphLayout {
    /// Assign `position` to every node and `edge_points` to every edge.
    fn layout_graph(&mut self);

    /// Total `(width, height)` of the last layout pass.
    fn layout_size(&self) -> (i64, i64);
}

/// Exit point (bottom center) of a node.
pub fn exit_pos(props: &NodeProps) -> (i64, i64) {
    let (x, y) = props.position;
    let (w, h) = props.size;
    (x + w / 2, y + h)
}

/// Entry point (top center) of a node.
pub fn entry_pos(props: &NodeProps) -> (i64, i64) {
    let (x, y) = props.position;
    let (w, _) = props.size;
    (x + w / 2, y)
}

/// Center point of a node.
pub fn center_pos(props: &NodeProps) -> (i64, i64) {
    let (x, y) = props.position;
    let (w, h) = props.size;
    (x + w / 2, y + h / 2)
}
