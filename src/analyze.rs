use log::{debug, trace};

use crate::graph::{EdgeKinds, Graph, NodeId, NodeKind, NodeSet, Subgraph};

/// An image can go if nothing references it strongly.
pub fn image_is_prunable(graph: &Graph, image: NodeId) -> bool {
    for &referrer in graph.predecessors(image) {
        if graph.has_edge_kind(referrer, image, EdgeKinds::STRONG_IMAGE_REF) {
            trace!("{} lives, referenced by {}", graph.node(image), graph.node(referrer));
            return false;
        }
    }
    true
}

/// Returns the prunable image nodes, in graph order, along with the same ids as a set.
pub fn compute_prunable_images(graph: &Graph) -> (Vec<NodeId>, NodeSet) {
    let prunable: Vec<NodeId> = graph
        .nodes_of_kind(NodeKind::Image)
        .into_iter()
        .filter(|&id| image_is_prunable(graph, id))
        .inspect(|&id| debug!("{} is prunable", graph.node(id)))
        .collect();
    let ids = prunable.iter().copied().collect();
    (prunable, ids)
}

/// A view of `graph` without the nodes in `excluded` and any edge touching them.
pub fn subgraph_without<'g>(graph: &'g Graph, excluded: &NodeSet) -> Subgraph<'g> {
    graph.subgraph(
        |id, _| !excluded.contains(&id),
        |from, to, _| !excluded.contains(&from) && !excluded.contains(&to),
    )
}

/// Components that no remaining image uses.
///
/// Streams still link to the components of every image they ever referenced, so only edges
/// coming from images count.
pub fn compute_prunable_components(subgraph: &Subgraph<'_>) -> Vec<NodeId> {
    subgraph
        .nodes()
        .filter(|(_, node)| node.kind() == NodeKind::ImageComponent)
        .filter(|&(id, node)| {
            let used_by = subgraph
                .predecessors(id)
                .iter()
                .find(|&&from| subgraph.node(from).kind() == NodeKind::Image);
            match used_by {
                Some(&image) => {
                    trace!("{node} lives, used by {}", subgraph.node(image));
                    false
                }
                None => {
                    debug!("{node} is prunable");
                    true
                }
            }
        })
        .map(|(id, _)| id)
        .collect()
}

/// Image streams with an edge of any kind to `id`.
pub fn referencing_streams(graph: &Graph, id: NodeId) -> Vec<NodeId> {
    graph
        .predecessors(id)
        .iter()
        .copied()
        .filter(|&from| graph.node(from).kind() == NodeKind::ImageStream)
        .collect()
}
