//! Typed reference graph between images, their components and everything that uses them.
//!
//! Nodes live in an append-only arena and are addressed by [`NodeId`].  Every node has a
//! deterministic [`UniqueName`] derived from its kind and identity, and inserting a node whose
//! unique name is already present returns the existing node instead of adding a duplicate.
//!
//! Edges are directed and carry a set of [`EdgeKinds`].  Adding an edge between a pair that is
//! already connected merges the kinds, so a strong reference is never lost to a later weak one.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use bitflags::bitflags;

use crate::model::{
    Build, BuildConfig, DeploymentConfig, Image, ImageStream, Pod, ReplicationController,
};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct EdgeKinds: u8 {
        /// The target image must not be pruned.
        const STRONG_IMAGE_REF = 1 << 0;
        /// The target image may be pruned unless something else references it strongly.
        const WEAK_IMAGE_REF = 1 << 1;
        /// Image or stream to the image's config blob.
        const IMAGE_CONFIG_REF = 1 << 2;
        /// Image or stream to one of the image's layers.
        const IMAGE_LAYER_REF = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

pub type NodeSet = HashSet<NodeId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentType {
    Layer,
    Config,
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComponentType::Layer => "layer",
            ComponentType::Config => "config",
        })
    }
}

/// A content-addressed blob that makes up part of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageComponent {
    pub digest: String,
    pub kind: ComponentType,
}

impl ImageComponent {
    pub fn layer(digest: impl Into<String>) -> Self {
        ImageComponent {
            digest: digest.into(),
            kind: ComponentType::Layer,
        }
    }

    pub fn config(digest: impl Into<String>) -> Self {
        ImageComponent {
            digest: digest.into(),
            kind: ComponentType::Config,
        }
    }

    /// The edge kind used to reference a component of this type.
    pub fn edge_kind(&self) -> EdgeKinds {
        match self.kind {
            ComponentType::Layer => EdgeKinds::IMAGE_LAYER_REF,
            ComponentType::Config => EdgeKinds::IMAGE_CONFIG_REF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Image,
    ImageStream,
    ImageComponent,
    Pod,
    ReplicationController,
    DeploymentConfig,
    BuildConfig,
    Build,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Image(Image),
    ImageStream(ImageStream),
    ImageComponent(ImageComponent),
    Pod(Pod),
    ReplicationController(ReplicationController),
    DeploymentConfig(DeploymentConfig),
    BuildConfig(BuildConfig),
    Build(Build),
}

/// Stable identity of a node: its kind plus whatever identifies it within that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueName(String);

impl UniqueName {
    pub fn image(name: &str) -> Self {
        UniqueName(format!("{}|{name}", NodeKind::Image))
    }

    pub fn component(kind: ComponentType, digest: &str) -> Self {
        UniqueName(format!("{}|{kind}|{digest}", NodeKind::ImageComponent))
    }

    fn namespaced(kind: NodeKind, namespace: &str, name: &str) -> Self {
        UniqueName(format!("{kind}|{namespace}/{name}"))
    }
}

impl fmt::Display for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Image(_) => NodeKind::Image,
            Node::ImageStream(_) => NodeKind::ImageStream,
            Node::ImageComponent(_) => NodeKind::ImageComponent,
            Node::Pod(_) => NodeKind::Pod,
            Node::ReplicationController(_) => NodeKind::ReplicationController,
            Node::DeploymentConfig(_) => NodeKind::DeploymentConfig,
            Node::BuildConfig(_) => NodeKind::BuildConfig,
            Node::Build(_) => NodeKind::Build,
        }
    }

    pub fn unique_name(&self) -> UniqueName {
        let kind = self.kind();
        match self {
            Node::Image(image) => UniqueName::image(image.name()),
            Node::ImageComponent(component) => {
                UniqueName::component(component.kind, &component.digest)
            }
            Node::ImageStream(stream) => {
                let meta = &stream.metadata;
                UniqueName::namespaced(kind, &meta.namespace, &meta.name)
            }
            Node::Pod(Pod { metadata: meta, .. })
            | Node::ReplicationController(ReplicationController { metadata: meta, .. })
            | Node::DeploymentConfig(DeploymentConfig { metadata: meta, .. })
            | Node::BuildConfig(BuildConfig { metadata: meta, .. })
            | Node::Build(Build { metadata: meta, .. }) => {
                UniqueName::namespaced(kind, &meta.namespace, &meta.name)
            }
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Node::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_image_stream(&self) -> Option<&ImageStream> {
        match self {
            Node::ImageStream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&ImageComponent> {
        match self {
            Node::ImageComponent(component) => Some(component),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Image(image) => write!(f, "Image[{}]", image.name()),
            Node::ImageComponent(component) => {
                write!(f, "ImageComponent[{}:{}]", component.kind, component.digest)
            }
            Node::ImageStream(stream) => write!(f, "ImageStream[{}]", stream.full_name()),
            Node::Pod(Pod { metadata, .. })
            | Node::ReplicationController(ReplicationController { metadata, .. })
            | Node::DeploymentConfig(DeploymentConfig { metadata, .. })
            | Node::BuildConfig(BuildConfig { metadata, .. })
            | Node::Build(Build { metadata, .. }) => {
                write!(f, "{}[{}]", self.kind(), metadata.full_name())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<UniqueName, NodeId>,
    edges: HashMap<(NodeId, NodeId), EdgeKinds>,
    outgoing: Vec<Vec<NodeId>>,
    incoming: Vec<Vec<NodeId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node` unless a node with the same unique name exists.  Either way, returns the id
    /// of the node that is in the graph afterwards.
    pub fn ensure_node(&mut self, node: Node) -> NodeId {
        let name = node.unique_name();
        if let Some(&id) = self.names.get(&name) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.outgoing.push(vec![]);
        self.incoming.push(vec![]);
        self.names.insert(name, id);
        id
    }

    pub fn find(&self, name: &UniqueName) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn find_image(&self, name: &str) -> Option<NodeId> {
        self.find(&UniqueName::image(name))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// The image payload of `id`.  Panics if `id` isn't an image node.
    pub fn image(&self, id: NodeId) -> &Image {
        match self.node(id) {
            Node::Image(image) => image,
            other => panic!("{other} is not an image"),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }

    /// Adds `kinds` to the edge from `from` to `to`, creating it if necessary.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kinds: EdgeKinds) {
        match self.edges.get_mut(&(from, to)) {
            Some(existing) => *existing |= kinds,
            None => {
                self.edges.insert((from, to), kinds);
                self.outgoing[from.0].push(to);
                self.incoming[to.0].push(from);
            }
        }
    }

    pub fn edge_kinds(&self, from: NodeId, to: NodeId) -> Option<EdgeKinds> {
        self.edges.get(&(from, to)).copied()
    }

    pub fn has_edge_kind(&self, from: NodeId, to: NodeId, kind: EdgeKinds) -> bool {
        self.edge_kinds(from, to)
            .is_some_and(|kinds| kinds.contains(kind))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes that `id` has an edge to, in insertion order.
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.outgoing[id.0]
    }

    /// Nodes with an edge to `id`, in insertion order.
    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.incoming[id.0]
    }

    /// Builds a read-only view of the graph containing the nodes accepted by `node_filter` and,
    /// between those, the edges accepted by `edge_filter`.
    ///
    /// The filters are evaluated once, here; the graph itself is left untouched.
    pub fn subgraph(
        &self,
        node_filter: impl Fn(NodeId, &Node) -> bool,
        edge_filter: impl Fn(NodeId, NodeId, EdgeKinds) -> bool,
    ) -> Subgraph<'_> {
        let nodes: Vec<NodeId> = self
            .nodes()
            .filter(|&(id, node)| node_filter(id, node))
            .map(|(id, _)| id)
            .collect();
        let members: NodeSet = nodes.iter().copied().collect();

        let mut incoming: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &to in &nodes {
            for &from in self.predecessors(to) {
                let kinds = self.edges[&(from, to)];
                if members.contains(&from) && edge_filter(from, to, kinds) {
                    incoming.entry(to).or_default().push(from);
                }
            }
        }

        Subgraph {
            graph: self,
            nodes,
            incoming,
        }
    }
}

/// A filtered, read-only view of a [`Graph`].
pub struct Subgraph<'g> {
    graph: &'g Graph,
    nodes: Vec<NodeId>,
    incoming: HashMap<NodeId, Vec<NodeId>>,
}

impl<'g> Subgraph<'g> {
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &'g Node)> + '_ {
        self.nodes.iter().map(|&id| (id, self.graph.node(id)))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.binary_search(&id).is_ok()
    }

    pub fn node(&self, id: NodeId) -> &'g Node {
        self.graph.node(id)
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.incoming.get(&id).map(Vec::as_slice).unwrap_or_default()
    }
}
