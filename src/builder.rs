//! Populates a [`Graph`] from a [`Snapshot`], deciding for every reference whether it keeps its
//! image alive.
//!
//! Images that are too young (or, unless `all_images` is set, not managed by the integrated
//! registry) never make it into the graph, so they can never be pruned.  Every other image is
//! kept only if something references it strongly:
//!
//! - running or pending pods, and terminated pods younger than `keep_younger_than`
//! - replication controllers and deployment configs
//! - build configs and builds, through their strategy's base image
//! - the `keep_tag_revisions` newest revisions of every image stream tag
//! - every revision of streams younger than `keep_younger_than`
//!
//! With a `namespace` set, streams and consumers from other namespaces are left out entirely.
//!
//! With `prune_over_size_limit`, stream references are decided by size alone: images within
//! their namespace's image limit ranges are kept, larger ones are candidates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, trace};

use crate::{
    config::PruneOptions,
    graph::{EdgeKinds, Graph, ImageComponent, Node, NodeId},
    model::{
        BuildStrategy, Image, ImageStream, LimitRange, ObjectMeta, Pod, PodPhase, PodSpec,
        Snapshot, LIMIT_TYPE_IMAGE, RESOURCE_STORAGE,
    },
    reference::{parse_image_stream_image_name, ImageReference},
};

pub struct GraphBuilder<'a> {
    graph: Graph,
    options: &'a PruneOptions,
    now: DateTime<Utc>,
}

/// Builds the reference graph for `snapshot` as of `now`.
pub fn build_graph(snapshot: Snapshot, options: &PruneOptions, now: DateTime<Utc>) -> Graph {
    let Snapshot {
        images,
        image_streams,
        pods,
        replication_controllers,
        deployment_configs,
        build_configs,
        builds,
        limit_ranges,
    } = snapshot;

    let in_scope = |meta: &ObjectMeta| match &options.namespace {
        Some(namespace) if *namespace != meta.namespace => {
            trace!("{} is outside namespace {namespace} - skipping", meta.full_name());
            false
        }
        _ => true,
    };

    let mut builder = GraphBuilder::new(options, now);
    builder.add_images(images);
    builder.add_image_streams(
        image_streams
            .into_iter()
            .filter(|is| in_scope(&is.metadata))
            .collect(),
        &limit_ranges,
    );
    for pod in pods.into_iter().filter(|p| in_scope(&p.metadata)) {
        builder.add_pod(pod);
    }
    for rc in replication_controllers
        .into_iter()
        .filter(|rc| in_scope(&rc.metadata))
    {
        let id = builder.graph.ensure_node(Node::ReplicationController(rc));
        builder.add_templated_consumer(id);
    }
    for dc in deployment_configs
        .into_iter()
        .filter(|dc| in_scope(&dc.metadata))
    {
        let id = builder.graph.ensure_node(Node::DeploymentConfig(dc));
        builder.add_templated_consumer(id);
    }
    for bc in build_configs.into_iter().filter(|bc| in_scope(&bc.metadata)) {
        let strategy = bc.spec.strategy.clone();
        debug!("Examining BuildConfig {}", bc.metadata.full_name());
        let id = builder.graph.ensure_node(Node::BuildConfig(bc));
        builder.add_build_strategy_reference(&strategy, id);
    }
    for build in builds.into_iter().filter(|b| in_scope(&b.metadata)) {
        let strategy = build.spec.strategy.clone();
        debug!("Examining build {}", build.metadata.full_name());
        let id = builder.graph.ensure_node(Node::Build(build));
        builder.add_build_strategy_reference(&strategy, id);
    }
    builder.finish()
}

/// Whether `image` is bigger than an image limit range of the stream's namespace allows.
pub fn exceeds_limits(
    stream: &ImageStream,
    image: &Image,
    limits: &BTreeMap<String, Vec<LimitRange>>,
) -> bool {
    let Some(limit_ranges) = limits.get(&stream.metadata.namespace) else {
        return false;
    };

    let size = image.docker_image_metadata.size;
    for limit_range in limit_ranges {
        for item in &limit_range.spec.limits {
            if item.kind != LIMIT_TYPE_IMAGE {
                continue;
            }
            let Some(max) = item.max.get(RESOURCE_STORAGE) else {
                continue;
            };
            if max.bytes() < size {
                debug!(
                    "Image {} in stream {} exceeds limit {}: {size} vs {max}",
                    image.name(),
                    stream.full_name(),
                    limit_range.metadata.name
                );
                return true;
            }
        }
    }
    false
}

impl<'a> GraphBuilder<'a> {
    pub fn new(options: &'a PruneOptions, now: DateTime<Utc>) -> Self {
        GraphBuilder {
            graph: Graph::new(),
            options,
            now,
        }
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    fn is_young(&self, created: DateTime<Utc>) -> bool {
        self.now - created < self.options.keep_younger_than
    }

    /// Adds the images that are candidates at all, together with edges to their config and
    /// layer blobs.
    pub fn add_images(&mut self, images: Vec<Image>) {
        for image in images {
            debug!("Examining image {}", image.name());

            if !self.options.all_images && !image.is_managed() {
                debug!(
                    "Image {} with reference {} belongs to an external registry - skipping",
                    image.name(),
                    image.docker_image_reference
                );
                continue;
            }

            if !self.options.prune_over_size_limit
                && self.is_young(image.metadata.creation_timestamp)
            {
                debug!(
                    "Image {} is younger than minimum pruning age, skipping (age={})",
                    image.name(),
                    self.now - image.metadata.creation_timestamp
                );
                continue;
            }

            let components: Vec<ImageComponent> = image
                .config_blob()
                .map(ImageComponent::config)
                .into_iter()
                .chain(
                    image
                        .docker_image_layers
                        .iter()
                        .map(|layer| ImageComponent::layer(layer.name.as_str())),
                )
                .collect();

            debug!("Adding image {} to graph", image.name());
            let image_id = self.graph.ensure_node(Node::Image(image));
            for component in components {
                trace!("Adding image {} {} to graph", component.kind, component.digest);
                let kind = component.edge_kind();
                let component_id = self.graph.ensure_node(Node::ImageComponent(component));
                self.graph.add_edge(image_id, component_id, kind);
            }
        }
    }

    /// Adds streams and their references to every image in their tag histories.
    ///
    /// Each referenced image's components are also linked from the stream, which is how the
    /// pruner later knows which repositories hold links to a blob.
    pub fn add_image_streams(
        &mut self,
        streams: Vec<ImageStream>,
        limits: &BTreeMap<String, Vec<LimitRange>>,
    ) {
        for stream in streams {
            debug!("Examining ImageStream {}", stream.full_name());

            // old revisions are weak references unless the whole stream is young
            let old_revision_kind = if !self.options.prune_over_size_limit
                && self.is_young(stream.metadata.creation_timestamp)
            {
                EdgeKinds::STRONG_IMAGE_REF
            } else {
                EdgeKinds::WEAK_IMAGE_REF
            };

            let stream_name = stream.full_name();
            let events: Vec<(String, usize, String)> = stream
                .status
                .tags
                .iter()
                .flat_map(|(tag, history)| {
                    history
                        .items
                        .iter()
                        .enumerate()
                        .map(move |(i, event)| (tag.clone(), i, event.image.clone()))
                })
                .collect();

            let kinds: Vec<Option<(NodeId, EdgeKinds)>> = events
                .iter()
                .map(|(tag, revision, image_name)| {
                    let Some(image_id) = self.graph.find_image(image_name) else {
                        debug!(
                            "Unable to find image {image_name} in graph (from tag={tag}, revision={revision}) - skipping"
                        );
                        return None;
                    };
                    let kind = if self.options.prune_over_size_limit {
                        if exceeds_limits(&stream, self.graph.image(image_id), limits) {
                            EdgeKinds::WEAK_IMAGE_REF
                        } else {
                            EdgeKinds::STRONG_IMAGE_REF
                        }
                    } else if *revision < self.options.keep_tag_revisions {
                        EdgeKinds::STRONG_IMAGE_REF
                    } else {
                        old_revision_kind
                    };
                    Some((image_id, kind))
                })
                .collect();

            debug!("Adding ImageStream {stream_name} to graph");
            let stream_id = self.graph.ensure_node(Node::ImageStream(stream));

            for (image_id, kind) in kinds.into_iter().flatten() {
                if self
                    .graph
                    .has_edge_kind(stream_id, image_id, EdgeKinds::STRONG_IMAGE_REF)
                {
                    trace!("Strong reference from {stream_name} to {image_id:?} already exists");
                    continue;
                }

                debug!(
                    "Adding edge (kind={kind:?}) from {stream_name} to {}",
                    self.graph.node(image_id)
                );
                self.graph.add_edge(stream_id, image_id, kind);

                let components: Vec<(NodeId, EdgeKinds)> = self
                    .graph
                    .successors(image_id)
                    .iter()
                    .filter_map(|&id| {
                        let component = self.graph.node(id).as_component()?;
                        Some((id, component.edge_kind()))
                    })
                    .collect();
                for (component_id, kind) in components {
                    trace!(
                        "Adding reference from stream {stream_name} to {}",
                        self.graph.node(component_id)
                    );
                    self.graph.add_edge(stream_id, component_id, kind);
                }
            }
        }
    }

    /// Adds a pod unless it has terminated and is older than `keep_younger_than`.
    pub fn add_pod(&mut self, pod: Pod) {
        debug!("Examining pod {}", pod.metadata.full_name());

        if !matches!(pod.status.phase, PodPhase::Running | PodPhase::Pending)
            && !self.is_young(pod.metadata.creation_timestamp)
        {
            debug!(
                "Pod {} is not running nor pending and older than the minimum pruning age - skipping",
                pod.metadata.full_name()
            );
            return;
        }

        let spec = pod.spec.clone();
        let id = self.graph.ensure_node(Node::Pod(pod));
        self.add_pod_spec(&spec, id);
    }

    fn add_templated_consumer(&mut self, id: NodeId) {
        let spec = match self.graph.node(id) {
            Node::ReplicationController(rc) => rc.spec.pod_spec().cloned(),
            Node::DeploymentConfig(dc) => dc.spec.pod_spec().cloned(),
            _ => None,
        };
        debug!("Examining {}", self.graph.node(id));
        if let Some(spec) = spec {
            self.add_pod_spec(&spec, id);
        }
    }

    /// Strongly references every digest-pinned container image of `spec` from `consumer`.
    fn add_pod_spec(&mut self, spec: &PodSpec, consumer: NodeId) {
        for container in &spec.containers {
            trace!("Examining container image {}", container.image);

            let reference = match ImageReference::parse(&container.image) {
                Ok(reference) => reference,
                Err(e) => {
                    debug!("Unable to parse image reference {}: {e} - skipping", container.image);
                    continue;
                }
            };
            if reference.id.is_empty() {
                trace!("{} has no image ID", container.image);
                continue;
            }

            let Some(image_id) = self.graph.find_image(&reference.id) else {
                debug!("Unable to find image {} in the graph - skipping", reference.id);
                continue;
            };

            trace!("Adding edge from {} to {}", self.graph.node(consumer), reference.id);
            self.graph
                .add_edge(consumer, image_id, EdgeKinds::STRONG_IMAGE_REF);
        }
    }

    /// Strongly references the image that `strategy` builds from.
    fn add_build_strategy_reference(&mut self, strategy: &BuildStrategy, consumer: NodeId) {
        let Some(from) = strategy.input_reference() else {
            trace!("Unable to determine 'from' reference - skipping");
            return;
        };

        let image = match from.kind.as_str() {
            "ImageStreamImage" => match parse_image_stream_image_name(&from.name) {
                Ok((_, id)) => id.to_string(),
                Err(e) => {
                    debug!("Error parsing ImageStreamImage name {}: {e} - skipping", from.name);
                    return;
                }
            },
            "DockerImage" => match ImageReference::parse(&from.name) {
                Ok(reference) => reference.id,
                Err(e) => {
                    debug!("Error parsing DockerImage name {}: {e} - skipping", from.name);
                    return;
                }
            },
            _ => return,
        };

        let Some(image_id) = self.graph.find_image(&image) else {
            trace!("Unable to find image {image:?} in graph - skipping");
            return;
        };

        trace!("Adding edge from {} to {image}", self.graph.node(consumer));
        self.graph
            .add_edge(consumer, image_id, EdgeKinds::STRONG_IMAGE_REF);
    }
}
