//! Deleting what the graph says is no longer needed.
//!
//! Removal happens in phases that must not overlap.  A failure of a single item is recorded and
//! the phase carries on with the others, but if anything went wrong before the last phase, no
//! image object is deleted.  Since the image objects are what the next run starts from, running
//! the pruner again retries whatever failed.
//!
//! 1. remove references to pruned images from image stream tag histories
//! 2. remove the links to unused blobs from every repository that has them
//! 3. delete unused blobs from the registry
//! 4. delete the manifests of pruned images from their repositories
//! 5. delete the image objects
//!
//! Only the first phase runs for a namespace-scoped prune.
//!
//! The side effects are performed by collaborators implementing [`ImageDeleter`],
//! [`ImageStreamDeleter`], [`LayerLinkDeleter`], [`BlobDeleter`] and [`ManifestDeleter`].

use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, info, trace};
use reqwest::Client;

use crate::{
    analyze::{
        compute_prunable_components, compute_prunable_images, referencing_streams,
        subgraph_without,
    },
    builder::build_graph,
    config::PruneOptions,
    error::AggregateError,
    graph::{Graph, ImageComponent, Node, NodeId, NodeKind},
    model::{Image, ImageStream, Snapshot},
    registry::{determine_registry, LocateError, Pinger, RegistryPinger},
};

#[allow(async_fn_in_trait)]
pub trait ImageDeleter {
    /// Deletes the image object.
    async fn delete_image(&self, image: &Image) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait ImageStreamDeleter {
    /// Stores `stream`, from which every reference to `image` has been removed.
    /// `updated_tags` are the tags that lost a reference.  Returns the stream as stored.
    async fn delete_image_stream(
        &self,
        stream: &ImageStream,
        image: &Image,
        updated_tags: &[String],
    ) -> Result<ImageStream>;
}

#[allow(async_fn_in_trait)]
pub trait LayerLinkDeleter {
    async fn delete_layer_link(
        &self,
        client: &Client,
        registry_url: &str,
        repo: &str,
        link_name: &str,
    ) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait BlobDeleter {
    async fn delete_blob(&self, client: &Client, registry_url: &str, blob: &str) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait ManifestDeleter {
    async fn delete_manifest(
        &self,
        client: &Client,
        registry_url: &str,
        repo: &str,
        manifest: &str,
    ) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("unable to determine registry")]
    DetermineRegistry(#[source] LocateError),
    #[error("error communicating with registry {registry}")]
    Ping {
        registry: String,
        #[source]
        source: AggregateError,
    },
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// What a prune would remove.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub images: Vec<Image>,
    pub components: Vec<ImageComponent>,
}

/// Removes every tag history entry pointing at `image` and drops tags left without history.
///
/// Returns the tags that were changed, in order.
pub fn remove_image_from_tags(stream: &mut ImageStream, image: &str) -> Vec<String> {
    let mut updated = vec![];
    stream.status.tags.retain(|tag, history| {
        let before = history.items.len();
        history.items.retain(|event| event.image != image);
        if history.items.len() == before {
            return true;
        }
        updated.push(tag.clone());
        if history.items.is_empty() {
            debug!("Removing tag {tag} from stream {}", stream.metadata.full_name());
            false
        } else {
            true
        }
    });
    updated
}

fn repository_name(stream: &ImageStream) -> String {
    stream.full_name()
}

pub struct Pruner<P = Pinger> {
    graph: Graph,
    options: PruneOptions,
    client: Client,
    pinger: P,
}

impl Pruner<Pinger> {
    /// Builds the reference graph for `snapshot` as of now.
    pub fn new(snapshot: Snapshot, options: PruneOptions, client: Client) -> Self {
        Self::with_now(snapshot, options, client, Utc::now())
    }

    /// Like [`Pruner::new`], with ages measured from `now`.
    pub fn with_now(
        snapshot: Snapshot,
        options: PruneOptions,
        client: Client,
        now: DateTime<Utc>,
    ) -> Self {
        let graph = build_graph(snapshot, &options, now);
        debug!("Built graph with {} nodes and {} edges", graph.len(), graph.edge_count());
        let pinger = Pinger::new(client.clone(), options.dry_run, options.insecure);
        Pruner {
            graph,
            options,
            client,
            pinger,
        }
    }
}

impl<P: RegistryPinger> Pruner<P> {
    pub fn with_pinger<Q: RegistryPinger>(self, pinger: Q) -> Pruner<Q> {
        Pruner {
            graph: self.graph,
            options: self.options,
            client: self.client,
            pinger,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn options(&self) -> &PruneOptions {
        &self.options
    }

    /// The images and components that [`Pruner::prune`] would delete, without touching anything.
    pub fn plan(&self) -> Plan {
        let (images, excluded) = compute_prunable_images(&self.graph);
        let subgraph = subgraph_without(&self.graph, &excluded);
        Plan {
            images: images
                .into_iter()
                .map(|id| self.graph.image(id).clone())
                .collect(),
            components: compute_prunable_components(&subgraph)
                .into_iter()
                .filter_map(|id| self.graph.node(id).as_component().cloned())
                .collect(),
        }
    }

    fn registry(&self) -> Result<String, LocateError> {
        if let Some(url) = &self.options.registry_url {
            let url = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .unwrap_or(url);
            return Ok(url.trim_end_matches('/').to_string());
        }

        let images: Vec<&Image> = self
            .graph
            .nodes()
            .filter_map(|(_, node)| node.as_image())
            .collect();
        let streams: Vec<&ImageStream> = self
            .graph
            .nodes()
            .filter_map(|(_, node)| node.as_image_stream())
            .collect();
        determine_registry(&images, &streams)
    }

    /// Runs `action` on every item with bounded concurrency and collects the failures.
    async fn run_phase<T, F, Fut>(&self, items: Vec<T>, action: F) -> AggregateError
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        stream::iter(items)
            .map(action)
            .buffer_unordered(self.options.concurrency.max(1))
            .filter_map(|result| async move { result.err() })
            .collect()
            .await
    }

    fn stream_name(&self, id: NodeId) -> Option<String> {
        self.graph.node(id).as_image_stream().map(repository_name)
    }

    /// Phase 1.  Sequential: several images can be scrubbed from the same stream and every
    /// update has to see the ones before it.
    async fn prune_streams(
        &mut self,
        images: &[NodeId],
        deleter: &impl ImageStreamDeleter,
    ) -> AggregateError {
        let mut errors = AggregateError::new();

        for &image_id in images {
            let image = self.graph.image(image_id).clone();
            for stream_id in referencing_streams(&self.graph, image_id) {
                let Node::ImageStream(stream) = self.graph.node_mut(stream_id) else {
                    continue;
                };
                let updated_tags = remove_image_from_tags(stream, image.name());
                if updated_tags.is_empty() {
                    trace!(
                        "Stream {} no longer references {}",
                        stream.full_name(),
                        image.name()
                    );
                    continue;
                }

                let stream = stream.clone();
                info!(
                    "Removing image {} from stream {} (tags: {})",
                    image.name(),
                    stream.full_name(),
                    updated_tags.join(", ")
                );
                match deleter
                    .delete_image_stream(&stream, &image, &updated_tags)
                    .await
                    .with_context(|| {
                        format!(
                            "error updating image stream {} to remove references to image {}",
                            stream.full_name(),
                            image.name()
                        )
                    }) {
                    Ok(updated) => *self.graph.node_mut(stream_id) = Node::ImageStream(updated),
                    Err(e) => errors.push(e),
                }
            }
        }

        errors
    }

    /// Phase 2.
    async fn prune_layer_links(
        &self,
        components: &[NodeId],
        registry: &str,
        deleter: &impl LayerLinkDeleter,
    ) -> AggregateError {
        let links: Vec<(String, String)> = components
            .iter()
            .flat_map(|&id| {
                let digest = self
                    .graph
                    .node(id)
                    .as_component()
                    .map(|c| c.digest.clone())
                    .unwrap_or_default();
                referencing_streams(&self.graph, id)
                    .into_iter()
                    .filter_map(|stream| self.stream_name(stream))
                    .map(move |repo| (repo, digest.clone()))
            })
            .collect();

        self.run_phase(links, |(repo, link)| async move {
            deleter
                .delete_layer_link(&self.client, registry, &repo, &link)
                .await
                .with_context(|| {
                    format!("error pruning layer link {link} in the repository {repo}")
                })
        })
        .await
    }

    /// Phase 3.
    async fn prune_blobs(
        &self,
        components: &[NodeId],
        registry: &str,
        deleter: &impl BlobDeleter,
    ) -> AggregateError {
        let blobs: Vec<String> = components
            .iter()
            .filter_map(|&id| self.graph.node(id).as_component())
            .map(|c| c.digest.clone())
            .collect();

        self.run_phase(blobs, |blob| async move {
            deleter
                .delete_blob(&self.client, registry, &blob)
                .await
                .with_context(|| format!("error removing blob {blob} from the registry"))
        })
        .await
    }

    /// Phase 4.
    async fn prune_manifests(
        &self,
        images: &[NodeId],
        registry: &str,
        deleter: &impl ManifestDeleter,
    ) -> AggregateError {
        let manifests: Vec<(String, String)> = images
            .iter()
            .flat_map(|&id| {
                let name = self.graph.image(id).name().to_string();
                referencing_streams(&self.graph, id)
                    .into_iter()
                    .filter_map(|stream| self.stream_name(stream))
                    .map(move |repo| (repo, name.clone()))
            })
            .collect();

        self.run_phase(manifests, |(repo, manifest)| async move {
            deleter
                .delete_manifest(&self.client, registry, &repo, &manifest)
                .await
                .with_context(|| {
                    format!("error pruning manifest {manifest} in the repository {repo}")
                })
        })
        .await
    }

    /// Phase 5.
    async fn prune_images(&self, images: &[NodeId], deleter: &impl ImageDeleter) -> AggregateError {
        let images: Vec<&Image> = images.iter().map(|&id| self.graph.image(id)).collect();

        self.run_phase(images, |image| async move {
            info!("Deleting image {}", image.name());
            deleter
                .delete_image(image)
                .await
                .with_context(|| format!("error deleting image {}", image.name()))
        })
        .await
    }

    /// Deletes everything that is no longer referenced.
    ///
    /// Fails before deleting anything if the registry can't be determined or doesn't respond.
    /// Otherwise every failure is collected into one [`PruneError::Aggregate`].  Dropping the
    /// returned future stops after the in-flight requests; later phases don't start.
    pub async fn prune(
        &mut self,
        image_deleter: &impl ImageDeleter,
        stream_deleter: &impl ImageStreamDeleter,
        layer_link_deleter: &impl LayerLinkDeleter,
        blob_deleter: &impl BlobDeleter,
        manifest_deleter: &impl ManifestDeleter,
    ) -> Result<(), PruneError> {
        if self.graph.nodes_of_kind(NodeKind::Image).is_empty() {
            info!("No images to prune");
            return Ok(());
        }

        let registry = self.registry().map_err(PruneError::DetermineRegistry)?;
        let url = self
            .pinger
            .ping(&registry)
            .await
            .map_err(|source| PruneError::Ping {
                registry: registry.clone(),
                source,
            })?;
        debug!("Using registry {url}");

        let (images, excluded) = compute_prunable_images(&self.graph);
        info!("Found {} prunable images", images.len());

        let mut errors = self.prune_streams(&images, stream_deleter).await;
        if let Some(namespace) = &self.options.namespace {
            debug!("Pruning limited to namespace {namespace}, leaving the registry alone");
            return Ok(errors.into_result()?);
        }

        let components = {
            let subgraph = subgraph_without(&self.graph, &excluded);
            compute_prunable_components(&subgraph)
        };
        info!("Found {} prunable components", components.len());

        errors.append(
            self.prune_layer_links(&components, &registry, layer_link_deleter)
                .await,
        );
        errors.append(self.prune_blobs(&components, &registry, blob_deleter).await);
        errors.append(
            self.prune_manifests(&images, &registry, manifest_deleter)
                .await,
        );
        if !errors.is_empty() {
            info!("Not deleting image objects after {} errors", errors.len());
            return Err(errors.into());
        }

        Ok(self.prune_images(&images, image_deleter).await.into_result()?)
    }
}
