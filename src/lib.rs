//! Garbage collection of images in an integrated container image registry.
//!
//! A [`Pruner`] takes a [`Snapshot`] of the cluster's images and of everything that can refer to
//! them, builds a reference graph, and deletes the images (and the registry blobs, layer links
//! and manifests belonging to them) that nothing keeps alive any more.

pub mod analyze;
pub mod builder;
pub mod config;
pub mod describe;
pub mod error;
pub mod graph;
pub mod model;
pub mod protocol;
pub mod prune;
pub mod reference;
pub mod registry;
pub mod store;
pub mod util;


pub use config::PruneOptions;
pub use model::Snapshot;
pub use prune::{Plan, PruneError, Pruner};
