//! Cluster objects consumed by the pruner.
//!
//! These types mirror the subset of the platform API that image pruning cares about: images and
//! their manifests' components, image streams with their tag histories, and every kind of object
//! that can pin an image (pods, replication controllers, deployment configs, build configs and
//! builds).  Field names follow the API's camelCase JSON, but a [`Snapshot`] is this crate's own
//! format: build strategies carry a flat `from` reference and limit ranges are grouped in a map
//! keyed by namespace.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};

/// Annotation set on images which were pushed to the integrated registry.
pub const MANAGED_BY_OPENSHIFT_ANNOTATION: &str = "openshift.io/image.managed";

/// Limit range item type that constrains image sizes.
pub const LIMIT_TYPE_IMAGE: &str = "openshift.io/Image";

/// Resource name of the size maximum in an image limit range item.
pub const RESOURCE_STORAGE: &str = "storage";

/// Media type of a Docker schema 2 image manifest.
pub const DOCKER_SCHEMA2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// `namespace/name`, the way objects are referred to in log messages and as registry
    /// repository names.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub docker_image_reference: String,
    #[serde(default)]
    pub docker_image_manifest_media_type: String,
    #[serde(default)]
    pub docker_image_metadata: ImageMetadata,
    #[serde(default)]
    pub docker_image_layers: Vec<ImageLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Digest of the image configuration blob.
    #[serde(default, rename = "Id")]
    pub id: String,
    #[serde(default, rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayer {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub media_type: String,
}

impl Image {
    /// The image's content digest, which is also its name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether the image was pushed to the integrated registry (as opposed to being imported
    /// from an external one).
    pub fn is_managed(&self) -> bool {
        self.metadata
            .annotations
            .get(MANAGED_BY_OPENSHIFT_ANNOTATION)
            .is_some_and(|value| value == "true")
    }

    pub fn manifest_media_type(&self) -> MediaType {
        MediaType::from(self.docker_image_manifest_media_type.as_str())
    }

    /// The digest of the config blob, if the manifest format stores the config as a separate
    /// blob in the registry.
    ///
    /// Schema 1 manifests embed their configuration, so only schema 2 style manifests (Docker
    /// schema 2 and OCI image manifests) have one.
    pub fn config_blob(&self) -> Option<&str> {
        let schema2 = match self.manifest_media_type() {
            MediaType::ImageManifest => true,
            MediaType::Other(other) => other == DOCKER_SCHEMA2_MANIFEST,
            _ => false,
        };
        let id = self.docker_image_metadata.id.as_str();
        (schema2 && !id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ImageStreamStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    /// Pull spec of the stream's repository in the integrated registry.
    #[serde(default)]
    pub docker_image_repository: String,
    #[serde(default)]
    pub tags: BTreeMap<String, TagEventList>,
}

/// The history of a single tag, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagEventList {
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub docker_image_reference: String,
    pub image: String,
}

impl ImageStream {
    pub fn full_name(&self) -> String {
        self.metadata.full_name()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplatedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

impl TemplatedSpec {
    pub fn pod_spec(&self) -> Option<&PodSpec> {
        self.template.as_ref().map(|template| &template.spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationController {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TemplatedSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TemplatedSpec,
}

/// A reference to another object, as used by `strategy.from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildStrategy {
    Source {
        from: ObjectReference,
    },
    Docker {
        #[serde(default)]
        from: Option<ObjectReference>,
    },
    Custom {
        from: ObjectReference,
    },
    JenkinsPipeline,
}

impl BuildStrategy {
    /// The builder or base image this strategy pulls, if any.
    pub fn input_reference(&self) -> Option<&ObjectReference> {
        match self {
            BuildStrategy::Source { from } | BuildStrategy::Custom { from } => Some(from),
            BuildStrategy::Docker { from } => from.as_ref(),
            BuildStrategy::JenkinsPipeline => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub strategy: BuildStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRange {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LimitRangeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitRangeSpec {
    #[serde(default)]
    pub limits: Vec<LimitRangeItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRangeItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub max: BTreeMap<String, Quantity>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(String);

/// A resource quantity such as `512Mi` or `2G`, kept together with its value in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    text: String,
    bytes: u64,
}

impl Quantity {
    pub fn parse(text: &str) -> Result<Self, QuantityError> {
        let err = || QuantityError(text.to_string());
        let text = text.trim();

        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (number, suffix) = text.split_at(split);
        if number.is_empty() {
            return Err(err());
        }
        let value: f64 = number.parse().map_err(|_| err())?;

        let multiplier: f64 = match suffix {
            "" => 1.0,
            "Ki" => 1024f64,
            "Mi" => 1024f64.powi(2),
            "Gi" => 1024f64.powi(3),
            "Ti" => 1024f64.powi(4),
            "Pi" => 1024f64.powi(5),
            "Ei" => 1024f64.powi(6),
            "k" => 1e3,
            "M" => 1e6,
            "G" => 1e9,
            "T" => 1e12,
            "P" => 1e15,
            "E" => 1e18,
            exp if exp.starts_with(['e', 'E']) => {
                let exponent: i32 = exp[1..].parse().map_err(|_| err())?;
                10f64.powi(exponent)
            }
            _ => return Err(err()),
        };

        let bytes = (value * multiplier).ceil();
        if !bytes.is_finite() || bytes > u64::MAX as f64 {
            return Err(err());
        }
        Ok(Quantity {
            text: text.to_string(),
            bytes: bytes as u64,
        })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl TryFrom<String> for Quantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Quantity::parse(&value)
    }
}

impl From<Quantity> for String {
    fn from(value: Quantity) -> Self {
        value.text
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Everything the pruner looks at, captured at one point in time.
///
/// All lists must be complete for the whole cluster.  Any object missing from the snapshot is
/// one fewer reason to keep an image alive, so pruning from a partial snapshot deletes images
/// that are still in use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Snapshot {
    pub images: Vec<Image>,
    pub image_streams: Vec<ImageStream>,
    pub pods: Vec<Pod>,
    pub replication_controllers: Vec<ReplicationController>,
    pub deployment_configs: Vec<DeploymentConfig>,
    pub build_configs: Vec<BuildConfig>,
    pub builds: Vec<Build>,
    /// Limit ranges, keyed by namespace.
    pub limit_ranges: BTreeMap<String, Vec<LimitRange>>,
}

impl Snapshot {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader).context("Parsing snapshot")
    }

    /// Reads a JSON snapshot from a file.
    #[context("Loading snapshot from {}", path.as_ref().display())]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }
}
