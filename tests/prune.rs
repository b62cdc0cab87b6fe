use serde_json::{json, Value};
use similar_asserts::assert_eq;

use imageprune::{
    protocol::{RegistryBlobDeleter, RegistryLayerLinkDeleter, RegistryManifestDeleter},
    store::SnapshotStore,
    PruneError, PruneOptions, Pruner, Snapshot,
};

mod common;
use common::{client, StubRegistry};

fn digest(n: u32) -> String {
    format!("sha256:{n:064x}")
}

fn image(registry: &str, n: u32, layers: &[u32]) -> Value {
    json!({
        "metadata": {
            "name": digest(n),
            "creationTimestamp": "2020-01-01T00:00:00Z",
            "annotations": {"openshift.io/image.managed": "true"},
        },
        "dockerImageReference": format!("{registry}/ns/app@{}", digest(n)),
        "dockerImageManifestMediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "dockerImageLayers": layers
            .iter()
            .map(|&l| json!({"name": digest(l), "size": 100}))
            .collect::<Vec<_>>(),
    })
}

fn tag_event(registry: &str, n: u32) -> Value {
    json!({
        "dockerImageReference": format!("{registry}/ns/app@{}", digest(n)),
        "image": digest(n),
    })
}

/// Image 2 is only the previous revision of `latest`, image 3 is also run by a pod.
fn snapshot(registry: &str) -> Snapshot {
    let value = json!({
        "images": [
            image(registry, 1, &[10, 11]),
            image(registry, 2, &[10, 12]),
            image(registry, 3, &[10, 13]),
        ],
        "imageStreams": [{
            "metadata": {
                "namespace": "ns",
                "name": "app",
                "creationTimestamp": "2020-01-01T00:00:00Z",
            },
            "status": {
                "dockerImageRepository": format!("{registry}/ns/app"),
                "tags": {
                    "latest": {"items": [tag_event(registry, 1), tag_event(registry, 2)]},
                    "old": {"items": [tag_event(registry, 3), tag_event(registry, 2)]},
                },
            },
        }],
        "pods": [{
            "metadata": {
                "namespace": "ns",
                "name": "runner",
                "creationTimestamp": "2020-01-01T00:00:00Z",
            },
            "spec": {
                "containers": [{"name": "c", "image": format!("{registry}/ns/app@{}", digest(3))}],
            },
            "status": {"phase": "Running"},
        }],
    });
    Snapshot::from_reader(value.to_string().as_bytes()).unwrap()
}

fn options() -> PruneOptions {
    PruneOptions {
        keep_tag_revisions: 1,
        concurrency: 1,
        ..Default::default()
    }
}

async fn prune(pruner: &mut Pruner, store: &SnapshotStore) -> Result<(), PruneError> {
    pruner
        .prune(
            store,
            store,
            &RegistryLayerLinkDeleter,
            &RegistryBlobDeleter,
            &RegistryManifestDeleter,
        )
        .await
}

#[tokio::test]
async fn test_prune_snapshot() {
    let registry = StubRegistry::start(|method, path| match (method, path) {
        ("GET", "/healthz") => (200, "{}".to_string()),
        ("DELETE", _) => (202, String::new()),
        _ => (405, String::new()),
    })
    .await;
    let snapshot = snapshot(&registry.addr);
    let store = SnapshotStore::new(snapshot.clone());
    let mut pruner = Pruner::new(snapshot, options(), client());

    prune(&mut pruner, &store).await.unwrap();

    assert_eq!(
        registry.requests(),
        vec![
            "GET /healthz".to_string(),
            format!("DELETE /v2/ns/app/blobs/{}", digest(12)),
            format!("DELETE /admin/blobs/{}", digest(12)),
            format!("DELETE /v2/ns/app/manifests/{}", digest(2)),
        ]
    );

    let pruned = store.into_snapshot();
    let names: Vec<String> = pruned
        .images
        .iter()
        .map(|i| i.metadata.name.clone())
        .collect();
    assert_eq!(names, vec![digest(1), digest(3)]);

    let tags = &pruned.image_streams[0].status.tags;
    let history = |tag: &str| -> Vec<String> {
        tags[tag].items.iter().map(|e| e.image.clone()).collect()
    };
    assert_eq!(history("latest"), vec![digest(1)]);
    assert_eq!(history("old"), vec![digest(3)]);
}

#[tokio::test]
async fn test_unhealthy_registry_deletes_nothing() {
    let registry = StubRegistry::start(|_, _| (500, String::new())).await;
    let snapshot = snapshot(&registry.addr);
    let store = SnapshotStore::new(snapshot.clone());
    let mut pruner = Pruner::new(snapshot.clone(), options(), client());

    let err = prune(&mut pruner, &store).await.unwrap_err();
    assert!(matches!(err, PruneError::Ping { .. }));
    assert_eq!(registry.requests(), vec!["GET /healthz".to_string()]);
    assert_eq!(store.into_snapshot(), snapshot);
}

#[tokio::test]
async fn test_registry_failure_keeps_images() {
    let registry = StubRegistry::start(|method, path| match (method, path) {
        ("GET", "/healthz") => (200, "{}".to_string()),
        ("DELETE", p) if p.starts_with("/admin/blobs/") => (500, String::new()),
        _ => (202, String::new()),
    })
    .await;
    let snapshot = snapshot(&registry.addr);
    let store = SnapshotStore::new(snapshot.clone());
    let mut pruner = Pruner::new(snapshot, options(), client());

    let err = prune(&mut pruner, &store).await.unwrap_err();
    let PruneError::Aggregate(errors) = err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(errors.len(), 1);
    assert!(errors
        .to_string()
        .starts_with(&format!("error removing blob {} from the registry", digest(12))));

    // the stream was already scrubbed, but the image object survives for the next run
    let pruned = store.into_snapshot();
    assert_eq!(pruned.images.len(), 3);
    assert_eq!(pruned.image_streams[0].status.tags["latest"].items.len(), 1);
}
