use std::net::IpAddr;

use anyhow::anyhow;
use log::{debug, info};
use reqwest::{Client, StatusCode};

use crate::{
    error::AggregateError,
    model::{Image, ImageStream},
    reference::{ImageReference, ReferenceError},
};

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no managed image found")]
    NoManagedImage,
    #[error("unable to parse {0:?}")]
    Parse(String, #[source] ReferenceError),
    #[error("{0:?} does not name a registry")]
    NoRegistry(String),
}

fn registry_of(pull_spec: &str) -> Result<String, LocateError> {
    let reference = ImageReference::parse(pull_spec)
        .map_err(|e| LocateError::Parse(pull_spec.to_string(), e))?;
    if reference.registry.is_empty() {
        return Err(LocateError::NoRegistry(pull_spec.to_string()));
    }
    Ok(reference.registry)
}

/// Works out the registry's `host[:port]` from what was pushed to it.
///
/// The newest managed image's pull spec wins.  Without managed images, the repository reported
/// by the newest image stream that has one is used.
pub fn determine_registry(
    images: &[&Image],
    streams: &[&ImageStream],
) -> Result<String, LocateError> {
    let mut images: Vec<&Image> = images.iter().copied().filter(|i| i.is_managed()).collect();
    images.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });

    let pull_spec = match images.first() {
        Some(image) => image.docker_image_reference.clone(),
        None => {
            let mut streams = streams.to_vec();
            streams.sort_by(|a, b| {
                b.metadata
                    .creation_timestamp
                    .cmp(&a.metadata.creation_timestamp)
            });
            let stream = streams
                .into_iter()
                .find(|s| !s.status.docker_image_repository.is_empty())
                .ok_or(LocateError::NoManagedImage)?;
            debug!(
                "Using repository {} of stream {}",
                stream.status.docker_image_repository,
                stream.full_name()
            );
            stream.status.docker_image_repository.clone()
        }
    };

    registry_of(&pull_spec)
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || first & 0xfe00 == 0xfc00 // unique local
                || first & 0xffc0 == 0xfe80 // link local
                || ip.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

/// Whether `registry` (`host`, `host:port`, `[v6]:port` or a bare IPv6 address) is on a
/// loopback, private or link-local network.
pub fn is_private_address(registry: &str) -> bool {
    if let Ok(ip) = registry.parse::<IpAddr>() {
        return is_private_ip(ip);
    }

    let host = if let Some(rest) = registry.strip_prefix('[') {
        rest.split_once(']').map_or(rest, |(host, _)| host)
    } else {
        registry.split_once(':').map_or(registry, |(host, _)| host)
    };

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => is_private_ip(ip),
        Err(_) => false,
    }
}

/// Liveness check of a registry.
#[allow(async_fn_in_trait)]
pub trait RegistryPinger {
    /// Returns the scheme-qualified URL the registry answered on.
    async fn ping(&self, registry: &str) -> Result<String, AggregateError>;
}

/// Probes `/healthz` over https, then over http when that's allowed.
#[derive(Debug, Clone)]
pub struct DefaultRegistryPinger {
    pub client: Client,
    pub insecure: bool,
}

impl RegistryPinger for DefaultRegistryPinger {
    async fn ping(&self, registry: &str) -> Result<String, AggregateError> {
        let mut errors = AggregateError::new();

        for scheme in ["https", "http"] {
            if scheme == "http" && !self.insecure && !is_private_address(registry) {
                debug!("Not trying plain http for {registry}");
                break;
            }

            let base = format!("{scheme}://{registry}");
            let url = format!("{base}/healthz");
            debug!("Pinging {url}");
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    info!("Registry {base} is healthy");
                    return Ok(base);
                }
                Ok(response) => {
                    errors.push(anyhow!("{url}: unexpected status {}", response.status()));
                }
                Err(e) => {
                    errors.push(anyhow::Error::new(e).context(format!("{url}: request failed")));
                }
            }
        }

        Err(errors)
    }
}

/// Stands in for the health check when nothing is going to be deleted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRegistryPinger;

impl RegistryPinger for DryRunRegistryPinger {
    async fn ping(&self, registry: &str) -> Result<String, AggregateError> {
        Ok(format!("https://{registry}"))
    }
}

/// The pinger selected by [`PruneOptions::dry_run`](crate::config::PruneOptions::dry_run).
#[derive(Debug, Clone)]
pub enum Pinger {
    Default(DefaultRegistryPinger),
    DryRun(DryRunRegistryPinger),
}

impl Pinger {
    pub fn new(client: Client, dry_run: bool, insecure: bool) -> Self {
        if dry_run {
            Pinger::DryRun(DryRunRegistryPinger)
        } else {
            Pinger::Default(DefaultRegistryPinger { client, insecure })
        }
    }
}

impl RegistryPinger for Pinger {
    async fn ping(&self, registry: &str) -> Result<String, AggregateError> {
        match self {
            Pinger::Default(pinger) => pinger.ping(registry).await,
            Pinger::DryRun(pinger) => pinger.ping(registry).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::*;

    #[test]
    fn test_newest_managed_image_wins() {
        let mut old = image(1, Age::Hours(5));
        old.docker_image_reference = format!("old.example.com/ns/app@{}", digest(1));
        let new = image(2, Age::Hours(1));
        let mut external = unmanaged(image(3, Age::Minutes(1)));
        external.docker_image_reference = format!("docker.io/library/app@{}", digest(3));

        let registry = determine_registry(&[&old, &new, &external], &[]).unwrap();
        assert_eq!(registry, REGISTRY.to_string());
    }

    #[test]
    fn test_stream_fallback() {
        let mut newest = stream("ns", "newest", Age::Hours(1), &[]);
        newest.status.docker_image_repository = "new.example.com/ns/newest".into();
        let mut oldest = stream("ns", "oldest", Age::Hours(9), &[]);
        oldest.status.docker_image_repository = "old.example.com/ns/oldest".into();
        let mut empty = stream("ns", "empty", Age::Minutes(5), &[]);
        empty.status.docker_image_repository.clear();
        let external = unmanaged(image(3, Age::Minutes(1)));

        let registry = determine_registry(&[&external], &[&newest, &empty, &oldest]).unwrap();
        assert_eq!(registry, "new.example.com".to_string());
    }

    #[test]
    fn test_no_registry() {
        assert!(matches!(
            determine_registry(&[], &[]),
            Err(LocateError::NoManagedImage)
        ));
        assert_eq!(
            determine_registry(&[], &[]).unwrap_err().to_string(),
            "no managed image found".to_string()
        );

        let mut local = image(1, Age::Hours(1));
        local.docker_image_reference = format!("ns/app@{}", digest(1));
        assert!(matches!(
            determine_registry(&[&local], &[]),
            Err(LocateError::NoRegistry(_))
        ));
    }

    #[test]
    fn test_private_addresses() {
        for private in [
            "localhost",
            "localhost:5000",
            "127.0.0.1:5000",
            "10.0.0.1",
            "172.30.1.1:5000",
            "192.168.1.20:443",
            "169.254.0.5",
            "::1",
            "[::1]:5000",
            "[fd00::1]:5000",
            "fe80::1",
        ] {
            assert!(is_private_address(private), "{private}");
        }
        for public in [
            "registry.example.com:5000",
            "8.8.8.8",
            "172.32.0.1:5000",
            "[2001:db8::1]:5000",
        ] {
            assert!(!is_private_address(public), "{public}");
        }
    }

    #[tokio::test]
    async fn test_dry_run_pinger() {
        let pinger = Pinger::new(Client::new(), true, false);
        assert_eq!(pinger.ping(REGISTRY).await.unwrap(), format!("https://{REGISTRY}"));
    }
}
