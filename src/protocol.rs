//! Deleting layer links, blobs and manifests over the registry's HTTP API.
//!
//! Every request goes to https first.  If the connection itself fails it is retried once over
//! plain http; any answer from the registry is final.  Only `202` and `204` mean the object was
//! deleted, and a `404` means it is already gone.  Every other answer is an error; payloads in
//! the registry's `{"errors": [...]}` format are decoded and handed back as
//! [`DeleteError::Registry`] so that callers can tell what the registry complained about.

use std::fmt;

use anyhow::Result;
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::prune::{BlobDeleter, LayerLinkDeleter, ManifestDeleter};

/// One entry of a registry error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code.replace('_', " ").to_lowercase();
        write!(f, "{code}: {}", self.message)
    }
}

/// The body of a failed registry API call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegistryErrors {
    #[serde(default)]
    pub errors: Vec<RegistryError>,
}

impl fmt::Display for RegistryErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("<nil>"),
            [only] => write!(f, "{only}"),
            errors => {
                f.write_str("errors:\n")?;
                for error in errors {
                    writeln!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    /// The registry explained why it refused.
    #[error("{0}")]
    Registry(RegistryErrors),
    #[error("{url}: {status}")]
    Status { url: String, status: StatusCode },
    #[error(
        "{url}: {source}\nAre you trying to connect to a TLS-enabled registry without TLS?"
    )]
    PlainTextToTls {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Whether a failed plain http request was most likely answered with TLS.
fn looks_like_tls(error: &reqwest::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(error);
    while let Some(e) = source {
        let message = e.to_string();
        if message.contains("malformed HTTP response")
            || message.contains("invalid HTTP version")
            || message.contains("HTTP/0.9")
        {
            return true;
        }
        source = e.source();
    }
    false
}

async fn decode_errors(response: Response) -> Option<RegistryErrors> {
    let body = response.bytes().await.ok()?;
    match serde_json::from_slice::<RegistryErrors>(&body) {
        Ok(errors) if !errors.errors.is_empty() => Some(errors),
        Ok(_) => None,
        Err(e) => {
            debug!("Response is not a registry error: {e}");
            None
        }
    }
}

async fn check_response(url: &str, response: Response) -> Result<(), DeleteError> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        warn!("Unable to prune {url}, returned {status}");
        return Ok(());
    }

    if status == StatusCode::NO_CONTENT || status == StatusCode::ACCEPTED {
        return Ok(());
    }

    info!("Unexpected status code in response: {status}");
    Err(match decode_errors(response).await {
        Some(errors) => DeleteError::Registry(errors),
        None => DeleteError::Status {
            url: url.to_string(),
            status,
        },
    })
}

/// Issues `DELETE` for `url`, which is given without a scheme.
pub async fn delete_from_registry(client: &Client, url: &str) -> Result<(), DeleteError> {
    let https = format!("https://{url}");
    debug!("Trying https for {url}");
    let error = match client.delete(&https).send().await {
        Ok(response) => return check_response(&https, response).await,
        Err(source) => DeleteError::Http { url: https, source },
    };
    debug!("{error}, retrying with http");

    let http = format!("http://{url}");
    match client.delete(&http).send().await {
        Ok(response) => check_response(&http, response).await,
        Err(source) if looks_like_tls(&source) => {
            Err(DeleteError::PlainTextToTls { url: http, source })
        }
        Err(source) => {
            debug!("https also failed: {error}");
            Err(DeleteError::Http { url: http, source })
        }
    }
}

/// Removes a blob's link from one repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryLayerLinkDeleter;

impl LayerLinkDeleter for RegistryLayerLinkDeleter {
    async fn delete_layer_link(
        &self,
        client: &Client,
        registry_url: &str,
        repo: &str,
        link_name: &str,
    ) -> Result<()> {
        info!("Deleting layer link {link_name} from repository {repo}");
        delete_from_registry(client, &format!("{registry_url}/v2/{repo}/blobs/{link_name}"))
            .await?;
        Ok(())
    }
}

/// Removes a blob from the registry's storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryBlobDeleter;

impl BlobDeleter for RegistryBlobDeleter {
    async fn delete_blob(&self, client: &Client, registry_url: &str, blob: &str) -> Result<()> {
        info!("Deleting blob {blob}");
        delete_from_registry(client, &format!("{registry_url}/admin/blobs/{blob}")).await?;
        Ok(())
    }
}

/// Removes a manifest from one repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryManifestDeleter;

impl ManifestDeleter for RegistryManifestDeleter {
    async fn delete_manifest(
        &self,
        client: &Client,
        registry_url: &str,
        repo: &str,
        manifest: &str,
    ) -> Result<()> {
        info!("Deleting manifest link {manifest} from repository {repo}");
        delete_from_registry(client, &format!("{registry_url}/v2/{repo}/manifests/{manifest}"))
            .await?;
        Ok(())
    }
}
