use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result};
use reqwest::Client;

use crate::{
    model::{Image, ImageStream},
    prune::{BlobDeleter, ImageDeleter, ImageStreamDeleter, LayerLinkDeleter, ManifestDeleter},
};

/// Writes one line per deletion to `out` and succeeds without doing anything.
#[derive(Debug)]
pub struct DescribingDeleter<W> {
    out: Mutex<W>,
}

impl DescribingDeleter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> DescribingDeleter<W> {
    pub fn new(out: W) -> Self {
        DescribingDeleter {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn describe(&self, line: std::fmt::Arguments<'_>) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}").context("Writing description")
    }
}

impl<W: Write> ImageDeleter for DescribingDeleter<W> {
    async fn delete_image(&self, image: &Image) -> Result<()> {
        self.describe(format_args!("image\t{}", image.name()))
    }
}

impl<W: Write> ImageStreamDeleter for DescribingDeleter<W> {
    async fn delete_image_stream(
        &self,
        stream: &ImageStream,
        image: &Image,
        updated_tags: &[String],
    ) -> Result<ImageStream> {
        self.describe(format_args!(
            "stream-tags\t{}\t{}\t{}",
            stream.full_name(),
            image.name(),
            updated_tags.join(",")
        ))?;
        Ok(stream.clone())
    }
}

impl<W: Write> LayerLinkDeleter for DescribingDeleter<W> {
    async fn delete_layer_link(
        &self,
        _client: &Client,
        _registry_url: &str,
        repo: &str,
        link_name: &str,
    ) -> Result<()> {
        self.describe(format_args!("layer-link\t{repo}\t{link_name}"))
    }
}

impl<W: Write> BlobDeleter for DescribingDeleter<W> {
    async fn delete_blob(&self, _client: &Client, _registry_url: &str, blob: &str) -> Result<()> {
        self.describe(format_args!("blob\t{blob}"))
    }
}

impl<W: Write> ManifestDeleter for DescribingDeleter<W> {
    async fn delete_manifest(
        &self,
        _client: &Client,
        _registry_url: &str,
        repo: &str,
        manifest: &str,
    ) -> Result<()> {
        self.describe(format_args!("manifest\t{repo}\t{manifest}"))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{config::PruneOptions, model::Snapshot, prune::Pruner, test::*};

    #[tokio::test]
    async fn test_describe_dry_run() {
        let snapshot = Snapshot {
            images: vec![
                with_layers(image(1, Age::Hours(3)), &[10]),
                with_layers(image(2, Age::Hours(3)), &[11]),
            ],
            image_streams: vec![stream("ns", "is", Age::Hours(3), &[("latest", &[1, 2])])],
            ..Default::default()
        };
        let options = PruneOptions {
            keep_tag_revisions: 1,
            concurrency: 1,
            dry_run: true,
            ..Default::default()
        };
        let d = DescribingDeleter::new(Vec::new());
        let mut pruner = Pruner::with_now(snapshot, options, Client::new(), now());
        pruner.prune(&d, &d, &d, &d, &d).await.unwrap();

        let output = String::from_utf8(d.into_inner()).unwrap();
        let expected = [
            format!("stream-tags\tns/is\t{}\tlatest", digest(2)),
            format!("layer-link\tns/is\t{}", digest(11)),
            format!("blob\t{}", digest(11)),
            format!("manifest\tns/is\t{}", digest(2)),
            format!("image\t{}", digest(2)),
        ];
        assert_eq!(output, expected.map(|line| line + "\n").concat());
    }
}
