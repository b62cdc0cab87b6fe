use std::fmt;

use crate::util::split_digest;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference {0:?}: {1}")]
    Invalid(String, &'static str),
    #[error("invalid digest in image reference {0:?}: {1}")]
    Digest(String, String),
    #[error("expected exactly one @ in the ImageStreamImage name {0:?}")]
    StreamImageName(String),
}

/// A parsed `[registry/][namespace/]name[:tag][@digest]` pull spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    /// The content digest the reference is pinned to, if any.
    pub id: String,
}

fn is_registry_host(component: &str) -> bool {
    component == "localhost" || component.contains(['.', ':'])
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
}

impl ImageReference {
    pub fn parse(spec: &str) -> Result<Self, ReferenceError> {
        let invalid = |reason| ReferenceError::Invalid(spec.to_string(), reason);

        if spec.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let mut reference = ImageReference::default();

        let name = match spec.split_once('@') {
            Some((name, digest)) => {
                split_digest(digest)
                    .map_err(|e| ReferenceError::Digest(spec.to_string(), e.to_string()))?;
                reference.id = digest.to_string();
                name
            }
            None => spec,
        };

        let mut components: Vec<&str> = name.split('/').collect();
        if components.len() > 1 && is_registry_host(components[0]) {
            reference.registry = components.remove(0).to_string();
        }

        // The tag can only appear in the last component; a colon in an earlier one would have
        // made it a registry host.
        let last = components.pop().ok_or_else(|| invalid("missing name"))?;
        let last = match last.rsplit_once(':') {
            Some((last, tag)) => {
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                reference.tag = tag.to_string();
                last
            }
            None => last,
        };

        if !valid_path_component(last) || !components.iter().all(|c| valid_path_component(c)) {
            return Err(invalid("invalid repository name"));
        }
        reference.name = last.to_string();
        reference.namespace = components.join("/");

        Ok(reference)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        f.write_str(&self.name)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.id.is_empty() {
            write!(f, "@{}", self.id)?;
        }
        Ok(())
    }
}

/// Splits an `ImageStreamImage` name (`stream@digest`) into the stream name and image id.
pub fn parse_image_stream_image_name(name: &str) -> Result<(&str, &str), ReferenceError> {
    let err = || ReferenceError::StreamImageName(name.to_string());
    let mut parts = name.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(stream), Some(id), None) if !stream.is_empty() && !id.is_empty() => {
            Ok((stream, id))
        }
        _ => Err(err()),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn sha(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    #[test]
    fn test_parse_full_reference() {
        let spec = format!("registry.example.com:5000/ns/app:latest@{}", sha('a'));
        let r = ImageReference::parse(&spec).unwrap();
        assert_eq!(r.registry.as_str(), "registry.example.com:5000");
        assert_eq!(r.namespace.as_str(), "ns");
        assert_eq!(r.name.as_str(), "app");
        assert_eq!(r.tag.as_str(), "latest");
        assert_eq!(r.id, sha('a'));
        assert_eq!(r.to_string(), spec);
    }

    #[test]
    fn test_parse_short_references() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(
            (r.registry.as_str(), r.namespace.as_str(), r.name.as_str()),
            ("", "", "nginx")
        );

        let r = ImageReference::parse("library/nginx:1.25").unwrap();
        assert_eq!(r.namespace.as_str(), "library");
        assert_eq!(r.tag.as_str(), "1.25");
        assert!(r.id.is_empty());

        let r = ImageReference::parse("localhost/app").unwrap();
        assert_eq!(r.registry.as_str(), "localhost");
        assert_eq!(r.name.as_str(), "app");

        // a lone host-looking name is still just a name
        let r = ImageReference::parse("localhost").unwrap();
        assert_eq!(r.registry.as_str(), "");
        assert_eq!(r.name.as_str(), "localhost");

        let r = ImageReference::parse("172.30.1.1:5000/ns/app").unwrap();
        assert_eq!(r.registry.as_str(), "172.30.1.1:5000");
        assert_eq!(r.namespace.as_str(), "ns");
    }

    #[test]
    fn test_parse_invalid_references() {
        assert_eq!(ImageReference::parse(""), Err(ReferenceError::Empty));
        assert!(ImageReference::parse("ns/App").is_err());
        assert!(ImageReference::parse("ns//app").is_err());
        assert!(ImageReference::parse("app:").is_err());
        assert!(matches!(
            ImageReference::parse("app@sha256:abc"),
            Err(ReferenceError::Digest(..))
        ));
    }

    #[test]
    fn test_stream_image_name() {
        assert_eq!(
            parse_image_stream_image_name("ruby@sha256:aa"),
            Ok(("ruby", "sha256:aa"))
        );
        assert!(parse_image_stream_image_name("ruby").is_err());
        assert!(parse_image_stream_image_name("@sha256:aa").is_err());
        assert!(parse_image_stream_image_name("ruby@").is_err());
        assert!(parse_image_stream_image_name("a@b@c").is_err());
    }
}
