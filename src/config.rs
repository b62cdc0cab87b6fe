//! Pruning policy.
//!
//! [`PruneOptions`] can be built in code, parsed from a TOML file, or (in `imgprune`) assembled
//! from command-line flags layered on top of a file.  A typical file looks like:
//!
//! ```toml
//! keep-younger-than = "1h30m"
//! keep-tag-revisions = 3
//! all-images = true
//! registry-url = "registry.example.com:5000"
//! ```

use std::path::Path;

use chrono::TimeDelta;
use fn_error_context::context;
use serde::{Deserialize, Deserializer};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid duration {0:?}")]
pub struct DurationError(String);

/// Parses durations like `90s`, `60m`, `1h30m` or `250ms`.  A bare `0` is accepted too.
pub fn parse_duration(text: &str) -> Result<TimeDelta, DurationError> {
    let err = || DurationError(text.to_string());

    if text == "0" {
        return Ok(TimeDelta::zero());
    }
    if text.is_empty() {
        return Err(err());
    }

    let mut total = TimeDelta::zero();
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        if digits == 0 {
            return Err(err());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let delta = match &rest[..unit_len] {
            "ms" => TimeDelta::try_milliseconds(value),
            "s" => TimeDelta::try_seconds(value),
            "m" => TimeDelta::try_minutes(value),
            "h" => TimeDelta::try_hours(value),
            "d" => TimeDelta::try_days(value),
            _ => None,
        }
        .ok_or_else(err)?;
        total = total.checked_add(&delta).ok_or_else(err)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Settings that decide which images are candidates for pruning and how the registry is
/// contacted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PruneOptions {
    /// Images, streams and terminated pods younger than this are left alone.
    #[serde(deserialize_with = "deserialize_duration")]
    pub keep_younger_than: TimeDelta,
    /// Number of most recent revisions of each tag that are always kept.
    pub keep_tag_revisions: usize,
    /// Decide by size instead: images over their namespace's image size limit are candidates,
    /// everything else referenced from a stream is kept.  Replaces the two settings above.
    pub prune_over_size_limit: bool,
    /// Also consider images that weren't pushed to the integrated registry.
    pub all_images: bool,
    /// Only remove tag references from streams in this namespace.  Nothing is deleted from the
    /// registry and no image objects are removed.
    pub namespace: Option<String>,
    /// Skip the registry health check.
    pub dry_run: bool,
    /// Registry to talk to, as `host[:port]`.  Worked out from the images when unset.
    pub registry_url: Option<String>,
    /// Allow plain http when https fails.
    pub insecure: bool,
    /// Maximum number of registry requests in flight within one phase.
    pub concurrency: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        PruneOptions {
            keep_younger_than: TimeDelta::minutes(60),
            keep_tag_revisions: 3,
            prune_over_size_limit: false,
            all_images: true,
            namespace: None,
            dry_run: false,
            registry_url: None,
            insecure: false,
            concurrency: 4,
        }
    }
}

impl PruneOptions {
    /// Parse options from TOML content.  Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid or names an unknown setting.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reads options from a TOML file.
    #[context("Loading prune options from {}", path.as_ref().display())]
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_toml(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0"), Ok(TimeDelta::zero()));
        assert_eq!(parse_duration("90s"), Ok(TimeDelta::seconds(90)));
        assert_eq!(parse_duration("60m"), Ok(TimeDelta::hours(1)));
        assert_eq!(parse_duration("1h30m"), Ok(TimeDelta::minutes(90)));
        assert_eq!(parse_duration("2d"), Ok(TimeDelta::hours(48)));
        assert_eq!(parse_duration("250ms"), Ok(TimeDelta::milliseconds(250)));

        for bad in ["", "h", "10", "10x", "1h-5m", "m10"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_defaults() {
        let options = PruneOptions::from_toml("").unwrap();
        assert_eq!(options, PruneOptions::default());
        assert_eq!(options.keep_younger_than, TimeDelta::minutes(60));
        assert_eq!(options.keep_tag_revisions, 3);
        assert!(options.all_images);
    }

    #[test]
    fn test_parse_config() {
        let options = PruneOptions::from_toml(
            r#"
keep-younger-than = "2h"
keep-tag-revisions = 5
all-images = false
namespace = "team-a"
registry-url = "registry.example.com:5000"
"#,
        )
        .unwrap();
        assert_eq!(options.keep_younger_than, TimeDelta::hours(2));
        assert_eq!(options.keep_tag_revisions, 5);
        assert!(!options.all_images);
        assert_eq!(options.namespace.as_deref(), Some("team-a"));
        assert_eq!(options.registry_url.as_deref(), Some("registry.example.com:5000"));
        assert_eq!(options.concurrency, 4);

        assert!(PruneOptions::from_toml("keep-younger-than = \"soon\"").is_err());
        assert!(PruneOptions::from_toml("keep-everything = true").is_err());
    }

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "keep-tag-revisions = 1\ninsecure = true").unwrap();
        let options = PruneOptions::load(file.path()).unwrap();
        assert_eq!(options.keep_tag_revisions, 1);
        assert!(options.insecure);

        let err = PruneOptions::load("/nonexistent/prune.toml").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Loading prune options from /nonexistent/prune.toml".to_string()
        );
    }
}
