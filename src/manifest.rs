//! Known-good SHA-256 digests for release archives
//!
//! The table ships inside the binary (`checksums.toml`) and is parsed once.
//! It is never modified at runtime; an absent URL means "untested", which the
//! installer handles according to its [`UnverifiedPolicy`](crate::installer::UnverifiedPolicy).

use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const EMBEDDED_SOURCE: &str = include_str!("checksums.toml");

static EMBEDDED: OnceLock<ChecksumManifest> = OnceLock::new();

/// Immutable mapping from download URL to hex SHA-256 digest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, String>,
}

impl ChecksumManifest {
    /// The manifest compiled into this binary for `traefik`
    pub fn embedded() -> &'static ChecksumManifest {
        EMBEDDED.get_or_init(|| {
            Self::parse(EMBEDDED_SOURCE, "traefik")
                .expect("embedded checksums.toml is valid (covered by tests)")
        })
    }

    /// Parse the `[<artifact>]` table of a checksum file
    pub fn parse(source: &str, artifact: &str) -> anyhow::Result<Self> {
        let tables: BTreeMap<String, BTreeMap<String, String>> =
            toml::from_str(source).context("checksum manifest is not valid TOML")?;
        let table = tables
            .get(artifact)
            .with_context(|| format!("checksum manifest has no [{}] table", artifact))?;

        for (url, digest) in table {
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("invalid SHA-256 digest for {}: {:?}", url, digest);
            }
        }

        Ok(Self::from_entries(
            table.iter().map(|(url, digest)| (url.clone(), digest.clone())),
        ))
    }

    /// Build a manifest from explicit `(url, digest)` pairs
    pub fn from_entries<I, U, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, D)>,
        U: Into<String>,
        D: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(url, digest)| (url.into(), digest.into().to_ascii_lowercase()))
                .collect(),
        }
    }

    /// Expected digest for a URL, or `None` for an untested artifact
    pub fn digest_for(&self, url: &str) -> Option<&str> {
        self.entries.get(url).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Versions that have at least one recorded digest, newest first
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<(Vec<u64>, String)> = self
            .entries
            .keys()
            .filter_map(|url| version_in_url(url))
            .map(|v| (version_key(&v), v))
            .collect();
        versions.sort();
        versions.dedup();
        versions.into_iter().rev().map(|(_, v)| v).collect()
    }
}

/// Extract `X.Y.Z` from the `/vX.Y.Z/` path segment of a release URL
fn version_in_url(url: &str) -> Option<String> {
    url.split('/').find_map(|segment| {
        let version = segment.strip_prefix('v')?;
        let parts: Vec<&str> = version.split('.').collect();
        let numeric = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        numeric.then(|| version.to_string())
    })
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect()
}
