//! Resolution of an image tag to the set of manifest digests it currently points to.
//!
//! Registries disagree on how to answer that question, so each supported API
//! lives in its own adapter and [`RegistryResolver`] dispatches on the
//! registry host of the image reference.

mod digest_index;
mod distribution;
mod legacy_tags;
mod tag_list;

pub use digest_index::DigestIndexAdapter;
pub use distribution::{BasicCredentials, DistributionAdapter};
pub use legacy_tags::LegacyTagsAdapter;
pub use tag_list::TagListAdapter;

use crate::config::{Config, RegistryConfig, RegistryProtocol};
use crate::error::Error;
use crate::image_reference::ImageReference;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Certificate, Client};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Every digest currently published under one tag.
///
/// A tag may point at a manifest list as well as the per-architecture
/// manifests below it, so a running digest is up to date when it is a member
/// of this set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSet(BTreeSet<String>);

impl DigestSet {
    pub fn new() -> Self {
        DigestSet(BTreeSet::new())
    }

    pub fn insert(&mut self, digest: impl Into<String>) {
        self.0.insert(digest.into());
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.0.contains(digest)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for DigestSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        DigestSet(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for DigestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.iter().collect::<Vec<_>>().join(", "))
    }
}

/// One registry API capable of listing the digests behind a tag.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    async fn digests(&self, repository: &str, tag: &str) -> Result<DigestSet, Error>;
}

/// Anything that can answer "which digests does this image tag point to".
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, image: &ImageReference) -> Result<DigestSet, Error>;
}

/// Static host -> adapter table, built once at startup.
#[derive(Clone, Default)]
pub struct RegistryResolver {
    adapters: HashMap<String, Arc<dyn RegistryAdapter>>,
}

impl RegistryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, host: impl Into<String>, adapter: Arc<dyn RegistryAdapter>) -> Self {
        self.register(host, adapter);
        self
    }

    pub fn register(&mut self, host: impl Into<String>, adapter: Arc<dyn RegistryAdapter>) {
        self.adapters.insert(host.into(), adapter);
    }

    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        hosts.sort();
        hosts
    }

    /// Builds the built-in table for the well known public registries and
    /// then applies the registries from the config file on top of it.
    pub fn from_config(config: &Config, client: &Client) -> Self {
        let mut resolver = RegistryResolver::new()
            .with_adapter(
                "docker.io",
                Arc::new(DistributionAdapter::new(
                    client.clone(),
                    "https://registry-1.docker.io/v2",
                    None,
                )),
            )
            .with_adapter(
                "ghcr.io",
                Arc::new(DistributionAdapter::new(client.clone(), "https://ghcr.io/v2", None)),
            )
            .with_adapter(
                "quay.io",
                Arc::new(TagListAdapter::new(
                    client.clone(),
                    "https://quay.io/api/v1/repository",
                )),
            );
        for host in ["gcr.io", "k8s.gcr.io"] {
            resolver.register(
                host,
                Arc::new(DigestIndexAdapter::new(
                    client.clone(),
                    format!("https://{}/v2", host),
                )),
            );
        }

        for registry in &config.registries {
            info!(
                "Registering {:?} registry adapter for host {}",
                registry.protocol, registry.hostname
            );
            resolver.register(registry.hostname.clone(), adapter_for(registry, client));
        }

        resolver
    }
}

fn adapter_for(registry: &RegistryConfig, client: &Client) -> Arc<dyn RegistryAdapter> {
    let base_url = registry.base_url();
    match registry.protocol {
        RegistryProtocol::Distribution => {
            let credentials = registry.username.as_ref().map(|username| BasicCredentials {
                username: username.clone(),
                password: registry.password.clone().unwrap_or_default(),
            });
            Arc::new(DistributionAdapter::new(client.clone(), base_url, credentials))
        }
        RegistryProtocol::LegacyTags => Arc::new(LegacyTagsAdapter::new(client.clone(), base_url)),
        RegistryProtocol::TagList => Arc::new(TagListAdapter::new(client.clone(), base_url)),
        RegistryProtocol::DigestIndex => Arc::new(DigestIndexAdapter::new(client.clone(), base_url)),
    }
}

#[async_trait]
impl DigestResolver for RegistryResolver {
    async fn resolve(&self, image: &ImageReference) -> Result<DigestSet, Error> {
        let adapter = self
            .adapters
            .get(&image.registry)
            .ok_or_else(|| Error::UnknownRegistry(image.registry.clone()))?;

        let digests = adapter.digests(&image.repository, &image.tag).await?;
        debug!("Resolved {} to digests {}", image, digests);
        Ok(digests)
    }
}

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .timeout(Duration::from_secs(config.registry_timeout_seconds))
        .user_agent(concat!("reroller/", env!("CARGO_PKG_VERSION")));

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Joins a base URL and a path without doubling the separating slash.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}
