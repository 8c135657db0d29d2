use super::{DigestSet, RegistryAdapter, endpoint};
use crate::error::Error;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

/// GCR style `tags/list` endpoint which maps every manifest digest to its tags.
///
/// There is no direct tag lookup, so the whole index is scanned.
pub struct DigestIndexAdapter {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct DigestIndex {
    #[serde(default)]
    manifest: HashMap<String, ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(default)]
    tag: Vec<String>,
}

impl DigestIndexAdapter {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        DigestIndexAdapter {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RegistryAdapter for DigestIndexAdapter {
    async fn digests(&self, repository: &str, tag: &str) -> Result<DigestSet, Error> {
        let url = endpoint(&self.base_url, &format!("{}/tags/list", repository));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transport(&url, e))?;

        if response.status().as_u16() >= 400 {
            return Err(Error::Protocol(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        let index: DigestIndex = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid tag index from {}: {}", url, e)))?;

        let digests: DigestSet = index
            .manifest
            .into_iter()
            .filter(|(_, entry)| entry.tag.iter().any(|t| t == tag))
            .map(|(digest, _)| digest)
            .collect();

        if digests.is_empty() {
            return Err(Error::Protocol(format!("tag {} not found in {}", tag, url)));
        }
        Ok(digests)
    }
}
