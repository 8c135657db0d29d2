use super::{DigestSet, RegistryAdapter, endpoint};
use crate::error::Error;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Quay style repository API: `GET <base>/<name>/tag/?specificTag=<tag>`.
pub struct TagListAdapter {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    manifest_digest: String,
    #[serde(default)]
    is_manifest_list: bool,
}

impl TagListAdapter {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        TagListAdapter {
            client,
            base_url: base_url.into(),
        }
    }
}

/// Keeps entries up to and including the first single-platform manifest, so a
/// manifest list contributes itself plus the manifest that follows it.
fn collect_digests(tags: Vec<TagEntry>) -> DigestSet {
    let mut digests = DigestSet::new();
    for tag in tags {
        digests.insert(tag.manifest_digest);
        if !tag.is_manifest_list {
            break;
        }
    }
    digests
}

#[async_trait]
impl RegistryAdapter for TagListAdapter {
    async fn digests(&self, repository: &str, tag: &str) -> Result<DigestSet, Error> {
        let url = endpoint(&self.base_url, &format!("{}/tag/", repository));
        let response = self
            .client
            .get(&url)
            .query(&[("specificTag", tag)])
            .send()
            .await
            .map_err(|e| Error::transport(&url, e))?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        let body: TagListResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid tag list from {}: {}", url, e)))?;

        if body.tags.is_empty() {
            return Err(Error::Protocol(format!("{} returned no entries for tag {}", url, tag)));
        }
        Ok(collect_digests(body.tags))
    }
}
