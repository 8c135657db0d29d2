use super::{DigestSet, RegistryAdapter, endpoint};
use crate::error::Error;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Docker Hub's repository tag endpoint, `GET <base>/<name>/tags/<tag>`.
pub struct LegacyTagsAdapter {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TagInfo {
    #[serde(default)]
    images: Vec<TagImage>,
}

#[derive(Deserialize)]
struct TagImage {
    digest: Option<String>,
}

impl LegacyTagsAdapter {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        LegacyTagsAdapter {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RegistryAdapter for LegacyTagsAdapter {
    async fn digests(&self, repository: &str, tag: &str) -> Result<DigestSet, Error> {
        let url = endpoint(&self.base_url, &format!("{}/tags/{}", repository, tag));
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

        let info: TagInfo = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid tag info from {}: {}", url, e)))?;

        let digests: DigestSet = info.images.into_iter().filter_map(|image| image.digest).collect();
        if digests.is_empty() {
            return Err(Error::Protocol(format!("{} listed no images for tag {}", url, tag)));
        }
        Ok(digests)
    }
}
