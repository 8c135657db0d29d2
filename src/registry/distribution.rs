use super::{DigestSet, RegistryAdapter, endpoint};
use crate::error::Error;
use crate::secret_string::SecretString;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

// Multi-architecture index first, then the single-platform manifest.
const MANIFEST_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json",
];

#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Adapter for registries implementing the Docker Registry HTTP API V2 /
/// OCI distribution spec.
///
/// The digest is read from the `Docker-Content-Digest` header of the manifest
/// response; manifest bodies are never decoded.
pub struct DistributionAdapter {
    client: Client,
    base_url: String,
    credentials: Option<BasicCredentials>,
}

enum Authorization {
    Anonymous,
    Bearer(String),
    Basic(BasicCredentials),
}

impl Authorization {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Anonymous => request,
            Authorization::Bearer(token) => request.bearer_auth(token),
            Authorization::Basic(credentials) => request.basic_auth(
                &credentials.username,
                Some(credentials.password.expose_secret()),
            ),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: String,
    scope: String,
}

impl BearerChallenge {
    /// Parses `Bearer realm="...",service="...",scope="..."`.
    fn parse(header: &str) -> Result<Self, Error> {
        let params_re = Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|([^,\s]+))"#)
            .map_err(|e| Error::Auth(format!("invalid challenge pattern: {}", e)))?;

        let params: HashMap<String, String> = params_re
            .captures_iter(header)
            .filter_map(|caps| {
                let value = caps.get(2).or_else(|| caps.get(3))?;
                Some((caps[1].to_ascii_lowercase(), value.as_str().to_string()))
            })
            .collect();

        let param = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                Error::Auth(format!(
                    "bearer challenge {:?} is missing the {} parameter",
                    header, name
                ))
            })
        };

        Ok(BearerChallenge {
            realm: param("realm")?,
            service: param("service")?,
            scope: param("scope")?,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl DistributionAdapter {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        credentials: Option<BasicCredentials>,
    ) -> Self {
        DistributionAdapter {
            client,
            base_url: base_url.into(),
            credentials,
        }
    }

    async fn authorize(&self, manifest_url: &str) -> Result<Authorization, Error> {
        let response = self
            .client
            .head(manifest_url)
            .send()
            .await
            .map_err(|e| Error::transport(manifest_url, e))?;

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);

        match challenge {
            Some(challenge)
                if challenge
                    .get(..6)
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer")) =>
            {
                let challenge = BearerChallenge::parse(challenge)?;
                let token = self.fetch_token(&challenge).await?;
                Ok(Authorization::Bearer(token))
            }
            _ => Ok(match &self.credentials {
                Some(credentials) => Authorization::Basic(credentials.clone()),
                None => Authorization::Anonymous,
            }),
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, Error> {
        debug!(
            "Requesting bearer token from {} for scope {}",
            challenge.realm, challenge.scope
        );
        let mut request = self.client.get(&challenge.realm).query(&[
            ("service", challenge.service.as_str()),
            ("scope", challenge.scope.as_str()),
        ]);
        if let Some(credentials) = &self.credentials {
            request = Authorization::Basic(credentials.clone()).apply(request);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(&challenge.realm, e))?;
        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token endpoint {} returned status {}",
                challenge.realm,
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("invalid token response from {}: {}", challenge.realm, e)))?;

        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::Auth(format!("token endpoint {} returned no token", challenge.realm)))
    }

    async fn fetch_manifest_digests(
        &self,
        manifest_url: &str,
        accept: &str,
        authorization: &Authorization,
    ) -> Result<Vec<String>, Error> {
        let request = self.client.get(manifest_url).header(ACCEPT, accept);
        let response = authorization
            .apply(request)
            .send()
            .await
            .map_err(|e| Error::transport(manifest_url, e))?;

        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "{} returned status {} for {}",
                manifest_url,
                response.status(),
                accept
            )));
        }

        let digests: Vec<String> = response
            .headers()
            .get_all(DOCKER_CONTENT_DIGEST)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();

        if digests.is_empty() {
            return Err(Error::Protocol(format!(
                "{} did not return a Docker-Content-Digest header",
                manifest_url
            )));
        }
        Ok(digests)
    }
}

#[async_trait]
impl RegistryAdapter for DistributionAdapter {
    async fn digests(&self, repository: &str, tag: &str) -> Result<DigestSet, Error> {
        let manifest_url = endpoint(&self.base_url, &format!("{}/manifests/{}", repository, tag));
        let authorization = self.authorize(&manifest_url).await?;

        let mut digests = DigestSet::new();
        let mut first_error = None;
        for accept in MANIFEST_MEDIA_TYPES {
            match self
                .fetch_manifest_digests(&manifest_url, accept, &authorization)
                .await
            {
                Ok(found) => found.into_iter().for_each(|digest| digests.insert(digest)),
                Err(e) => {
                    debug!("Manifest lookup for {}:{} failed: {}", repository, tag, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if digests.is_empty() => Err(e),
            _ => Ok(digests),
        }
    }
}
