use std::fmt;

/// Defaults applied to image strings that omit their registry, namespace or tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefaults {
    pub registry: String,
    /// Namespace prepended to single-segment names, e.g. `nginx` -> `library/nginx`
    pub namespace: String,
    pub tag: String,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        ImageDefaults {
            registry: "docker.io".to_string(),
            namespace: "library".to_string(),
            tag: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Self {
        Self::parse_with(s, &ImageDefaults::default())
    }

    /// Splits an image string into registry, repository and tag.
    ///
    /// Parsing never fails. Only strings with at least three `/`-separated
    /// segments are considered to carry a registry host, so a two-segment
    /// reference such as `registry.local:5000/app` is read as a repository on
    /// the default registry.
    pub fn parse_with(s: &str, defaults: &ImageDefaults) -> Self {
        let mut segments: Vec<&str> = s.split('/').collect();

        let registry = if segments.len() >= 3 {
            segments.remove(0).to_string()
        } else {
            defaults.registry.clone()
        };

        let joined = if segments.len() == 1 {
            format!("{}/{}", defaults.namespace, segments[0])
        } else {
            segments.join("/")
        };

        let (repository, tag) = match joined.rsplit_once(':') {
            Some((repository, tag)) if !tag.is_empty() => (repository.to_string(), tag.to_string()),
            Some((repository, _)) => (repository.to_string(), defaults.tag.clone()),
            None => (joined, defaults.tag.clone()),
        };

        Self {
            registry,
            repository,
            tag,
        }
    }
}
