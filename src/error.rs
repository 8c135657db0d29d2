use thiserror::Error;

/// Failures that can occur while evaluating a single container or rollout.
///
/// None of these abort a reconciliation pass; the controller logs them and
/// moves on to the next unit of work.
#[derive(Debug, Error)]
pub enum Error {
    #[error("image id {0:?} does not contain an @-separated digest")]
    MalformedRuntimeId(String),

    #[error("no registry adapter registered for host {0}")]
    UnknownRegistry(String),

    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected registry response: {0}")]
    Protocol(String),

    #[error("{context}: {source}")]
    ClusterApi {
        context: String,
        #[source]
        source: kube::Error,
    },
}

impl Error {
    pub(crate) fn transport(url: &str, source: reqwest::Error) -> Self {
        Error::Transport {
            url: url.to_owned(),
            source,
        }
    }

    pub(crate) fn cluster(context: impl Into<String>, source: kube::Error) -> Self {
        Error::ClusterApi {
            context: context.into(),
            source,
        }
    }
}
