use crate::error::Error;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// Pod template annotation holding the RFC3339 time of the last restart.
pub static RESTARTED_AT_ANNOTATION: &str = "reroller.roob.re/restartedAt";
static REROLLER_FIELD_MANAGER: &str = "reroller";

/// A container as declared in the pod template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredContainer {
    pub name: String,
    pub image: String,
    pub pull_policy: Option<String>,
}

impl DeclaredContainer {
    pub fn always_pulls(&self) -> bool {
        self.pull_policy.as_deref() == Some("Always")
    }
}

/// What the container runtime reports for one running container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeContainerStatus {
    pub image: String,
    /// `<image>@<algorithm>:<hex>`, optionally prefixed with a scheme such as `docker-pullable://`
    pub image_id: String,
}

impl RuntimeContainerStatus {
    /// The digest the container is running, i.e. everything after the first `@`.
    pub fn running_digest(&self) -> Result<&str, Error> {
        match self.image_id.split_once('@') {
            Some((_, digest)) if !digest.is_empty() => Ok(digest),
            _ => Err(Error::MalformedRuntimeId(self.image_id.clone())),
        }
    }
}

/// Uniform view over the workload kinds that can be restarted.
#[async_trait]
pub trait Rollout: Send + Sync {
    /// `kind/namespace/name`
    fn name(&self) -> String;
    /// Annotations of the workload object itself.
    fn annotations(&self) -> BTreeMap<String, String>;
    /// Annotations of the pod template.
    fn template_annotations(&self) -> BTreeMap<String, String>;
    fn containers(&self) -> Vec<DeclaredContainer>;
    /// Runtime statuses of every container of every pod matched by the selector.
    async fn container_statuses(&self) -> Result<Vec<RuntimeContainerStatus>, Error>;
    /// Stamps the pod template with the current time and updates the workload.
    async fn restart(&mut self) -> Result<(), Error>;
}

/// Kind specific accessors for the Kubernetes objects behind a [`Rollout`].
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    fn selector(&self) -> BTreeMap<String, String>;
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
    /// Whether at least one replica is serving, so there is something to restart.
    fn is_ready(&self) -> bool;
}

impl Workload for Deployment {
    fn selector(&self) -> BTreeMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentStatus
    fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
            > 0
    }
}

impl Workload for DaemonSet {
    fn selector(&self) -> BTreeMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/daemon-set-v1/#DaemonSetStatus
    fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.number_ready).unwrap_or(0) > 0
    }
}

pub struct KubeRollout<K: Workload> {
    workload: K,
    api: Api<K>,
    pods: Api<Pod>,
}

impl<K: Workload> KubeRollout<K> {
    pub fn new(client: Client, workload: K) -> Self {
        let namespace = workload.namespace().unwrap_or_default();
        KubeRollout {
            api: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            workload,
        }
    }
}

#[async_trait]
impl<K: Workload> Rollout for KubeRollout<K> {
    fn name(&self) -> String {
        display_name(&self.workload)
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        self.workload.annotations().clone()
    }

    fn template_annotations(&self) -> BTreeMap<String, String> {
        self.workload
            .pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    fn containers(&self) -> Vec<DeclaredContainer> {
        declared_containers(&self.workload)
    }

    async fn container_statuses(&self) -> Result<Vec<RuntimeContainerStatus>, Error> {
        let selector = self.workload.selector();
        if selector.is_empty() {
            debug!("{} has no matchLabels selector", self.name());
            return Ok(Vec::new());
        }

        let label_selector = label_selector(&selector);
        let pods = self
            .pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|e| {
                Error::cluster(
                    format!("Failed to list pods of {} with selector {}", self.name(), label_selector),
                    e,
                )
            })?;

        Ok(statuses_from_pods(pods.items))
    }

    async fn restart(&mut self) -> Result<(), Error> {
        let mut workload = self.workload.clone();
        stamp_restarted_at(&mut workload, Utc::now());

        let params = PostParams {
            field_manager: Some(REROLLER_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        debug!("Updating {} with a new {} annotation", self.name(), RESTARTED_AT_ANNOTATION);
        self.workload = self
            .api
            .replace(&self.workload.name_any(), &params, &workload)
            .await
            .map_err(|e| Error::cluster(format!("Failed to update {} to trigger rollout", self.name()), e))?;
        Ok(())
    }
}

fn display_name<K: Workload>(workload: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        workload.namespace().unwrap_or_default(),
        workload.name_any()
    )
}

fn declared_containers<K: Workload>(workload: &K) -> Vec<DeclaredContainer> {
    workload
        .pod_template()
        .and_then(|t| t.spec.as_ref())
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| DeclaredContainer {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    pull_policy: c.image_pull_policy.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Sets the restart annotation on the pod template, creating the annotation map if needed.
fn stamp_restarted_at<K: Workload>(workload: &mut K, now: DateTime<Utc>) {
    if let Some(template) = workload.pod_template_mut() {
        template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                RESTARTED_AT_ANNOTATION.to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
    }
}

// Build label selector string like "key1=value1,key2=value2"
fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Flattens pod container statuses in pod-then-container order.
fn statuses_from_pods(pods: Vec<Pod>) -> Vec<RuntimeContainerStatus> {
    pods.into_iter()
        .flat_map(|pod| {
            let pod_name = pod.name_any();
            pod.status
                .and_then(|s| s.container_statuses)
                .unwrap_or_default()
                .into_iter()
                .filter(move |cs| {
                    if cs.image_id.is_empty() {
                        debug!(
                            "Ignoring container {} of pod {} because its imageID is empty",
                            cs.name, pod_name
                        );
                        false
                    } else {
                        true
                    }
                })
        })
        .map(|cs| RuntimeContainerStatus {
            image: cs.image,
            image_id: cs.image_id,
        })
        .collect()
}

/// Which namespaces are enumerated each pass.
#[derive(Debug, Clone)]
pub enum NamespaceScope {
    All,
    Named(Vec<String>),
    Matching(GlobSet),
}

impl NamespaceScope {
    pub fn from_patterns(patterns: &[String]) -> anyhow::Result<Self> {
        if patterns.is_empty() {
            return Ok(NamespaceScope::All);
        }
        if !patterns.iter().any(|p| p.contains(['*', '?', '[', '{'])) {
            return Ok(NamespaceScope::Named(patterns.to_vec()));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid namespace pattern {}", pattern))?,
            );
        }
        Ok(NamespaceScope::Matching(
            builder.build().context("Failed to build namespace matcher")?,
        ))
    }

    fn apis<K: Workload>(&self, client: &Client) -> Vec<Api<K>> {
        match self {
            NamespaceScope::Named(namespaces) => namespaces
                .iter()
                .map(|ns| Api::namespaced(client.clone(), ns))
                .collect(),
            NamespaceScope::All | NamespaceScope::Matching(_) => vec![Api::all(client.clone())],
        }
    }

    pub fn admits(&self, namespace: &str) -> bool {
        match self {
            NamespaceScope::All | NamespaceScope::Named(_) => true,
            NamespaceScope::Matching(globs) => globs.is_match(namespace),
        }
    }
}

/// Enumerates the rollouts to evaluate in one pass.
#[async_trait]
pub trait RolloutSource: Send + Sync {
    async fn list_rollouts(&self) -> Vec<Box<dyn Rollout>>;
}

pub struct KubeRolloutSource {
    client: Client,
    scope: NamespaceScope,
}

impl KubeRolloutSource {
    pub fn new(client: Client, scope: NamespaceScope) -> Self {
        KubeRolloutSource { client, scope }
    }

    async fn list_kind<K: Workload>(&self) -> Vec<Box<dyn Rollout>> {
        let mut rollouts: Vec<Box<dyn Rollout>> = Vec::new();
        for api in self.scope.apis::<K>(&self.client) {
            let list = match api.list(&ListParams::default()).await {
                Ok(list) => list,
                Err(e) => {
                    warn!("Failed to list {}s: {}", K::kind(&()), e);
                    continue;
                }
            };

            for workload in list.items {
                if !self.scope.admits(&workload.namespace().unwrap_or_default()) {
                    continue;
                }
                if !workload.is_ready() {
                    debug!("Skipping {} as it has no ready replicas", display_name(&workload));
                    continue;
                }
                rollouts.push(Box::new(KubeRollout::new(self.client.clone(), workload)));
            }
        }
        rollouts
    }
}

#[async_trait]
impl RolloutSource for KubeRolloutSource {
    async fn list_rollouts(&self) -> Vec<Box<dyn Rollout>> {
        let mut rollouts = self.list_kind::<Deployment>().await;
        rollouts.extend(self.list_kind::<DaemonSet>().await);
        info!("Found {} rollouts with ready replicas", rollouts.len());
        rollouts
    }
}
