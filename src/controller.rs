use crate::config::Config;
use crate::image_reference::{ImageDefaults, ImageReference};
use crate::registry::DigestResolver;
use crate::rollout::{DeclaredContainer, RESTARTED_AT_ANNOTATION, Rollout, RolloutSource, RuntimeContainerStatus};
use crate::schedule::ScheduleWindow;
use chrono::{DateTime, Local, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Workload annotation opting a rollout in (or out) of automatic restarts.
pub static REROLL_ANNOTATION: &str = "reroller.roob.re/reroll";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub process_unannotated: bool,
    pub dry_run: bool,
    pub cooldown: TimeDelta,
    pub window: ScheduleWindow,
    pub concurrency: usize,
    pub image_defaults: ImageDefaults,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            process_unannotated: false,
            dry_run: false,
            cooldown: TimeDelta::zero(),
            window: ScheduleWindow::unrestricted(),
            concurrency: 4,
            image_defaults: ImageDefaults::default(),
        }
    }
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        let cooldown = i64::try_from(config.cooldown_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        ControllerSettings {
            process_unannotated: config.process_unannotated,
            dry_run: config.dry_run,
            cooldown,
            window: config.maintenance_window.unwrap_or_default(),
            concurrency: config.concurrency.max(1),
            image_defaults: ImageDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RolloutOutcome {
    Ineligible,
    CoolingDown,
    OutsideWindow,
    NoAlwaysPull,
    StatusesUnavailable { error: String },
    UpToDate,
    UpdateDetectedDryRun { images: Vec<String> },
    Restarted { images: Vec<String> },
    RestartFailed { images: Vec<String>, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub rollout: String,
    pub outcome: RolloutOutcome,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rollouts: Vec<RolloutReport>,
}

impl PassReport {
    pub fn outcome_of(&self, rollout: &str) -> Option<&RolloutOutcome> {
        self.rollouts
            .iter()
            .find(|r| r.rollout == rollout)
            .map(|r| &r.outcome)
    }

    pub fn restarted(&self) -> usize {
        self.rollouts
            .iter()
            .filter(|r| matches!(r.outcome, RolloutOutcome::Restarted { .. }))
            .count()
    }
}

pub struct Controller {
    source: Arc<dyn RolloutSource>,
    resolver: Arc<dyn DigestResolver>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        source: Arc<dyn RolloutSource>,
        resolver: Arc<dyn DigestResolver>,
        settings: ControllerSettings,
    ) -> Self {
        Controller {
            source,
            resolver,
            settings,
        }
    }

    pub async fn run_once(&self) -> PassReport {
        self.run_once_at(Utc::now()).await
    }

    /// Evaluates every rollout once. Failures are logged per rollout or
    /// container and never end the pass early.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> PassReport {
        let rollouts = self.source.list_rollouts().await;
        info!("Scanning for digest changes in {} rollouts", rollouts.len());

        let mut reports = Vec::with_capacity(rollouts.len());
        for mut rollout in rollouts {
            let name = rollout.name();
            let outcome = self.reconcile(rollout.as_mut(), now).await;
            reports.push(RolloutReport {
                rollout: name,
                outcome,
            });
        }

        PassReport {
            started_at: now,
            finished_at: Utc::now(),
            rollouts: reports,
        }
    }

    async fn reconcile(&self, rollout: &mut dyn Rollout, now: DateTime<Utc>) -> RolloutOutcome {
        let name = rollout.name();

        if !is_eligible(&rollout.annotations(), self.settings.process_unannotated) {
            debug!("Skipping {}, it is not annotated with {}=true", name, REROLL_ANNOTATION);
            return RolloutOutcome::Ineligible;
        }

        if !cooldown_elapsed(&rollout.template_annotations(), self.settings.cooldown, now) {
            info!(
                "Skipping {}, it was restarted less than {}s ago",
                name,
                self.settings.cooldown.num_seconds()
            );
            return RolloutOutcome::CoolingDown;
        }

        if !self.settings.window.should_run(&now.with_timezone(&Local)) {
            info!(
                "Skipping {}, outside of the maintenance window {} - {}",
                name, self.settings.window.after, self.settings.window.before
            );
            return RolloutOutcome::OutsideWindow;
        }

        if !has_always_pull_policy(&rollout.containers()) {
            warn!(
                "Skipping {}, none of its containers has imagePullPolicy 'Always'",
                name
            );
            return RolloutOutcome::NoAlwaysPull;
        }

        let statuses = match rollout.container_statuses().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!("Skipping {}, could not get container statuses: {}", name, e);
                return RolloutOutcome::StatusesUnavailable {
                    error: e.to_string(),
                };
            }
        };

        let images = self.find_updated_images(&name, statuses).await;
        if images.is_empty() {
            info!("Skipping {}, all digests are up to date", name);
            return RolloutOutcome::UpToDate;
        }

        if self.settings.dry_run {
            info!(
                "Dry run: would trigger rollout of {} for updated images {}",
                name,
                images.join(", ")
            );
            return RolloutOutcome::UpdateDetectedDryRun { images };
        }

        info!("Triggering rollout of {} for updated images {}", name, images.join(", "));
        match rollout.restart().await {
            Ok(()) => {
                info!("Successfully triggered rollout of {}", name);
                RolloutOutcome::Restarted { images }
            }
            Err(e) => {
                warn!("Failed to trigger rollout of {}: {}", name, e);
                RolloutOutcome::RestartFailed {
                    images,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Returns the images whose running digest is no longer published under their tag.
    async fn find_updated_images(
        &self,
        rollout: &str,
        statuses: Vec<RuntimeContainerStatus>,
    ) -> Vec<String> {
        // Replicas of the same template report identical statuses
        let unique: BTreeSet<RuntimeContainerStatus> = statuses.into_iter().collect();

        let mut images: Vec<String> = stream::iter(unique)
            .map(|status| self.check_container(rollout, status))
            .buffer_unordered(self.settings.concurrency.max(1))
            .filter_map(|updated| async move { updated })
            .collect()
            .await;
        images.sort();
        images.dedup();
        images
    }

    async fn check_container(&self, rollout: &str, status: RuntimeContainerStatus) -> Option<String> {
        if status.image.contains('@') {
            debug!("Ignoring {} in {}, it is pinned to a digest", status.image, rollout);
            return None;
        }

        let running = match status.running_digest() {
            Ok(digest) => digest,
            Err(e) => {
                warn!("Skipping container image {} of {}: {}", status.image, rollout, e);
                return None;
            }
        };

        let image = ImageReference::parse_with(&status.image, &self.settings.image_defaults);
        let published = match self.resolver.resolve(&image).await {
            Ok(digests) => digests,
            Err(e) => {
                warn!("Skipping container image {} of {}: {}", image, rollout, e);
                return None;
            }
        };

        if published.contains(running) {
            debug!("{} in {} is up to date at {}", image, rollout, running);
            None
        } else {
            info!(
                "Found updated image {} in {}: running {}, registry has {}",
                image, rollout, running, published
            );
            Some(image.to_string())
        }
    }
}

/// Reads the opt-in annotation, falling back to `process_unannotated` when it is absent.
/// Values that are not a recognised boolean count as `false`.
pub fn is_eligible(annotations: &BTreeMap<String, String>, process_unannotated: bool) -> bool {
    match annotations.get(REROLL_ANNOTATION) {
        None => process_unannotated,
        Some(value) => parse_bool(value).unwrap_or(false),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Whether at least `cooldown` has passed since the last recorded restart.
/// A missing or unreadable timestamp never blocks a restart.
pub fn cooldown_elapsed(
    template_annotations: &BTreeMap<String, String>,
    cooldown: TimeDelta,
    now: DateTime<Utc>,
) -> bool {
    let Some(raw) = template_annotations.get(RESTARTED_AT_ANNOTATION) else {
        return true;
    };

    match DateTime::parse_from_rfc3339(raw) {
        Ok(restarted_at) => now.signed_duration_since(restarted_at) >= cooldown,
        Err(e) => {
            warn!(
                "Ignoring unparsable {} annotation {:?}: {}",
                RESTARTED_AT_ANNOTATION, raw, e
            );
            true
        }
    }
}

pub fn has_always_pull_policy(containers: &[DeclaredContainer]) -> bool {
    containers.iter().any(DeclaredContainer::always_pulls)
}
