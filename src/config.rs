use crate::schedule::ScheduleWindow;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub run_once: bool,
    /// Namespace names or glob patterns, empty means every namespace
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub process_unannotated: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub maintenance_window: Option<ScheduleWindow>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_registry_timeout_seconds")]
    pub registry_timeout_seconds: u64,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistryProtocol {
    Distribution,
    LegacyTags,
    TagList,
    DigestIndex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub hostname: String,
    pub protocol: RegistryProtocol,
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl RegistryConfig {
    pub fn base_url(&self) -> String {
        if let Some(base_url) = &self.base_url {
            return base_url.clone();
        }
        match self.protocol {
            RegistryProtocol::Distribution | RegistryProtocol::DigestIndex => {
                format!("https://{}/v2", self.hostname)
            }
            RegistryProtocol::TagList => format!("https://{}/api/v1/repository", self.hostname),
            RegistryProtocol::LegacyTags => format!("https://{}/v2/repositories", self.hostname),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Webserver { port: 8080 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

fn default_schedule() -> String {
    "0 */5 * * * *".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_registry_timeout_seconds() -> u64 {
    10
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.registry_timeout_seconds == 0 {
            bail!("registryTimeoutSeconds must be at least 1");
        }
        for registry in &self.registries {
            if registry.password.is_some() && registry.username.is_none() {
                bail!(
                    "registry {} has a password but no username",
                    registry.hostname
                );
            }
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        bail!("Missing environment variable: {}", missing);
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("REROLLER_TEST_VAR", "value123");
        }
        let input = "This is a test: ${REROLLER_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("REROLLER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${REROLLER_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: REROLLER_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.schedule, "0 */5 * * * *");
        assert!(!config.run_once);
        assert!(!config.process_unannotated);
        assert!(!config.dry_run);
        assert_eq!(config.cooldown_seconds, 0);
        assert!(config.maintenance_window.is_none());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.registry_timeout_seconds, 10);
        assert_eq!(config.webserver.port, 8080);
        assert!(config.registries.is_empty());
    }

    #[test]
    fn test_registry_default_base_urls() {
        let config: Config = serde_yaml_ng::from_str(
            r#"
            registries:
              - hostname: registry.example.com
                protocol: distribution
              - hostname: quay.example.com
                protocol: tagList
              - hostname: hub.example.com
                protocol: legacyTags
                baseUrl: https://hub.example.com/api/repositories
            "#,
        )
        .unwrap();
        assert_eq!(config.registries[0].base_url(), "https://registry.example.com/v2");
        assert_eq!(
            config.registries[1].base_url(),
            "https://quay.example.com/api/v1/repository"
        );
        assert_eq!(
            config.registries[2].base_url(),
            "https://hub.example.com/api/repositories"
        );
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("REROLLER_TEST_GHCR_TOKEN", "secret_token");
        }
        let yaml_content = r#"
        schedule: "0 0 * * * *"
        namespaces: ["default", "team-*"]
        processUnannotated: true
        dryRun: true
        cooldownSeconds: 3600
        maintenanceWindow:
          after: "22:00"
          before: "04:30"
        webserver:
          port: 9090
        registries:
          - hostname: ghcr.io
            protocol: distribution
            username: user
            password: ${REROLLER_TEST_GHCR_TOKEN}
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.schedule, "0 0 * * * *");
        assert_eq!(config.namespaces, vec!["default", "team-*"]);
        assert!(config.process_unannotated);
        assert!(config.dry_run);
        assert_eq!(config.cooldown_seconds, 3600);
        let window = config.maintenance_window.expect("window should be set");
        assert_eq!(window.after, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(window.before, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.registries.len(), 1);
        assert_eq!(config.registries[0].protocol, RegistryProtocol::Distribution);
        assert_eq!(config.registries[0].username.as_deref(), Some("user"));
        assert_eq!(
            config.registries[0]
                .password
                .as_ref()
                .map(|p| p.expose_secret()),
            Some("secret_token")
        );
        unsafe {
            env::remove_var("REROLLER_TEST_GHCR_TOKEN");
        }
    }

    #[test]
    fn test_load_config_rejects_zero_concurrency() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "concurrency: 0\n").expect("Failed to write to temp file");

        let err = load_config(tmp_file.path()).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
