use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::env;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_SOURCE_REGISTRY: &str = "registry-1.docker.io";

pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
pub const NUM_WORKERS_ENV: &str = "NUM_WORKERS";
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
pub const PREFIX_ENV: &str = "PREFIX";

/// Process environment captured once at startup.
///
/// Nothing below the binary entry point reads the environment directly; the
/// values collected here are threaded through [`RunConfig`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub config_file: Option<PathBuf>,
    pub num_workers: Option<String>,
    pub log_level: Option<String>,
    pub prefix: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            config_file: non_empty_env(CONFIG_FILE_ENV).map(PathBuf::from),
            num_workers: non_empty_env(NUM_WORKERS_ENV),
            log_level: non_empty_env(LOG_LEVEL_ENV),
            prefix: non_empty_env(PREFIX_ENV),
        }
    }

    /// Path of the configuration document, falling back to `config.yaml`.
    pub fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// One configured unit of mirroring work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryJob {
    pub name: String,
    #[serde(default, rename = "match_tag")]
    pub match_tags: Vec<String>,
    #[serde(default, rename = "ignore_tag")]
    pub drop_tags: Vec<String>,
    #[serde(default)]
    pub max_tags: usize,
    #[serde(default, deserialize_with = "deserialize_tag_age")]
    pub max_tag_age: Option<Duration>,
    #[serde(default, rename = "remote_tags_source")]
    pub remote_tag_source: Option<String>,
    #[serde(default, rename = "remote_tags_config")]
    pub remote_tag_config: BTreeMap<String, String>,
    #[serde(default)]
    pub target_prefix: Option<String>,
}

impl RepositoryJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

fn deserialize_tag_age<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => humantime::parse_duration(value)
            .map(Some)
            .map_err(|err| serde::de::Error::custom(format!("invalid max_tag_age {value:?}: {err}"))),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetDocument {
    #[serde(default)]
    registry: String,
    #[serde(default)]
    prefix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceDocument {
    #[serde(default)]
    registry: Option<String>,
}

/// Raw shape of the YAML configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    repositories: Vec<RepositoryJob>,
    #[serde(default)]
    target: TargetDocument,
    #[serde(default)]
    source: SourceDocument,
    #[serde(default, rename = "enableOidc")]
    enable_oidc: bool,
    #[serde(default, rename = "scheduleMinutes")]
    schedule_minutes: u64,
}

/// Validated, immutable configuration for every scheduled run.
///
/// Built once per process via [`RunConfig::load`] or [`RunConfig::builder`] and
/// then shared by reference; validation runs before any consumer observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    workers: usize,
    target_registry: String,
    target_prefix: String,
    source_registry: String,
    repositories: Vec<RepositoryJob>,
    schedule_interval: Duration,
    enable_oidc: bool,
    name_filter: Option<String>,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Reads the configuration document named by `env` and applies the
    /// environment overrides on top of it.
    pub fn load(env: &EnvOverrides) -> Result<Self> {
        let path = env.config_path();
        Self::load_from(&path, env)
    }

    pub fn load_from(path: &Path, env: &EnvOverrides) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        Self::from_yaml(&content, env, logical_cpus())
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str, env: &EnvOverrides, cpus: usize) -> Result<Self> {
        let document: ConfigDocument =
            serde_yaml::from_str(content).context("could not parse config file")?;

        let workers =
            resolve_worker_count(document.workers, env.num_workers.as_deref(), cpus)?;

        let mut builder = RunConfig::builder()
            .workers(workers)
            .target_registry(document.target.registry)
            .target_prefix(document.target.prefix)
            .repositories(document.repositories)
            .schedule_interval(Duration::from_secs(
                document.schedule_minutes.saturating_mul(60),
            ))
            .enable_oidc(document.enable_oidc);

        if let Some(registry) = document.source.registry {
            builder = builder.source_registry(registry);
        }
        if let Some(prefix) = env.prefix.clone() {
            builder = builder.name_filter(prefix);
        }

        builder.build_with_cpus(cpus)
    }

    /// Number of concurrent workers draining the job queue.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Destination registry host, e.g. `123456789012.dkr.ecr.eu-west-1.amazonaws.com`.
    pub fn target_registry(&self) -> &str {
        &self.target_registry
    }

    pub fn target_prefix(&self) -> &str {
        &self.target_prefix
    }

    pub fn source_registry(&self) -> &str {
        &self.source_registry
    }

    pub fn repositories(&self) -> &[RepositoryJob] {
        &self.repositories
    }

    pub fn schedule_interval(&self) -> Duration {
        self.schedule_interval
    }

    /// Whether destination push credentials come from the registry's own
    /// authorization token instead of the local credential store.
    pub fn enable_oidc(&self) -> bool {
        self.enable_oidc
    }

    pub fn name_filter(&self) -> Option<&str> {
        self.name_filter.as_deref()
    }

    /// Repositories that survive the optional name-prefix filter, in configured order.
    pub fn selected_jobs(&self) -> Vec<RepositoryJob> {
        filter_jobs(&self.repositories, self.name_filter.as_deref())
            .cloned()
            .collect()
    }

    /// Destination repository name for `job`: its own prefix override if set,
    /// otherwise the target prefix, followed by the source name.
    pub fn destination_repository(&self, job: &RepositoryJob) -> String {
        let prefix = job.target_prefix.as_deref().unwrap_or(&self.target_prefix);
        format!("{prefix}{}", job.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_registry.trim().is_empty() {
            bail!("missing `target -> registry` config");
        }

        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }

        if self.schedule_interval.is_zero() {
            bail!("scheduleMinutes must be greater than 0");
        }

        ensure_not_empty(&self.source_registry, "source -> registry")?;

        for (index, job) in self.repositories.iter().enumerate() {
            if job.name.trim().is_empty() {
                bail!("repository #{index} has an empty name");
            }
            for pattern in job.match_tags.iter().chain(job.drop_tags.iter()) {
                regex::Regex::new(pattern).with_context(|| {
                    format!("repository {} has invalid tag pattern {pattern:?}", job.name)
                })?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunConfigBuilder {
    workers: Option<usize>,
    target_registry: Option<String>,
    target_prefix: Option<String>,
    source_registry: Option<String>,
    repositories: Vec<RepositoryJob>,
    schedule_interval: Option<Duration>,
    enable_oidc: bool,
    name_filter: Option<String>,
}

impl RunConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn target_registry(mut self, registry: impl Into<String>) -> Self {
        self.target_registry = Some(registry.into());
        self
    }

    pub fn target_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.target_prefix = Some(prefix.into());
        self
    }

    pub fn source_registry(mut self, registry: impl Into<String>) -> Self {
        self.source_registry = Some(registry.into());
        self
    }

    pub fn repositories(mut self, repositories: Vec<RepositoryJob>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn repository(mut self, job: RepositoryJob) -> Self {
        self.repositories.push(job);
        self
    }

    pub fn schedule_interval(mut self, interval: Duration) -> Self {
        self.schedule_interval = Some(interval);
        self
    }

    pub fn enable_oidc(mut self, enabled: bool) -> Self {
        self.enable_oidc = enabled;
        self
    }

    pub fn name_filter(mut self, prefix: impl Into<String>) -> Self {
        self.name_filter = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        self.build_with_cpus(logical_cpus())
    }

    fn build_with_cpus(self, cpus: usize) -> Result<RunConfig> {
        let config = RunConfig {
            workers: self.workers.filter(|workers| *workers > 0).unwrap_or(cpus),
            target_registry: trimmed(self.target_registry.unwrap_or_default()),
            target_prefix: self.target_prefix.unwrap_or_default(),
            source_registry: trimmed(
                self.source_registry
                    .unwrap_or_else(|| DEFAULT_SOURCE_REGISTRY.to_owned()),
            ),
            repositories: self.repositories,
            schedule_interval: self
                .schedule_interval
                .context("schedule interval is required")?,
            enable_oidc: self.enable_oidc,
            name_filter: self.name_filter.filter(|prefix| !prefix.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Resolves the worker count: the configured value when positive, otherwise
/// `cpus`; a present override takes precedence over both and must parse.
pub fn resolve_worker_count(
    configured: Option<usize>,
    override_value: Option<&str>,
    cpus: usize,
) -> Result<usize> {
    let mut workers = configured.filter(|workers| *workers > 0).unwrap_or(cpus);

    if let Some(raw) = override_value.map(str::trim).filter(|raw| !raw.is_empty()) {
        workers = raw
            .parse::<usize>()
            .with_context(|| format!("could not parse {NUM_WORKERS_ENV} override {raw:?}"))?;
    }

    Ok(workers)
}

/// Keeps only the jobs whose name starts with `prefix`; no prefix keeps all.
pub fn filter_jobs<'a>(
    jobs: &'a [RepositoryJob],
    prefix: Option<&'a str>,
) -> impl Iterator<Item = &'a RepositoryJob> + 'a {
    jobs.iter().filter(move |job| match prefix {
        Some(prefix) if !prefix.is_empty() => job.name.starts_with(prefix),
        _ => true,
    })
}

pub fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn trimmed(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}
