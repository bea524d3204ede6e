//! Tag discovery and selection for one repository job.

use crate::registry::ImageRegistry;
use crate::runtime::config::RepositoryJob;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

pub const REGISTRY_TAG_SOURCE: &str = "registry";
pub const STATIC_TAG_SOURCE: &str = "static";
const STATIC_TAGS_KEY: &str = "tags";

/// Where a job's candidate tags come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSource {
    /// The source registry's own tag listing.
    Registry,
    /// A fixed list from `remote_tags_config.tags`.
    Static(Vec<String>),
}

impl TagSource {
    pub fn from_job(job: &RepositoryJob) -> Result<Self> {
        let kind = job
            .remote_tag_source
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .unwrap_or(REGISTRY_TAG_SOURCE);

        match kind {
            REGISTRY_TAG_SOURCE => Ok(TagSource::Registry),
            STATIC_TAG_SOURCE => {
                let raw = job
                    .remote_tag_config
                    .get(STATIC_TAGS_KEY)
                    .with_context(|| {
                        format!("static tag source for {} needs remote_tags_config.tags", job.name)
                    })?;
                let tags: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_owned)
                    .collect();
                if tags.is_empty() {
                    bail!("static tag source for {} lists no tags", job.name);
                }
                Ok(TagSource::Static(tags))
            }
            other => bail!("unknown remote tag source {other:?} for {}", job.name),
        }
    }

    /// Candidate tags in source order.
    pub async fn candidates(
        &self,
        registry: &dyn ImageRegistry,
        repository: &str,
    ) -> Result<Vec<TagCandidate>> {
        let names = match self {
            TagSource::Static(tags) => tags.clone(),
            TagSource::Registry => registry
                .list_tags(repository)
                .await
                .with_context(|| format!("could not list tags of {repository}"))?,
        };
        Ok(names.into_iter().map(TagCandidate::new).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCandidate {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

impl TagCandidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: None,
        }
    }

    pub fn created_at(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }
}

/// Allow/deny patterns, age and count limits of a job.
#[derive(Debug, Clone)]
pub struct TagPolicy {
    match_tags: Vec<Regex>,
    drop_tags: Vec<Regex>,
    max_tags: usize,
    max_age: Option<Duration>,
}

impl TagPolicy {
    pub fn from_job(job: &RepositoryJob) -> Result<Self> {
        Ok(Self {
            match_tags: compile(&job.match_tags)?,
            drop_tags: compile(&job.drop_tags)?,
            max_tags: job.max_tags,
            max_age: job.max_tag_age,
        })
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    fn keeps(&self, tag: &str) -> bool {
        let matched =
            self.match_tags.is_empty() || self.match_tags.iter().any(|re| re.is_match(tag));
        matched && !self.drop_tags.iter().any(|re| re.is_match(tag))
    }

    fn fresh(&self, candidate: &TagCandidate, now: DateTime<Utc>) -> bool {
        match (self.max_age, candidate.created) {
            (Some(max_age), Some(created)) => match chrono::Duration::from_std(max_age) {
                Ok(max_age) => now.signed_duration_since(created) <= max_age,
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// Drops candidates rejected by the match and drop patterns. Needs no
    /// timestamps, so it runs before any image age is looked up.
    pub fn prefilter(&self, candidates: Vec<TagCandidate>) -> Vec<TagCandidate> {
        candidates
            .into_iter()
            .filter(|candidate| self.keeps(&candidate.name))
            .collect()
    }

    /// Applies the patterns, then the age limit (where a timestamp is known),
    /// then keeps the last `max_tags` survivors in source order.
    pub fn select(&self, candidates: Vec<TagCandidate>, now: DateTime<Utc>) -> Vec<String> {
        let kept: Vec<String> = self
            .prefilter(candidates)
            .into_iter()
            .filter(|candidate| self.fresh(candidate, now))
            .map(|candidate| candidate.name)
            .collect();

        if self.max_tags > 0 && kept.len() > self.max_tags {
            kept[kept.len() - self.max_tags..].to_vec()
        } else {
            kept
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid tag pattern {pattern:?}"))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ConfigReference {
    config: Option<ConfigDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ConfigDescriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    created: Option<String>,
}

/// Creation time recorded in the image config of `tag`, when the manifest
/// references a config blob that carries one.
pub async fn image_created(
    registry: &dyn ImageRegistry,
    repository: &str,
    tag: &str,
) -> Result<Option<DateTime<Utc>>> {
    let manifest = registry.get_manifest(repository, tag).await?;
    if manifest.is_index() {
        return Ok(None);
    }

    let reference: ConfigReference = serde_json::from_slice(&manifest.body)
        .with_context(|| format!("could not parse manifest of {repository}:{tag}"))?;
    let Some(config) = reference.config else {
        return Ok(None);
    };

    let blob = registry.get_blob(repository, &config.digest).await?;
    let image: ImageConfig = serde_json::from_slice(&blob)
        .with_context(|| format!("could not parse image config of {repository}:{tag}"))?;

    Ok(image
        .created
        .as_deref()
        .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
        .map(|created| created.with_timezone(&Utc)))
}
