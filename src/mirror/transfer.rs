//! Copies selected tags from the source registry into the destination.

use super::tags::{image_created, TagPolicy, TagSource};
use crate::registry::{ImageRegistry, Manifest};
use crate::runtime::config::RepositoryJob;
use crate::runtime::protocol::{JobContext, Mirror, MirrorError, MirrorFactory, MirrorFuture};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

const SHA256_PREFIX: &str = "sha256:";

/// Creates one [`RegistryMirror`] per dequeued job.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryMirrorFactory;

impl MirrorFactory for RegistryMirrorFactory {
    fn create(&self, context: JobContext) -> Box<dyn Mirror> {
        Box::new(RegistryMirror::new(context))
    }
}

#[derive(Debug)]
pub struct RegistryMirror {
    context: JobContext,
    source_repository: String,
    destination: String,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct IndexManifest {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl RegistryMirror {
    pub fn new(context: JobContext) -> Self {
        Self {
            context,
            source_repository: String::new(),
            destination: String::new(),
            tags: Vec::new(),
        }
    }

    /// Destination repository name resolved by `setup`.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Tags selected by `setup`, in copy order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn prepare(&mut self, job: &RepositoryJob) -> Result<()> {
        let source_kind = TagSource::from_job(job)?;
        let policy = TagPolicy::from_job(job)?;

        let destination = self.context.config.destination_repository(job);
        self.context
            .cache
            .ensure(&destination)
            .await
            .with_context(|| format!("could not provision destination repository {destination}"))?;

        let source = self.context.source.as_ref();
        let listed = source_kind.candidates(source, &job.name).await?;
        let total = listed.len();
        let mut candidates = policy.prefilter(listed);

        if policy.max_age().is_some() {
            for candidate in &mut candidates {
                match image_created(source, &job.name, &candidate.name).await {
                    Ok(created) => candidate.created = created,
                    Err(err) => tracing::debug!(
                        repository = %job.name,
                        tag = %candidate.name,
                        error = %err,
                        "could not determine image age"
                    ),
                }
            }
        }

        self.tags = policy.select(candidates, Utc::now());
        self.source_repository = job.name.clone();
        self.destination = destination;

        tracing::info!(
            repository = %self.source_repository,
            destination = %self.destination,
            candidates = total,
            selected = self.tags.len(),
            "mirror prepared"
        );
        Ok(())
    }

    async fn transfer(&self, cancel: CancellationToken) -> Result<()> {
        let mut failed = Vec::new();
        let mut copied = 0usize;

        for tag in &self.tags {
            if cancel.is_cancelled() {
                bail!(
                    "cancelled after copying {copied} of {} tags",
                    self.tags.len()
                );
            }

            match self.copy_tag(tag, &cancel).await {
                Ok(()) => {
                    copied += 1;
                    tracing::debug!(
                        repository = %self.source_repository,
                        tag = %tag,
                        "tag mirrored"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        repository = %self.source_repository,
                        tag = %tag,
                        error = %format!("{err:#}"),
                        "failed to mirror tag"
                    );
                    failed.push(tag.clone());
                }
            }
        }

        if !failed.is_empty() {
            bail!(
                "{} of {} tags failed: {}",
                failed.len(),
                self.tags.len(),
                failed.join(", ")
            );
        }
        Ok(())
    }

    async fn copy_tag(&self, tag: &str, cancel: &CancellationToken) -> Result<()> {
        let source = self.context.source.as_ref();
        let target = self.context.target.as_ref();

        let manifest = source
            .get_manifest(&self.source_repository, tag)
            .await
            .with_context(|| format!("could not fetch manifest {tag}"))?;

        if let Some(digest) = manifest.digest.as_deref() {
            if target.manifest_exists(&self.destination, digest).await? {
                target.put_manifest(&self.destination, tag, &manifest).await?;
                return Ok(());
            }
        }

        if manifest.is_index() {
            let index: IndexManifest =
                serde_json::from_slice(&manifest.body).context("could not parse manifest index")?;
            for child in &index.manifests {
                if cancel.is_cancelled() {
                    bail!("cancelled while copying {tag}");
                }
                self.copy_child(&child.digest, cancel).await?;
            }
        } else {
            self.copy_blobs(&manifest, cancel).await?;
        }

        target
            .put_manifest(&self.destination, tag, &manifest)
            .await
            .with_context(|| format!("could not push manifest {tag}"))?;
        Ok(())
    }

    async fn copy_child(&self, digest: &str, cancel: &CancellationToken) -> Result<()> {
        let target = self.context.target.as_ref();
        if target.manifest_exists(&self.destination, digest).await? {
            return Ok(());
        }

        let child = self
            .context
            .source
            .get_manifest(&self.source_repository, digest)
            .await
            .with_context(|| format!("could not fetch child manifest {digest}"))?;
        verify_digest(digest, &child.body)?;
        if child.is_index() {
            bail!("nested manifest index {digest} is not supported");
        }

        self.copy_blobs(&child, cancel).await?;
        target
            .put_manifest(&self.destination, digest, &child)
            .await
            .with_context(|| format!("could not push child manifest {digest}"))?;
        Ok(())
    }

    async fn copy_blobs(&self, manifest: &Manifest, cancel: &CancellationToken) -> Result<()> {
        let image: ImageManifest = serde_json::from_slice(&manifest.body)
            .with_context(|| format!("could not parse {} manifest", manifest.media_type))?;
        let Some(config) = image.config else {
            bail!("unsupported manifest type {}", manifest.media_type);
        };

        let blobs = std::iter::once(&config).chain(
            image
                .layers
                .iter()
                .filter(|layer| !is_foreign(layer)),
        );
        for blob in blobs {
            if cancel.is_cancelled() {
                return Err(anyhow!("cancelled while copying blobs"));
            }
            copy_blob(
                self.context.source.as_ref(),
                self.context.target.as_ref(),
                &self.source_repository,
                &self.destination,
                &blob.digest,
            )
            .await?;
        }
        Ok(())
    }
}

fn is_foreign(descriptor: &Descriptor) -> bool {
    descriptor
        .media_type
        .as_deref()
        .is_some_and(|media_type| media_type.contains("foreign") || media_type.contains("nondistributable"))
}

async fn copy_blob(
    source: &dyn ImageRegistry,
    target: &dyn ImageRegistry,
    source_repository: &str,
    destination: &str,
    digest: &str,
) -> Result<()> {
    if target.blob_exists(destination, digest).await? {
        return Ok(());
    }

    let data = source
        .get_blob(source_repository, digest)
        .await
        .with_context(|| format!("could not fetch blob {digest}"))?;
    verify_digest(digest, &data)?;
    target
        .put_blob(destination, digest, data)
        .await
        .with_context(|| format!("could not push blob {digest}"))?;
    Ok(())
}

/// Checks `sha256:` digests against the content; other algorithms pass through.
pub fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let Some(expected) = digest.strip_prefix(SHA256_PREFIX) else {
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(data));
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("digest mismatch: expected {digest}, got {SHA256_PREFIX}{actual}");
    }
    Ok(())
}

impl Mirror for RegistryMirror {
    fn setup<'a>(&'a mut self, job: &'a RepositoryJob) -> MirrorFuture<'a> {
        Box::pin(async move { self.prepare(job).await.map_err(MirrorError::setup) })
    }

    fn work<'a>(&'a mut self, cancel: CancellationToken) -> MirrorFuture<'a> {
        Box::pin(async move { self.transfer(cancel).await.map_err(MirrorError::work) })
    }
}
