//! In-memory view of the repositories that exist in the destination registry.
//!
//! The set is rebuilt from the registry listing at the start of every run and
//! then only grows through [`DestinationCache::create`]. Creation is serialized
//! so two workers racing for the same destination name issue a single create.

use crate::processor::backoff::{retry_with_backoff, ExponentialBackoff, RetryBackoff};
use crate::registry::auth::{decode_auth_token, CredentialPair};
use crate::registry::{DestinationRegistry, RegistryError};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

pub struct DestinationCache {
    registry: Arc<dyn DestinationRegistry>,
    repositories: Mutex<Option<HashSet<String>>>,
    provisioning: tokio::sync::Mutex<()>,
    telemetry: Arc<Telemetry>,
}

impl std::fmt::Debug for DestinationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationCache")
            .field("known", &self.len())
            .finish()
    }
}

impl DestinationCache {
    pub fn new(registry: Arc<dyn DestinationRegistry>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            registry,
            repositories: Mutex::new(None),
            provisioning: tokio::sync::Mutex::new(()),
            telemetry,
        }
    }

    fn names(&self) -> MutexGuard<'_, Option<HashSet<String>>> {
        self.repositories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Pure lookup; never touches the network.
    pub fn exists(&self, name: &str) -> bool {
        self.names()
            .as_ref()
            .is_some_and(|names| names.contains(name))
    }

    pub fn len(&self) -> usize {
        self.names().as_ref().map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Known repository names, sorted.
    pub fn known_repositories(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .names()
            .as_ref()
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn insert(&self, name: &str) {
        self.names()
            .get_or_insert_with(HashSet::new)
            .insert(name.to_owned());
    }

    /// Makes sure `name` exists in the destination, creating it at most once.
    pub async fn ensure(&self, name: &str) -> Result<(), RegistryError> {
        if self.exists(name) {
            return Ok(());
        }

        let _provisioning = self.provisioning.lock().await;
        if self.exists(name) {
            return Ok(());
        }
        self.create(name).await
    }

    /// Issues a create call without consulting the cache. A repository that
    /// already exists at the registry counts as created.
    pub async fn create(&self, name: &str) -> Result<(), RegistryError> {
        match self.registry.create_repository(name).await {
            Ok(()) => {
                tracing::info!(repository = name, "created destination repository");
                self.telemetry.record_repository_created();
                self.insert(name);
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                tracing::debug!(repository = name, "destination repository already exists");
                self.insert(name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Fetches and decodes the destination's short-lived push credentials.
    ///
    /// Failures are logged here and still returned; the caller decides whether
    /// they matter.
    pub async fn login(&self) -> Result<CredentialPair, RegistryError> {
        let result = match self.registry.authorization_token().await {
            Ok(token) => decode_auth_token(&token),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            tracing::error!(error = %err, "could not obtain destination authorization token");
        }
        result
    }

    /// Adds every repository listed by the destination, following next-page
    /// tokens from `page_token` until the registry returns none.
    pub async fn build_cache(&self, page_token: Option<&str>) -> Result<(), RegistryError> {
        {
            self.names().get_or_insert_with(HashSet::new);
        }

        let mut next = page_token.map(str::to_owned);
        let mut pages = 0usize;
        loop {
            let page = self.registry.list_repositories(next.as_deref()).await?;
            pages += 1;
            {
                let mut guard = self.names();
                let names = guard.get_or_insert_with(HashSet::new);
                names.extend(page.names);
            }

            match page.next_token {
                Some(token) if !token.is_empty() => next = Some(token),
                _ => break,
            }
        }

        tracing::debug!(pages, repositories = self.len(), "destination listing loaded");
        Ok(())
    }

    /// Drops the current snapshot; the next [`build_cache`](Self::build_cache) starts fresh.
    pub fn reset(&self) {
        *self.names() = None;
    }

    /// Rebuilds the snapshot from scratch, retrying transient listing
    /// failures within `policy`'s elapsed-time budget.
    pub async fn bootstrap(
        &self,
        policy: ExponentialBackoff,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        self.reset();

        retry_with_backoff(
            RetryBackoff::new(policy).with_cancellation(cancellation),
            |_| async { self.build_cache(None).await.map_err(anyhow::Error::from) },
            |attempt, delay, err| {
                self.telemetry.record_bootstrap_retry();
                tracing::error!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "destination listing failed; retrying"
                );
            },
        )
        .await
        .context("could not build destination repository cache")?;

        tracing::info!(repositories = self.len(), "destination repository cache ready");
        Ok(())
    }
}
