//! Production [`Connector`]: ECR control plane for the destination, Registry
//! V2 clients for pulling and pushing image content.

use super::auth::{docker_credentials, docker_credentials_from, CredentialPair};
use super::destination::DestinationRegistry;
use super::distribution::{DistributionClient, ImageRegistry};
use super::ecr::EcrClient;
use super::error::RegistryError;
use super::options::RegistryClientOptions;
use crate::processor::controller::Connector;
use crate::runtime::config::RunConfig;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RegistryConnector {
    options: RegistryClientOptions,
    docker_config: Option<PathBuf>,
}

impl RegistryConnector {
    pub fn new(options: RegistryClientOptions) -> Self {
        Self {
            options,
            docker_config: None,
        }
    }

    /// Reads registry credentials from `path` instead of the default docker config.
    pub fn with_docker_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_config = Some(path.into());
        self
    }

    fn stored_credentials(&self, registry: &str) -> Result<CredentialPair, RegistryError> {
        match &self.docker_config {
            Some(path) => docker_credentials_from(path, registry),
            None => docker_credentials(registry),
        }
    }
}

/// Picks the credentials used to push into the destination registry.
///
/// With `enable_oidc` only the destination's own authorization token is used.
/// Otherwise a local credential-store entry wins and the token is the fallback.
pub fn resolve_push_credentials(
    enable_oidc: bool,
    stored: Result<CredentialPair, RegistryError>,
    login: Option<CredentialPair>,
) -> Result<Option<CredentialPair>> {
    if enable_oidc {
        return login.map(Some).ok_or_else(|| {
            anyhow!("enableOidc is set but no destination authorization token was obtained")
        });
    }

    match stored {
        Ok(credentials) => Ok(Some(credentials)),
        Err(RegistryError::MissingCredentials(registry)) => {
            tracing::debug!(%registry, "no stored credentials; using destination token");
            Ok(login)
        }
        Err(err) => Err(err).context("could not read stored destination credentials"),
    }
}

impl Connector for RegistryConnector {
    fn connect_destination<'a>(
        &'a self,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn DestinationRegistry>>> {
        Box::pin(async move {
            let client = EcrClient::from_env(config.target_registry(), &self.options)?;
            tracing::debug!(region = client.region(), "destination control plane client ready");
            Ok(Arc::new(client) as Arc<dyn DestinationRegistry>)
        })
    }

    fn connect_source<'a>(
        &'a self,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn ImageRegistry>>> {
        Box::pin(async move {
            let registry = config.source_registry();
            let credentials = match self.stored_credentials(registry) {
                Ok(credentials) => Some(credentials),
                Err(RegistryError::MissingCredentials(_)) => {
                    tracing::debug!(registry, "no stored credentials; pulling anonymously");
                    None
                }
                Err(err) => return Err(err).context("could not read source registry credentials"),
            };

            let client = DistributionClient::new(registry, credentials, &self.options)?;
            client
                .ping()
                .await
                .with_context(|| format!("source registry {registry} is not reachable"))?;
            tracing::info!(registry = client.host(), "connected to source registry");
            Ok(Arc::new(client) as Arc<dyn ImageRegistry>)
        })
    }

    fn connect_target<'a>(
        &'a self,
        config: &'a RunConfig,
        login: Option<CredentialPair>,
    ) -> BoxFuture<'a, Result<Arc<dyn ImageRegistry>>> {
        Box::pin(async move {
            let registry = config.target_registry();
            let credentials = resolve_push_credentials(
                config.enable_oidc(),
                self.stored_credentials(registry),
                login,
            )?;
            if credentials.is_none() {
                tracing::warn!(registry, "pushing to destination without credentials");
            }
            let client = DistributionClient::new(registry, credentials, &self.options)?;
            Ok(Arc::new(client) as Arc<dyn ImageRegistry>)
        })
    }
}
