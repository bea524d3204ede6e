use super::error::Result;
use futures::future::BoxFuture;

/// One page of the destination registry's repository listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryPage {
    pub names: Vec<String>,
    pub next_token: Option<String>,
}

impl RepositoryPage {
    pub fn new(names: Vec<String>, next_token: Option<String>) -> Self {
        Self { names, next_token }
    }
}

/// Control plane of the registry jobs mirror into.
pub trait DestinationRegistry: Send + Sync {
    /// Lists one page of repositories; `next_token` is `None` for the first page.
    fn list_repositories<'a>(
        &'a self,
        next_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RepositoryPage>>;

    fn create_repository<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Short-lived base64 `user:password` token for pushing to the registry.
    fn authorization_token(&self) -> BoxFuture<'_, Result<String>>;
}
