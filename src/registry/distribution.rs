//! Registry HTTP API V2 client used to pull from the source registry and push
//! into the destination registry.
//!
//! Authentication follows the distribution token flow: requests go out with
//! Basic credentials (or a cached bearer token), and a `401` carrying a
//! `WWW-Authenticate: Bearer realm=..,service=..,scope=..` challenge triggers
//! one token request against the realm before the request is retried.

use super::auth::{is_docker_hub, CredentialPair};
use super::error::{RegistryError, Result};
use super::options::RegistryClientOptions;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const TAGS_PAGE_SIZE: usize = 1_000;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

/// Raw manifest as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub digest: Option<String>,
    pub body: Bytes,
}

impl Manifest {
    /// True for manifest lists / OCI indexes that reference per-platform manifests.
    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST || self.media_type == MEDIA_TYPE_OCI_INDEX
    }
}

/// Image-level operations of the Registry HTTP API V2.
pub trait ImageRegistry: Send + Sync {
    fn host(&self) -> &str;

    /// Connectivity probe; a registry that answers `GET /v2/` with 200 or 401 is reachable.
    fn ping(&self) -> BoxFuture<'_, Result<()>>;

    fn list_tags<'a>(&'a self, repository: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    fn get_manifest<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<Manifest>>;

    fn manifest_exists<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;

    fn put_manifest<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
        manifest: &'a Manifest,
    ) -> BoxFuture<'a, Result<()>>;

    fn blob_exists<'a>(&'a self, repository: &'a str, digest: &'a str)
        -> BoxFuture<'a, Result<bool>>;

    fn get_blob<'a>(&'a self, repository: &'a str, digest: &'a str) -> BoxFuture<'a, Result<Bytes>>;

    fn put_blob<'a>(
        &'a self,
        repository: &'a str,
        digest: &'a str,
        data: Bytes,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Pull,
    Push,
}

impl Access {
    fn actions(self) -> &'static str {
        match self {
            Access::Pull => "pull",
            Access::Push => "pull,push",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = BearerChallenge::default();
        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_owned();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }

        if challenge.realm.is_empty() {
            None
        } else {
            Some(challenge)
        }
    }
}

/// Splits challenge parameters on commas that are not inside quotes
/// (scopes such as `repository:a:pull,push` contain commas).
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (index, ch) in params.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(params[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(params[start..].trim());
    parts.into_iter().filter(|part| !part.is_empty()).collect()
}

/// Extracts the `rel="next"` target of a `Link` header.
fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        Some(target.trim().trim_start_matches('<').trim_end_matches('>'))
    })
}

pub struct DistributionClient {
    http: reqwest::Client,
    base: Url,
    host: String,
    docker_hub: bool,
    credentials: Option<CredentialPair>,
    tokens: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for DistributionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionClient")
            .field("base", &self.base.as_str())
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl DistributionClient {
    /// Creates a client for `registry` (a host, optionally with scheme).
    pub fn new(
        registry: &str,
        credentials: Option<CredentialPair>,
        options: &RegistryClientOptions,
    ) -> Result<Self> {
        let base = registry_base_url(registry)?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => {
                return Err(RegistryError::Config(format!("registry {registry} has no host")))
            }
        };
        let docker_hub = is_docker_hub(&host);

        Ok(Self {
            http: options.http_client()?,
            base,
            host,
            docker_hub,
            credentials,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Repository path as the registry expects it; Docker Hub official images
    /// live under `library/`.
    pub fn repository_path(&self, repository: &str) -> String {
        let repository = repository.trim_matches('/');
        if self.docker_hub && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| RegistryError::Config(format!("invalid registry path {path}: {err}")))
    }

    fn scope(&self, repository: &str, access: Access) -> String {
        format!("repository:{repository}:{}", access.actions())
    }

    async fn authorize(&self, request: RequestBuilder, scope: Option<&str>) -> Result<RequestBuilder> {
        if let Some(scope) = scope {
            if let Some(token) = self.tokens.read().await.get(scope) {
                return Ok(request.bearer_auth(token));
            }
        }
        match &self.credentials {
            Some(credentials) => Ok(request.header(AUTHORIZATION, credentials.basic_header()?)),
            None => Ok(request),
        }
    }

    /// Sends the request built by `build`, answering one bearer challenge if needed.
    async fn send<F>(&self, scope: Option<&str>, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let request = self.authorize(build(&self.http), scope).await?;
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, scope).await?;
        let cache_key = scope
            .map(str::to_owned)
            .or_else(|| challenge.scope.clone())
            .unwrap_or_default();
        self.tokens
            .write()
            .await
            .insert(cache_key, token.clone());

        Ok(build(&self.http).bearer_auth(token).send().await?)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, scope: Option<&str>) -> Result<String> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }
        if let Some(scope) = challenge.scope.as_deref().or(scope) {
            query.push(("scope", scope));
        }

        let mut request = self.http.get(&challenge.realm).query(&query);
        if let Some(credentials) = &self.credentials {
            request = request.header(AUTHORIZATION, credentials.basic_header()?);
        }

        tracing::debug!(realm = %challenge.realm, scope = ?scope, "requesting registry token");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RegistryError::status("token request", status.as_u16(), &text));
        }

        let body: TokenResponse = serde_json::from_str(&text)?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RegistryError::Registry("token response carried no token".to_owned()))
    }

    async fn exists(&self, repository: &str, kind: &str, reference: &str) -> Result<bool> {
        let path = self.repository_path(repository);
        let url = self.url(&format!("/v2/{path}/{kind}/{reference}"))?;
        let scope = self.scope(&path, Access::Pull);
        let response = self
            .send(Some(&scope), |http| {
                http.head(url.clone()).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::status(
                format!("HEAD {url}"),
                status.as_u16(),
                "",
            )),
        }
    }

    async fn list_tags_inner(&self, repository: &str) -> Result<Vec<String>> {
        let path = self.repository_path(repository);
        let scope = self.scope(&path, Access::Pull);
        let mut url = self.url(&format!("/v2/{path}/tags/list?n={TAGS_PAGE_SIZE}"))?;
        let mut tags = Vec::new();

        loop {
            let response = self.send(Some(&scope), |http| http.get(url.clone())).await?;
            let status = response.status();
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link)
                .map(str::to_owned);
            let text = response.text().await?;
            if !status.is_success() {
                return Err(RegistryError::status(format!("GET {url}"), status.as_u16(), &text));
            }

            let page: TagList = serde_json::from_str(&text)?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = self.url(&next)?,
                None => break,
            }
        }

        Ok(tags)
    }

    async fn get_manifest_inner(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let path = self.repository_path(repository);
        let url = self.url(&format!("/v2/{path}/manifests/{reference}"))?;
        let scope = self.scope(&path, Access::Pull);
        let response = self
            .send(Some(&scope), |http| {
                http.get(url.clone()).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        let status = response.status();
        let media_type = header_string(&response, CONTENT_TYPE.as_str())
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_owned())
            .unwrap_or_else(|| MEDIA_TYPE_DOCKER_MANIFEST.to_owned());
        let digest = header_string(&response, DOCKER_CONTENT_DIGEST);
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(RegistryError::status(
                format!("GET {url}"),
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }

        Ok(Manifest {
            media_type,
            digest,
            body,
        })
    }

    async fn put_manifest_inner(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let path = self.repository_path(repository);
        let url = self.url(&format!("/v2/{path}/manifests/{reference}"))?;
        let scope = self.scope(&path, Access::Push);
        let content_type = HeaderValue::from_str(&manifest.media_type)
            .map_err(|err| RegistryError::Registry(format!("invalid media type: {err}")))?;
        let response = self
            .send(Some(&scope), |http| {
                http.put(url.clone())
                    .header(CONTENT_TYPE, content_type.clone())
                    .body(manifest.body.clone())
            })
            .await?;

        expect_success(response, format!("PUT {url}")).await
    }

    async fn get_blob_inner(&self, repository: &str, digest: &str) -> Result<Bytes> {
        let path = self.repository_path(repository);
        let url = self.url(&format!("/v2/{path}/blobs/{digest}"))?;
        let scope = self.scope(&path, Access::Pull);
        let response = self.send(Some(&scope), |http| http.get(url.clone())).await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(RegistryError::status(
                format!("GET {url}"),
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        Ok(body)
    }

    async fn put_blob_inner(&self, repository: &str, digest: &str, data: Bytes) -> Result<()> {
        let path = self.repository_path(repository);
        let start_url = self.url(&format!("/v2/{path}/blobs/uploads/"))?;
        let scope = self.scope(&path, Access::Push);

        let response = self
            .send(Some(&scope), |http| {
                http.request(Method::POST, start_url.clone())
                    .header(reqwest::header::CONTENT_LENGTH, 0)
            })
            .await?;
        let status = response.status();
        let location = header_string(&response, LOCATION.as_str());
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RegistryError::status(
                format!("POST {start_url}"),
                status.as_u16(),
                &text,
            ));
        }

        let location = location.ok_or_else(|| {
            RegistryError::Registry(format!("upload for {path} returned no Location header"))
        })?;
        let mut upload_url = self.url(&location)?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        let response = self
            .send(Some(&scope), |http| {
                http.put(upload_url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;

        expect_success(response, format!("PUT blob {digest} to {path}")).await
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn expect_success(response: Response, operation: String) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    Err(RegistryError::status(operation, status.as_u16(), &text))
}

/// Base URL for a registry host; bare hosts get `https://`, Docker Hub aliases
/// resolve to the registry endpoint.
pub fn registry_base_url(registry: &str) -> Result<Url> {
    let registry = registry.trim().trim_end_matches('/');
    let with_scheme = if registry.starts_with("http://") || registry.starts_with("https://") {
        registry.to_owned()
    } else if is_docker_hub(registry) {
        format!("https://{DOCKER_HUB_REGISTRY}")
    } else {
        format!("https://{registry}")
    };
    Url::parse(&format!("{with_scheme}/"))
        .map_err(|err| RegistryError::Config(format!("invalid registry {registry}: {err}")))
}

impl ImageRegistry for DistributionClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = self.url("/v2/")?;
            let response = self.http.get(url.clone()).send().await?;
            match response.status() {
                status if status.is_success() || status == StatusCode::UNAUTHORIZED => Ok(()),
                status => {
                    let text = response.text().await.unwrap_or_default();
                    Err(RegistryError::status(format!("GET {url}"), status.as_u16(), &text))
                }
            }
        })
    }

    fn list_tags<'a>(&'a self, repository: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(self.list_tags_inner(repository))
    }

    fn get_manifest<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<Manifest>> {
        Box::pin(self.get_manifest_inner(repository, reference))
    }

    fn manifest_exists<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.exists(repository, "manifests", reference))
    }

    fn put_manifest<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
        manifest: &'a Manifest,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.put_manifest_inner(repository, reference, manifest))
    }

    fn blob_exists<'a>(
        &'a self,
        repository: &'a str,
        digest: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.exists(repository, "blobs", digest))
    }

    fn get_blob<'a>(&'a self, repository: &'a str, digest: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(self.get_blob_inner(repository, digest))
    }

    fn put_blob<'a>(
        &'a self,
        repository: &'a str,
        digest: &'a str,
        data: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.put_blob_inner(repository, digest, data))
    }
}
