//! Destination control-plane client speaking the ECR JSON 1.1 API with SigV4
//! signed requests.

use super::destination::{DestinationRegistry, RepositoryPage};
use super::error::{RegistryError, Result};
use super::options::RegistryClientOptions;
use super::sigv4::{amz_date, authorization_header, AwsCredentials, SigningRequest};
use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

const SERVICE: &str = "ecr";
const TARGET_PREFIX: &str = "AmazonEC2ContainerRegistry_V20150921";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";

pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";
pub const REGION_ENV: &str = "AWS_REGION";
pub const DEFAULT_REGION_ENV: &str = "AWS_DEFAULT_REGION";
pub const ENDPOINT_ENV: &str = "ECR_ENDPOINT_URL";

/// Account id and region encoded in an ECR registry host
/// (`<account>.dkr.ecr.<region>.amazonaws.com`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrRegistryHost {
    pub account_id: String,
    pub region: String,
}

impl EcrRegistryHost {
    pub fn parse(registry: &str) -> Option<Self> {
        let host = registry
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()?;
        let mut parts = host.split('.');
        let account_id = parts.next()?;
        if parts.next()? != "dkr" || parts.next()? != "ecr" {
            return None;
        }
        let region = parts.next()?;
        if parts.next()? != "amazonaws" {
            return None;
        }
        if account_id.is_empty() || !account_id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            account_id: account_id.to_owned(),
            region: region.to_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DescribeRepositoriesResponse {
    #[serde(default)]
    repositories: Vec<RepositoryEntry>,
    #[serde(default, rename = "nextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    #[serde(rename = "repositoryName")]
    repository_name: String,
}

#[derive(Debug, Deserialize)]
struct AuthorizationTokenResponse {
    #[serde(default, rename = "authorizationData")]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationData {
    #[serde(default, rename = "authorizationToken")]
    authorization_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default, rename = "__type")]
    code: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EcrClient {
    http: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    registry_id: Option<String>,
    credentials: AwsCredentials,
    page_size: u32,
}

impl EcrClient {
    pub fn new(
        endpoint: &str,
        region: impl Into<String>,
        registry_id: Option<String>,
        credentials: AwsCredentials,
        options: &RegistryClientOptions,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| RegistryError::Config(format!("invalid ECR endpoint {endpoint}: {err}")))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => {
                return Err(RegistryError::Config(format!(
                    "ECR endpoint {endpoint} has no host"
                )))
            }
        };

        Ok(Self {
            http: options.http_client()?,
            endpoint,
            host,
            region: region.into(),
            registry_id,
            credentials,
            page_size: options.list_page_size,
        })
    }

    /// Builds a client for `registry` from the ambient AWS environment.
    pub fn from_env(registry: &str, options: &RegistryClientOptions) -> Result<Self> {
        let parsed = EcrRegistryHost::parse(registry);
        let region = env_value(REGION_ENV)
            .or_else(|| env_value(DEFAULT_REGION_ENV))
            .or_else(|| parsed.as_ref().map(|host| host.region.clone()))
            .ok_or_else(|| {
                RegistryError::Config(format!(
                    "cannot determine AWS region for {registry}; set {REGION_ENV}"
                ))
            })?;

        let credentials = AwsCredentials {
            access_key_id: env_value(ACCESS_KEY_ENV)
                .ok_or_else(|| RegistryError::MissingCredentials(ACCESS_KEY_ENV.to_owned()))?,
            secret_access_key: env_value(SECRET_KEY_ENV)
                .ok_or_else(|| RegistryError::MissingCredentials(SECRET_KEY_ENV.to_owned()))?,
            session_token: env_value(SESSION_TOKEN_ENV),
        };

        let endpoint = env_value(ENDPOINT_ENV)
            .unwrap_or_else(|| format!("https://api.ecr.{region}.amazonaws.com/"));

        Self::new(
            &endpoint,
            region,
            parsed.map(|host| host.account_id),
            credentials,
            options,
        )
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn with_registry_id(&self, mut body: Value) -> Value {
        if let (Some(id), Some(map)) = (&self.registry_id, body.as_object_mut()) {
            map.insert("registryId".to_owned(), Value::String(id.clone()));
        }
        body
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: &Value) -> Result<T> {
        let payload = serde_json::to_vec(body)?;
        let timestamp = Utc::now();
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut signed = vec![
            ("content-type".to_owned(), CONTENT_TYPE_JSON.to_owned()),
            ("host".to_owned(), self.host.clone()),
            ("x-amz-date".to_owned(), amz_date(&timestamp)),
            ("x-amz-target".to_owned(), target.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            signed.push(("x-amz-security-token".to_owned(), token.clone()));
        }

        let authorization = authorization_header(
            &self.credentials,
            &SigningRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: "",
                headers: &signed,
                payload: &payload,
                region: &self.region,
                service: SERVICE,
                timestamp,
            },
        )
        .map_err(|err| RegistryError::Config(format!("could not sign {operation}: {err}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in signed.iter().filter(|(name, _)| name != "host") {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        tracing::trace!(operation, "calling destination control plane");
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(api_error(operation, status.as_u16(), &text));
        }

        if text.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Object(Default::default()))?);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn api_error(operation: &str, status: u16, body: &str) -> RegistryError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            code: Some(code), message, ..
        }) => RegistryError::Api {
            code,
            message: message.unwrap_or_default(),
        },
        _ => RegistryError::status(operation, status, body),
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|err| RegistryError::Config(format!("invalid header name {name}: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| RegistryError::Config(format!("invalid header value: {err}")))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

impl DestinationRegistry for EcrClient {
    fn list_repositories<'a>(
        &'a self,
        next_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RepositoryPage>> {
        Box::pin(async move {
            let mut body = json!({ "maxResults": self.page_size });
            if let Some(token) = next_token {
                body["nextToken"] = Value::String(token.to_owned());
            }
            let body = self.with_registry_id(body);

            let response: DescribeRepositoriesResponse =
                self.call("DescribeRepositories", &body).await?;
            Ok(RepositoryPage::new(
                response
                    .repositories
                    .into_iter()
                    .map(|repo| repo.repository_name)
                    .collect(),
                response.next_token.filter(|token| !token.is_empty()),
            ))
        })
    }

    fn create_repository<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = self.with_registry_id(json!({ "repositoryName": name }));
            let _: Value = self.call("CreateRepository", &body).await?;
            Ok(())
        })
    }

    fn authorization_token(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let response: AuthorizationTokenResponse =
                self.call("GetAuthorizationToken", &json!({})).await?;
            response
                .authorization_data
                .into_iter()
                .filter_map(|data| data.authorization_token)
                .last()
                .ok_or_else(|| {
                    RegistryError::Registry("authorization token response was empty".to_owned())
                })
        })
    }
}
