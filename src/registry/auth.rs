//! Registry credential resolution: the local docker credential store, base64
//! `user:password` tokens, and the Basic authorization header built from them.

use super::error::{RegistryError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::header::HeaderValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";
const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";

/// Username/password (or token) pair for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub username: String,
    pub password: String,
}

impl CredentialPair {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn basic_header(&self) -> Result<HeaderValue> {
        build_basic_auth(&self.username, &self.password)
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub(crate) fn build_basic_auth(user: &str, password: &str) -> Result<HeaderValue> {
    let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|err| RegistryError::Config(format!("failed to build Authorization header: {err}")))
}

/// Decodes a base64 `username:password` token, splitting at the first colon.
pub fn decode_auth_token(token: &str) -> Result<CredentialPair> {
    tracing::debug!("decoding registry token");
    let decoded = BASE64_STANDARD
        .decode(token.trim())
        .map_err(|err| RegistryError::InvalidToken(err.to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|err| RegistryError::InvalidToken(err.to_string()))?;

    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        RegistryError::InvalidToken("expected two parts, got 1".to_owned())
    })?;

    Ok(CredentialPair::new(username, password))
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Location of the docker client configuration (`$DOCKER_CONFIG/config.json`
/// or `~/.docker/config.json`).
pub fn docker_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(DOCKER_CONFIG_ENV).filter(|dir| !dir.is_empty()) {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Looks up credentials for `registry` in the local docker credential store.
pub fn docker_credentials(registry: &str) -> Result<CredentialPair> {
    let path = docker_config_path()
        .ok_or_else(|| RegistryError::MissingCredentials(registry.to_owned()))?;
    docker_credentials_from(&path, registry)
}

pub fn docker_credentials_from(path: &Path, registry: &str) -> Result<CredentialPair> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RegistryError::MissingCredentials(registry.to_owned()));
        }
        Err(err) => {
            return Err(RegistryError::Config(format!(
                "could not read {}: {err}",
                path.display()
            )))
        }
    };
    let config: DockerConfigFile = serde_json::from_str(&content)?;

    let entry = auth_keys(registry)
        .iter()
        .find_map(|key| config.auths.get(key))
        .ok_or_else(|| RegistryError::MissingCredentials(registry.to_owned()))?;

    match (&entry.username, &entry.password, &entry.auth) {
        (Some(username), Some(password), _) if !username.is_empty() => {
            Ok(CredentialPair::new(username, password))
        }
        (_, _, Some(auth)) if !auth.is_empty() => decode_auth_token(auth),
        _ => Err(RegistryError::MissingCredentials(registry.to_owned())),
    }
}

fn auth_keys(registry: &str) -> Vec<String> {
    let host = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let mut keys = vec![
        registry.to_owned(),
        host.to_owned(),
        format!("https://{host}"),
    ];
    if is_docker_hub(host) {
        keys.push(DOCKER_HUB_AUTH_KEY.to_owned());
    }
    keys
}

pub(crate) fn is_docker_hub(host: &str) -> bool {
    matches!(
        host,
        "docker.io" | "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com"
    )
}
