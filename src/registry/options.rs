//! HTTP knobs shared by the registry clients, with validation so a bad value
//! surfaces at construction time rather than on the first request.

use super::error::{RegistryError, Result};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const DEFAULT_MAX_IDLE_PER_HOST: usize = 10;
pub const DEFAULT_LIST_PAGE_SIZE: u32 = 1_000;

#[derive(Debug, Clone)]
pub struct RegistryClientOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub list_page_size: u32,
}

impl Default for RegistryClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

impl RegistryClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(config_error("request_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(config_error("connect_timeout must be greater than 0"));
        }
        if self.list_page_size == 0 {
            return Err(config_error("list_page_size must be greater than 0"));
        }
        Ok(())
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        self.validate()?;
        reqwest::Client::builder()
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(RegistryError::Http)
    }
}

fn config_error(message: &str) -> RegistryError {
    RegistryError::Config(message.to_owned())
}
