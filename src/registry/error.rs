use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Control-plane error type reported when the repository already exists.
pub const REPOSITORY_ALREADY_EXISTS: &str = "RepositoryAlreadyExistsException";

const MAX_BODY_EXCERPT: usize = 512;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("No auth found for {0}")]
    MissingCredentials(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),
}

impl RegistryError {
    pub(crate) fn status(operation: impl Into<String>, status: u16, body: &str) -> Self {
        let mut body = body.trim().to_owned();
        if body.len() > MAX_BODY_EXCERPT {
            let mut cut = MAX_BODY_EXCERPT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        RegistryError::Status {
            operation: operation.into(),
            status,
            body,
        }
    }

    /// True when a create-repository call lost a race against an existing repository.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RegistryError::Api { code, .. } if code.ends_with(REPOSITORY_ALREADY_EXISTS))
    }
}
