//! Registry clients: the destination control plane, the Registry HTTP API V2
//! data plane, and credential resolution shared by both.

pub mod auth;
pub mod connector;
pub mod destination;
pub mod distribution;
pub mod ecr;
pub mod error;
pub mod options;
pub(crate) mod sigv4;

pub use auth::{decode_auth_token, docker_credentials, CredentialPair};
pub use connector::RegistryConnector;
pub use destination::{DestinationRegistry, RepositoryPage};
pub use distribution::{DistributionClient, ImageRegistry, Manifest};
pub use ecr::EcrClient;
pub use error::RegistryError;
pub use options::RegistryClientOptions;
pub use sigv4::AwsCredentials;
