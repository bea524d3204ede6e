//! The shipped [`Mirror`](crate::runtime::protocol::Mirror): selects tags per
//! job and copies manifests and blobs between Registry V2 endpoints.

pub mod tags;
pub mod transfer;

pub use tags::{TagCandidate, TagPolicy, TagSource};
pub use transfer::{RegistryMirror, RegistryMirrorFactory};
