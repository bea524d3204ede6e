pub mod mirror;
pub mod processor;
pub mod registry;
pub mod runtime;

pub use mirror::{RegistryMirror, RegistryMirrorFactory, TagPolicy, TagSource};
pub use processor::backoff::ExponentialBackoff;
pub use processor::barrier::{CompletionBarrier, CompletionGuard};
pub use processor::controller::{Connector, RunController, RunOutcome, RunSummary};
pub use processor::destination_cache::DestinationCache;
pub use processor::worker_pool::{WorkerPool, JOB_QUEUE_CAPACITY};
pub use registry::{
    CredentialPair, DestinationRegistry, DistributionClient, EcrClient, ImageRegistry, Manifest,
    RegistryClientOptions, RegistryConnector, RegistryError, RepositoryPage,
};
pub use runtime::config::{
    filter_jobs, resolve_worker_count, EnvOverrides, RepositoryJob, RunConfig, RunConfigBuilder,
};
pub use runtime::protocol::{
    JobContext, Mirror, MirrorError, MirrorFactory, MirrorFuture, MirrorStage,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
