//! Orchestration engine: destination cache bootstrap with retry, the
//! completion barrier, the persistent worker pool and the per-tick run
//! controller.

pub mod backoff;
pub mod barrier;
pub mod controller;
pub mod destination_cache;
pub mod worker_pool;
