//! Warm container pool for a serverless function-execution worker.
//!
//! The pool caches started containers keyed by the (user, action, revision)
//! tuple they host, hands them out on demand, and reclaims them by age and
//! by capacity. The container runtime is consumed through the opaque
//! [`ContainerBackend`] contract.

pub mod backend;
pub mod config;
pub mod logging;
pub mod objects;
pub mod pool;

// Re-export key types for convenience
pub use backend::{Container, ContainerBackend, ContainerSpec, DockerBackend};
pub use config::{InitFailurePolicy, InvokerConfig, PoolConfig};
pub use objects::{ActionKey, ActionLimits, AuthKey, RunResult, WhiskAction};
pub use pool::{ContainerPool, PoolCounts};
