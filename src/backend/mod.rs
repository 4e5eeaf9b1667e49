//! Contract between the pool and the container runtime.

mod docker;

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerBackend;
use serde_json::Value;

use crate::objects::{ActionLimits, RunResult};

/// Handle to a container issued by the backend.
///
/// The pool treats this as pure identity; all runtime state lives behind
/// the [`ContainerBackend`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Runtime id. Unset until the backend reports the container started,
    /// and for containers only known by name (straggler cleanup).
    pub id: Option<String>,
    /// Unique, human-readable name. Also the pool's lookup key.
    pub name: String,
    /// `host:port` of the in-container init endpoint, when known.
    pub addr: Option<String>,
}

/// Everything a creation needs to produce a started container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Network the container joins.
    pub network: String,
    /// Pull the image before creating. Images the host is expected to
    /// already carry (the `whisk/` family) skip the pull.
    pub pull: bool,
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
    pub limits: ActionLimits,
}

/// Operations the pool consumes from the container runtime.
///
/// Every operation may block and may fail. The pool never retries a
/// backend call internally; retry is the caller's job.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create and start a container.
    async fn create(&self, spec: ContainerSpec) -> Result<Container>;

    /// Run the in-container initialization protocol.
    ///
    /// A transport failure is an `Err`; a reachable container that rejects
    /// the payload is an `Ok` result carrying the failure status.
    async fn init(&self, container: &Container, payload: Value) -> Result<RunResult>;

    /// Freeze the container's processes.
    async fn pause(&self, container: &Container) -> Result<()>;

    /// Thaw a paused container.
    async fn unpause(&self, container: &Container) -> Result<()>;

    /// Force-kill the container process.
    async fn kill(&self, container: &Container) -> Result<()>;

    /// Remove the container from the runtime.
    async fn remove(&self, container: &Container) -> Result<()>;

    /// The container's combined stdout/stderr log.
    async fn get_logs(&self, container: &Container) -> Result<String>;

    /// Size in bytes of the log backing the container, zero when the
    /// runtime exposes none.
    async fn get_log_size(&self, container: &Container) -> Result<u64>;

    /// All containers known to the runtime, running or not.
    async fn list_all(&self) -> Result<Vec<Container>>;
}
