//! Warm container pool: keyed cache, bounded concurrency, idle eviction.
//!
//! Containers are cached by the key of the work they host. `get_action`
//! hands out a warm container when one exists, creates one when none does,
//! and applies back-pressure when the pool is at capacity. `put_back`
//! returns a container to the warm reserve, evicting the oldest idle
//! entries past the idle cap. A periodic sweep reclaims idle containers by
//! age.

mod gc;
mod types;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        RwLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
pub use types::{ContainerInfo, ContainerState};
use types::PoolState;

use crate::{
    backend::{Container, ContainerBackend, ContainerSpec},
    config::{InitFailurePolicy, InvokerConfig},
    objects::{ActionKey, ActionLimits, AuthKey, ContainerNamer, RunResult, WhiskAction, now_millis},
};

/// How long a caller sleeps before re-probing a busy pool.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Snapshot of the pool population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub active: usize,
    pub idle: usize,
    pub starting: usize,
}

/// Outcome of one pass over the cache under the pool lock.
enum Probe {
    /// Warm container reactivated. Init is never re-run on a hit.
    Hit(Container),
    /// No warm container for the key; the caller may try to create one.
    Miss,
    /// Capacity exhausted or a creation already in flight.
    Busy,
}

/// Everything a creation needs, computed once per `get`.
struct CreateRequest {
    /// Sanitized into the container name.
    name_hint: String,
    image: String,
    pull: bool,
    env: Vec<(String, String)>,
    args: Vec<String>,
    limits: ActionLimits,
    /// Posted to the container after start; `None` for raw image runs.
    init_payload: Option<Value>,
}

pub struct ContainerPool {
    backend: Arc<dyn ContainerBackend>,
    /// Protects the maps, the counters, and the state of every info.
    /// Critical sections span the fast pause/unpause calls so the state
    /// flip and the runtime freeze/thaw stay atomic; slow backend I/O
    /// (create, init, teardown) always runs with this lock released.
    state: Mutex<PoolState>,
    /// Serializes sweeps, teardown phase included, so overlapping sweeps
    /// cannot double-remove containers. Always taken before the pool lock.
    gc_sync: Mutex<()>,
    gc_enabled: AtomicBool,
    max_active: AtomicUsize,
    max_idle: AtomicUsize,
    gc_threshold_ms: AtomicU64,
    gc_interval: Duration,
    log_dir: RwLock<PathBuf>,
    init_failure_policy: InitFailurePolicy,
    namer: ContainerNamer,
    edge_host: String,
    whisk_version: String,
    docker_registry: String,
    docker_image_tag: String,
    container_network: String,
}

impl ContainerPool {
    pub fn new(config: &InvokerConfig, backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(PoolState::new()),
            gc_sync: Mutex::new(()),
            gc_enabled: AtomicBool::new(true),
            max_active: AtomicUsize::new(config.pool.max_active),
            max_idle: AtomicUsize::new(config.pool.max_idle),
            gc_threshold_ms: AtomicU64::new(config.pool.gc_threshold().as_millis() as u64),
            gc_interval: config.pool.gc_interval(),
            log_dir: RwLock::new(config.pool.log_dir.clone()),
            init_failure_policy: config.pool.init_failure_policy,
            namer: ContainerNamer::new(config.invoker_instance),
            edge_host: config.self_docker_endpoint.clone(),
            whisk_version: config.whisk_version.clone(),
            docker_registry: config.docker_registry.clone(),
            docker_image_tag: config.docker_image_tag.clone(),
            container_network: config.invoker_container_network.clone(),
        }
    }

    // -- acquisition ---------------------------------------------------------

    /// Check out a container hosting the given action revision.
    ///
    /// Returns the container and, for freshly created containers, the init
    /// result; a cache hit never re-runs init. Returns `None` when the
    /// creation failed terminally. Blocks (retrying) while the pool is at
    /// capacity; callers needing a timeout must impose it externally.
    pub async fn get_action(
        &self,
        action: &WhiskAction,
        auth: &AuthKey,
    ) -> Option<(Container, Option<RunResult>)> {
        let key = ActionKey::for_action(action, auth);
        let request = self.action_request(action, auth);
        self.acquire(key, request).await
    }

    /// Check out a container running a raw image, bypassing the action
    /// metadata path. No init call is made.
    pub async fn get_by_image_name(&self, image: &str, args: &[String]) -> Option<Container> {
        let key = ActionKey::for_image(image, args);
        let request = self.image_request(image, args);
        self.acquire(key, request).await.map(|(container, _)| container)
    }

    async fn acquire(
        &self,
        key: ActionKey,
        request: CreateRequest,
    ) -> Option<(Container, Option<RunResult>)> {
        loop {
            match self.probe(&key).await {
                Ok(Probe::Hit(container)) => {
                    debug!(key = %key, container = %container.name, "Warm container reused");
                    return Some((container, None));
                }
                Ok(Probe::Busy) => {
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                    continue;
                }
                Ok(Probe::Miss) => {}
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to reactivate warm container");
                    return None;
                }
            }

            if !self.begin_creation().await {
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
                continue;
            }

            // Slow path. Backend create and init run with the pool lock
            // released; `starting` keeps the capacity invariant honest for
            // the duration of the unlocked window.
            let created = self.create_container(&request).await;

            let mut state = self.state.lock().await;
            state.starting -= 1;
            match created {
                Ok((container, init_result)) => {
                    let init_failed = init_result.as_ref().is_some_and(|r| !r.ok());
                    state.introduce(key.as_str().to_string(), container.clone(), init_failed);
                    drop(state);
                    if init_failed {
                        warn!(
                            key = %key,
                            container = %container.name,
                            "Container init reported failure"
                        );
                    }
                    return Some((container, init_result));
                }
                Err(e) => {
                    drop(state);
                    error!(key = %key, error = %e, "Container creation failed");
                    return None;
                }
            }
        }
    }

    /// Fast path under the pool lock.
    ///
    /// A hit flips the info to Active and unpauses the container before
    /// the handle escapes, so no other caller can observe a half-checked-
    /// out container.
    async fn probe(&self, key: &ActionKey) -> Result<Probe> {
        let mut state = self.state.lock().await;

        let active = state.count_by_state(ContainerState::Active);
        if active + state.starting >= self.max_active.load(Ordering::Relaxed) {
            return Ok(Probe::Busy);
        }

        let Some(name) = state.first_idle(key.as_str()) else {
            return Ok(Probe::Miss);
        };
        let Some(info) = state.get_mut(&name) else {
            return Ok(Probe::Miss);
        };
        info.state = ContainerState::Active;
        let container = info.container.clone();

        if let Err(e) = self.backend.unpause(&container).await {
            // A warm container that cannot be thawed is useless; drop it
            // rather than leaving a poisoned entry in the cache.
            let removed = state.remove(&name);
            drop(state);
            if let Some(info) = removed {
                self.teardown(info).await;
            }
            return Err(e).with_context(|| format!("Unpause of container {} failed", name));
        }

        Ok(Probe::Hit(container))
    }

    /// Recheck capacity and claim the single pool-wide creation slot.
    async fn begin_creation(&self) -> bool {
        let mut state = self.state.lock().await;
        let active = state.count_by_state(ContainerState::Active);
        if active + state.starting >= self.max_active.load(Ordering::Relaxed) {
            return false;
        }
        if state.starting >= 1 {
            return false;
        }
        state.starting += 1;
        true
    }

    async fn create_container(
        &self,
        request: &CreateRequest,
    ) -> Result<(Container, Option<RunResult>)> {
        let name = self.namer.next(&request.name_hint);
        let spec = ContainerSpec {
            name,
            image: request.image.clone(),
            network: self.container_network.clone(),
            pull: request.pull,
            env: request.env.clone(),
            args: request.args.clone(),
            limits: request.limits.clone(),
        };

        let container = self.backend.create(spec).await.context("Backend create failed")?;

        let init_result = match &request.init_payload {
            None => None,
            Some(payload) => match self.backend.init(&container, payload.clone()).await {
                Ok(result) => Some(result),
                Err(e) => {
                    // The container is up but unreachable for init; remove
                    // it before surfacing the failure so it doesn't linger
                    // until the next straggler sweep.
                    if let Err(remove_err) = self.backend.remove(&container).await {
                        warn!(
                            container = %container.name,
                            error = %remove_err,
                            "Failed to remove container after init error"
                        );
                    }
                    return Err(e).context("Container init failed");
                }
            },
        };

        Ok((container, init_result))
    }

    // -- release -------------------------------------------------------------

    /// Return a checked-out container to the warm reserve, or delete it.
    ///
    /// Capacity eviction runs before the returned container turns Idle, so
    /// a single call never evicts the container it is returning. The
    /// container is observably paused before this returns.
    pub async fn put_back(&self, container: &Container, delete: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(info) = state.get(&container.name) else {
            bail!("putBack for unknown container {}", container.name);
        };
        if info.state != ContainerState::Active {
            bail!("putBack for container {} that is not checked out", container.name);
        }
        let delete = delete
            || (info.init_failed && self.init_failure_policy == InitFailurePolicy::Discard);

        let mut evicted = Vec::new();
        if self.gc_enabled.load(Ordering::Relaxed) {
            let max_idle = self.max_idle.load(Ordering::Relaxed);
            while state.count_by_state(ContainerState::Idle) >= max_idle {
                let Some(oldest) = state.oldest_idle() else { break };
                if let Some(info) = state.remove(&oldest) {
                    debug!(container = %oldest, "Evicting idle container over the idle cap");
                    evicted.push(info);
                }
            }
        }

        if let Err(e) = self.backend.pause(container).await {
            drop(state);
            for info in evicted {
                self.teardown(info).await;
            }
            return Err(e).with_context(|| format!("Pause of container {} failed", container.name));
        }
        if let Some(info) = state.get_mut(&container.name) {
            info.state = ContainerState::Idle;
            info.last_used = now_millis();
        }
        let removed = if delete { state.remove(&container.name) } else { None };
        drop(state);

        for info in evicted {
            self.teardown(info).await;
        }
        if let Some(info) = removed {
            debug!(container = %container.name, "Deleting container on return");
            self.teardown(info).await;
        }
        Ok(())
    }

    // -- maintenance ---------------------------------------------------------

    /// Remove leftover containers from a previous run of this worker.
    ///
    /// Matches on the `wsk` name prefix. Intended for startup after an
    /// abnormal restart, before the pool hands out containers.
    pub async fn kill_stragglers(&self) -> Result<usize> {
        let all = self
            .backend
            .list_all()
            .await
            .context("Listing backend containers failed")?;

        let mut removed = 0;
        for container in all {
            if !container.name.starts_with(ContainerNamer::PREFIX) {
                continue;
            }
            info!(container = %container.name, "Removing straggler container");
            if let Err(e) = self.backend.kill(&container).await {
                debug!(container = %container.name, error = %e, "Straggler kill failed");
            }
            match self.backend.remove(&container).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(container = %container.name, error = %e, "Failed to remove straggler")
                }
            }
        }
        Ok(removed)
    }

    pub fn enable_gc(&self) {
        self.gc_enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_gc(&self) {
        self.gc_enabled.store(false, Ordering::Relaxed);
    }

    // -- tunables ------------------------------------------------------------

    pub fn set_gc_threshold(&self, threshold: Duration) {
        self.gc_threshold_ms
            .store(threshold.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn gc_threshold(&self) -> Duration {
        Duration::from_millis(self.gc_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn set_max_idle(&self, max_idle: usize) {
        self.max_idle.store(max_idle, Ordering::Relaxed);
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle.load(Ordering::Relaxed)
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.max_active.store(max_active, Ordering::Relaxed);
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::Relaxed)
    }

    pub fn set_log_dir(&self, dir: PathBuf) {
        let mut log_dir = self.log_dir.write().unwrap_or_else(|e| e.into_inner());
        *log_dir = dir;
    }

    pub(crate) fn log_path(&self, container_name: &str) -> PathBuf {
        let log_dir = self.log_dir.read().unwrap_or_else(|e| e.into_inner());
        log_dir.join(format!("{}.log", container_name))
    }

    // -- observation ---------------------------------------------------------

    /// Current population snapshot.
    pub async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        PoolCounts {
            active: state.count_by_state(ContainerState::Active),
            idle: state.count_by_state(ContainerState::Idle),
            starting: state.starting,
        }
    }

    /// Cross-check every structural invariant the pool lock protects.
    /// Test support.
    pub async fn verify_invariants(&self) -> Result<()> {
        let state = self.state.lock().await;
        state.verify()?;
        let active = state.count_by_state(ContainerState::Active);
        let idle = state.count_by_state(ContainerState::Idle);
        anyhow::ensure!(
            active + idle == state.len(),
            "state counts ({} active, {} idle) disagree with the container map ({})",
            active,
            idle,
            state.len()
        );
        anyhow::ensure!(
            active + state.starting <= self.max_active.load(Ordering::Relaxed),
            "active population ({} + {} starting) exceeds the cap",
            active,
            state.starting
        );
        Ok(())
    }

    // -- request construction ------------------------------------------------

    fn action_request(&self, action: &WhiskAction, auth: &AuthKey) -> CreateRequest {
        let image = self.action_image(action);
        CreateRequest {
            name_hint: action.fqn.clone(),
            pull: !image.starts_with("whisk/"),
            image,
            env: self.standard_env(Some(auth)),
            args: Vec::new(),
            limits: action.limits.clone(),
            init_payload: Some(action.init_payload.clone()),
        }
    }

    fn image_request(&self, image: &str, args: &[String]) -> CreateRequest {
        CreateRequest {
            name_hint: image.to_string(),
            image: image.to_string(),
            pull: !image.starts_with("whisk/"),
            env: self.standard_env(None),
            args: args.to_vec(),
            limits: ActionLimits::default(),
            init_payload: None,
        }
    }

    /// Action images live under the `whisk/` family; local ones are
    /// assumed present, registry-qualified ones are pulled.
    fn action_image(&self, action: &WhiskAction) -> String {
        if self.docker_registry.is_empty() {
            format!("whisk/{}:{}", action.image, self.docker_image_tag)
        } else {
            format!(
                "{}/whisk/{}:{}",
                self.docker_registry, action.image, self.docker_image_tag
            )
        }
    }

    fn standard_env(&self, auth: Option<&AuthKey>) -> Vec<(String, String)> {
        let mut env = vec![
            ("EDGE_HOST".to_string(), self.edge_host.clone()),
            ("WHISK_VERSION".to_string(), self.whisk_version.clone()),
        ];
        if let Some(auth) = auth {
            env.push(("AUTH_KEY".to_string(), auth.compact()));
        }
        env
    }
}
