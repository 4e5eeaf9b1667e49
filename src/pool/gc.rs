//! Idle-container reclamation by age, and best-effort teardown.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContainerPool, types::ContainerInfo};
use crate::objects::now_millis;

impl ContainerPool {
    /// Run the periodic GC loop. Call this from a spawned task.
    ///
    /// A sweep that outlasts the tick does not queue further sweeps; the
    /// next tick serializes on the sweep mutex.
    pub async fn run_gc(&self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.gc_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("GC loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if self.gc_enabled.load(Ordering::Relaxed) {
                        self.perform_gc().await;
                    }
                }
            }
        }
    }

    /// Synchronously sweep every idle container regardless of age.
    pub async fn force_gc(&self) {
        self.sweep(now_millis()).await;
    }

    /// Sweep idle containers older than the configured threshold.
    async fn perform_gc(&self) {
        let threshold = self.gc_threshold_ms.load(Ordering::Relaxed);
        let expiration = now_millis().saturating_sub(threshold);
        self.sweep(expiration).await;
    }

    /// One sweep: select victims under the pool lock, tear them down with
    /// the lock released. The sweep mutex is held across the teardown
    /// phase so get/put traffic interleaves with the slow I/O while sweeps
    /// themselves stay serialized.
    async fn sweep(&self, expiration: u64) {
        let _sweep = self.gc_sync.lock().await;

        let victims: Vec<ContainerInfo> = {
            let mut state = self.state.lock().await;
            let expired = state.expired_idle(expiration);
            expired
                .into_iter()
                .filter_map(|name| state.remove(&name))
                .collect()
        };
        if victims.is_empty() {
            return;
        }

        debug!(count = victims.len(), "Tearing down idle containers");
        for info in victims {
            self.teardown(info).await;
        }
    }

    /// Best-effort removal: persist the container's logs, then remove it
    /// from the backend. Failures are logged and swallowed; the info is
    /// already out of the pool, so a failed removal leaks the backend
    /// container until the next straggler sweep.
    pub(super) async fn teardown(&self, info: ContainerInfo) {
        let container = info.container;

        match self.backend.get_log_size(&container).await {
            Ok(bytes) => debug!(container = %container.name, bytes, "Collecting container logs"),
            Err(e) => debug!(container = %container.name, error = %e, "Log size unavailable"),
        }

        match self.backend.get_logs(&container).await {
            Ok(logs) => {
                let path = self.log_path(&container.name);
                if let Err(e) = tokio::fs::write(&path, logs).await {
                    warn!(
                        container = %container.name,
                        path = %path.display(),
                        error = %e,
                        "Failed to persist container logs"
                    );
                }
            }
            Err(e) => {
                warn!(container = %container.name, error = %e, "Failed to fetch container logs")
            }
        }

        match self.backend.remove(&container).await {
            Ok(()) => info!(container = %container.name, key = %info.key, "Removed container"),
            Err(e) => warn!(container = %container.name, error = %e, "Failed to remove container"),
        }
    }
}
