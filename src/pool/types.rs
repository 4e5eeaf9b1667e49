//! In-memory pool structures and the invariants they maintain.

use std::collections::HashMap;

use anyhow::{Result, ensure};

use crate::{backend::Container, objects::now_millis};

// ---------------------------------------------------------------------------
// ContainerState
// ---------------------------------------------------------------------------

/// Checkout state of a pooled container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Paused, warm, ready to be unpaused and handed out.
    Idle,
    /// Checked out to a caller.
    Active,
}

// ---------------------------------------------------------------------------
// ContainerInfo
// ---------------------------------------------------------------------------

/// Per-container record tracked by the pool.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Cache key the container serves. Immutable after introduction.
    pub key: String,
    /// Backend handle. Immutable after introduction.
    pub container: Container,
    pub state: ContainerState,
    /// Wall-clock millis of the last Active→Idle transition.
    pub last_used: u64,
    /// Set when the container's init call reported a failure.
    pub init_failed: bool,
}

// ---------------------------------------------------------------------------
// PoolState
// ---------------------------------------------------------------------------

/// Structures protected by the pool lock.
///
/// Every mutation maintains:
/// - each info is in `containers` and in exactly one `buckets` entry;
/// - buckets are never empty;
/// - `starting` counts creations in flight, at most one pool-wide.
///
/// These primitives assume the caller holds the pool lock and perform no
/// backend I/O.
#[derive(Default)]
pub struct PoolState {
    /// Container name → info.
    containers: HashMap<String, ContainerInfo>,
    /// Cache key → names of the containers serving it. Order within a
    /// bucket is not significant; the first idle entry wins.
    buckets: HashMap<String, Vec<String>>,
    /// Creations in flight pool-wide.
    pub starting: usize,
}

impl PoolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn count_by_state(&self, state: ContainerState) -> usize {
        self.containers.values().filter(|i| i.state == state).count()
    }

    pub fn get(&self, name: &str) -> Option<&ContainerInfo> {
        self.containers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ContainerInfo> {
        self.containers.get_mut(name)
    }

    /// First idle container in the key's bucket, if any.
    pub fn first_idle(&self, key: &str) -> Option<String> {
        self.buckets.get(key)?.iter().find_map(|name| {
            let info = self.containers.get(name)?;
            (info.state == ContainerState::Idle).then(|| name.clone())
        })
    }

    /// Insert a freshly created container as Active.
    pub fn introduce(&mut self, key: String, container: Container, init_failed: bool) {
        let name = container.name.clone();
        self.buckets.entry(key.clone()).or_default().push(name.clone());
        self.containers.insert(
            name,
            ContainerInfo {
                key,
                container,
                state: ContainerState::Active,
                last_used: now_millis(),
                init_failed,
            },
        );
    }

    /// Remove a container from both structures, dropping its bucket when it
    /// empties.
    pub fn remove(&mut self, name: &str) -> Option<ContainerInfo> {
        let info = self.containers.remove(name)?;
        if let Some(bucket) = self.buckets.get_mut(&info.key) {
            bucket.retain(|n| n != name);
            if bucket.is_empty() {
                self.buckets.remove(&info.key);
            }
        }
        Some(info)
    }

    /// Oldest idle container by `last_used`, name-ordered on ties.
    pub fn oldest_idle(&self) -> Option<String> {
        self.containers
            .values()
            .filter(|i| i.state == ContainerState::Idle)
            .min_by(|a, b| {
                a.last_used
                    .cmp(&b.last_used)
                    .then_with(|| a.container.name.cmp(&b.container.name))
            })
            .map(|i| i.container.name.clone())
    }

    /// Idle containers last used at or before `expiration` millis.
    pub fn expired_idle(&self, expiration: u64) -> Vec<String> {
        self.containers
            .values()
            .filter(|i| i.state == ContainerState::Idle && i.last_used <= expiration)
            .map(|i| i.container.name.clone())
            .collect()
    }

    /// Cross-check the structural invariants. Test support.
    pub fn verify(&self) -> Result<()> {
        let mut bucket_entries = 0;
        for (key, bucket) in &self.buckets {
            ensure!(!bucket.is_empty(), "bucket {} is empty", key);
            for name in bucket {
                bucket_entries += 1;
                let Some(info) = self.containers.get(name) else {
                    anyhow::bail!("bucket {} references unknown container {}", key, name);
                };
                ensure!(
                    &info.key == key,
                    "container {} is bucketed under {} but keyed {}",
                    name,
                    key,
                    info.key
                );
            }
        }
        ensure!(
            bucket_entries == self.containers.len(),
            "bucket entries ({}) disagree with the container map ({})",
            bucket_entries,
            self.containers.len()
        );
        ensure!(self.starting <= 1, "{} creations in flight", self.starting);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> Container {
        Container {
            id: Some(format!("id-{}", name)),
            name: name.to_string(),
            addr: None,
        }
    }

    #[test]
    fn test_introduce_and_remove_maintain_buckets() {
        let mut state = PoolState::new();
        state.introduce("k1".to_string(), handle("c1"), false);
        state.introduce("k1".to_string(), handle("c2"), false);
        state.introduce("k2".to_string(), handle("c3"), false);
        state.verify().unwrap();

        assert_eq!(state.len(), 3);
        assert_eq!(state.count_by_state(ContainerState::Active), 3);

        state.remove("c1").unwrap();
        state.verify().unwrap();
        assert_eq!(state.len(), 2);

        // Removing the last container of a key drops the bucket entirely.
        state.remove("c3").unwrap();
        state.verify().unwrap();
        assert!(state.first_idle("k2").is_none());
        assert_eq!(state.len(), 1);

        assert!(state.remove("c3").is_none());
    }

    #[test]
    fn test_first_idle_skips_active_entries() {
        let mut state = PoolState::new();
        state.introduce("k1".to_string(), handle("c1"), false);
        state.introduce("k1".to_string(), handle("c2"), false);
        assert!(state.first_idle("k1").is_none());

        state.get_mut("c2").unwrap().state = ContainerState::Idle;
        assert_eq!(state.first_idle("k1").as_deref(), Some("c2"));
        assert!(state.first_idle("missing").is_none());
    }

    #[test]
    fn test_oldest_idle_orders_by_last_used_then_name() {
        let mut state = PoolState::new();
        for name in ["c1", "c2", "c3"] {
            state.introduce("k".to_string(), handle(name), false);
        }
        for (name, last_used) in [("c1", 300), ("c2", 100), ("c3", 100)] {
            let info = state.get_mut(name).unwrap();
            info.state = ContainerState::Idle;
            info.last_used = last_used;
        }

        assert_eq!(state.oldest_idle().as_deref(), Some("c2"));
        state.remove("c2").unwrap();
        assert_eq!(state.oldest_idle().as_deref(), Some("c3"));
    }

    #[test]
    fn test_expired_idle_selection() {
        let mut state = PoolState::new();
        for (name, last_used) in [("c1", 100), ("c2", 200), ("c3", 150)] {
            state.introduce("k".to_string(), handle(name), false);
            let info = state.get_mut(name).unwrap();
            info.state = ContainerState::Idle;
            info.last_used = last_used;
        }
        state.get_mut("c3").unwrap().state = ContainerState::Active;

        let mut expired = state.expired_idle(200);
        expired.sort();
        // c3 is old enough but Active; only idle containers are eligible.
        assert_eq!(expired, vec!["c1".to_string(), "c2".to_string()]);
        assert!(state.expired_idle(50).is_empty());
    }
}
