use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

const LOCAL_ENV: &str = "local";

/// Policy for containers whose init call completed but reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitFailurePolicy {
    /// Delete the container on its next return instead of parking it warm.
    #[default]
    Discard,
    /// Keep the container in the warm reserve. Init is not re-run on
    /// reuse, so callers may be handed a container that never initialized
    /// successfully.
    Retain,
}

/// Tunables of the container pool.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle age in seconds after which the periodic GC evicts a container.
    #[serde_inline_default(600)]
    pub gc_threshold_secs: u64,
    /// Tick of the periodic GC timer, in milliseconds.
    #[serde_inline_default(1000)]
    pub gc_interval_ms: u64,
    /// Warm-reserve cap, enforced on every return.
    #[serde_inline_default(10)]
    pub max_idle: usize,
    /// Cap on live containers, creations in flight included.
    #[serde_inline_default(4)]
    pub max_active: usize,
    /// Directory container logs are persisted to at teardown.
    #[serde_inline_default(PathBuf::from("/logs"))]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub init_failure_policy: InitFailurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            gc_threshold_secs: 600,
            gc_interval_ms: 1000,
            max_idle: 10,
            max_active: 4,
            log_dir: PathBuf::from("/logs"),
            init_failure_policy: InitFailurePolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn gc_threshold(&self) -> Duration {
        Duration::from_secs(self.gc_threshold_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Configuration of the invoker worker.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Environment name (e.g. "local", "staging", "production").
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    /// Numeric identity of this invoker, embedded in container names.
    #[serde_inline_default(0)]
    pub invoker_instance: u32,
    /// Docker daemon endpoint: a bare host, a socket path, or a
    /// `unix://` / `tcp://` / `http(s)://` address. Also seeded into
    /// containers as `EDGE_HOST`.
    #[serde_inline_default("localhost".to_string())]
    pub self_docker_endpoint: String,
    /// Registry action images are served from; empty means local images.
    #[serde_inline_default(String::new())]
    pub docker_registry: String,
    /// Tag appended to action images.
    #[serde_inline_default("latest".to_string())]
    pub docker_image_tag: String,
    /// Docker network the containers join.
    #[serde_inline_default("bridge".to_string())]
    pub invoker_container_network: String,
    /// Version string seeded into containers as `WHISK_VERSION`.
    #[serde_inline_default(env!("CARGO_PKG_VERSION").to_string())]
    pub whisk_version: String,
    /// Container pool tunables.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_string(),
            invoker_instance: 0,
            self_docker_endpoint: "localhost".to_string(),
            docker_registry: String::new(),
            docker_image_tag: "latest".to_string(),
            invoker_container_network: "bridge".to_string(),
            whisk_version: env!("CARGO_PKG_VERSION").to_string(),
            pool: PoolConfig::default(),
        }
    }
}

impl InvokerConfig {
    pub fn from_path(path: &str) -> Result<InvokerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<InvokerConfig> {
        let config: InvokerConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.self_docker_endpoint.is_empty() {
            return Err(anyhow::anyhow!("self_docker_endpoint must not be empty"));
        }
        if self.docker_image_tag.is_empty() {
            return Err(anyhow::anyhow!("docker_image_tag must not be empty"));
        }
        if self.invoker_container_network.is_empty() {
            return Err(anyhow::anyhow!(
                "invoker_container_network must not be empty"
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InvokerConfig::default();
        assert_eq!(config.env, "local");
        assert_eq!(config.self_docker_endpoint, "localhost");
        assert_eq!(config.docker_image_tag, "latest");
        assert_eq!(config.invoker_container_network, "bridge");
        assert!(config.validate().is_ok());
        assert!(!config.structured_logging());
        // Pool defaults
        assert_eq!(config.pool.gc_threshold(), Duration::from_secs(600));
        assert_eq!(config.pool.gc_interval(), Duration::from_millis(1000));
        assert_eq!(config.pool.max_idle, 10);
        assert_eq!(config.pool.max_active, 4);
        assert_eq!(config.pool.log_dir, PathBuf::from("/logs"));
        assert_eq!(config.pool.init_failure_policy, InitFailurePolicy::Discard);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
env: local
"#;
        let config = InvokerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.self_docker_endpoint, "localhost");
        assert_eq!(config.pool.max_active, 4);
    }

    #[test]
    fn test_production_config() {
        let yaml = r#"
env: production
invoker_instance: 3
self_docker_endpoint: "tcp://10.0.0.5:2375"
docker_registry: "registry.example.com"
docker_image_tag: "v2"
pool:
  gc_threshold_secs: 120
  max_idle: 2
  max_active: 8
  log_dir: "/var/log/invoker"
  init_failure_policy: retain
"#;
        let config = InvokerConfig::from_yaml_str(yaml).unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.invoker_instance, 3);
        assert_eq!(config.docker_registry, "registry.example.com");
        assert_eq!(config.pool.gc_threshold(), Duration::from_secs(120));
        assert_eq!(config.pool.max_idle, 2);
        assert_eq!(config.pool.max_active, 8);
        assert_eq!(config.pool.log_dir, PathBuf::from("/var/log/invoker"));
        assert_eq!(config.pool.init_failure_policy, InitFailurePolicy::Retain);
        // Untouched fields keep their defaults.
        assert_eq!(config.pool.gc_interval_ms, 1000);
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let yaml = r#"
env: local
self_docker_endpoint: ""
"#;
        let result = InvokerConfig::from_yaml_str(yaml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("self_docker_endpoint"));
    }

    #[test]
    fn test_empty_network_rejected() {
        let yaml = r#"
env: local
invoker_container_network: ""
"#;
        assert!(InvokerConfig::from_yaml_str(yaml).is_err());
    }
}
