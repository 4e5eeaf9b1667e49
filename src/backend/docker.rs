use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    Docker,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        KillContainerOptions,
        ListContainersOptions,
        LogsOptions,
        RemoveContainerOptions,
        StartContainerOptions,
    },
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use super::{Container, ContainerBackend, ContainerSpec};
use crate::objects::{ActionLimits, RunResult, now_millis};

/// Port the action runtime listens on inside the container.
const CONTAINER_INIT_PORT: u16 = 8080;

/// Conventional plaintext Docker API port, used for bare-host endpoints.
const DOCKER_API_PORT: u16 = 2375;

const CPU_PERIOD_MICROSEC: i64 = 20_000;

/// Upper bound on logs captured per container at teardown.
const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Docker adapter for the backend contract.
pub struct DockerBackend {
    docker: Docker,
    http: reqwest::Client,
}

impl DockerBackend {
    /// Connect to the Docker daemon at `endpoint`.
    ///
    /// Accepted forms:
    /// - bare host (e.g. `localhost`): HTTP on port 2375
    /// - `http://host:port` or `tcp://host:port`
    /// - a socket path, with or without the `unix://` prefix
    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let docker = if endpoint.starts_with("http://") || endpoint.starts_with("tcp://") {
            let addr = endpoint
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else if endpoint.starts_with("unix://") || endpoint.starts_with('/') {
            let socket_path = endpoint.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        } else {
            Docker::connect_with_http(
                &format!("http://{}:{}", endpoint, DOCKER_API_PORT),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon")?
        };
        Ok(Self {
            docker,
            http: reqwest::Client::new(),
        })
    }

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect image"),
        }
    }

    /// Ensure an image is available locally, pulling it if necessary.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!(image = %image, "Image already exists locally");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.with_context(|| format!("Failed to pull image {}", image))?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    /// Address of the init endpoint inside a started container.
    async fn container_addr(&self, name: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let networks = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .context("Container has no network settings")?;

        for (_network_name, endpoint) in networks {
            if let Some(ip) = endpoint.ip_address
                && !ip.is_empty()
            {
                return Ok(format!("{}:{}", ip, CONTAINER_INIT_PORT));
            }
        }

        anyhow::bail!("Container {} has no IP address", name)
    }
}

fn build_host_config(limits: &ActionLimits, network: &str) -> HostConfig {
    let memory = limits.memory_mb.map(|mb| (mb * 1024 * 1024) as i64);

    let (cpu_period, cpu_quota) = if let Some(millicores) = limits.cpu_millicores {
        let cpu_fraction = millicores as f64 / 1000.0;
        let quota = (cpu_fraction * CPU_PERIOD_MICROSEC as f64).ceil() as i64;
        (Some(CPU_PERIOD_MICROSEC), Some(quota))
    } else {
        (None, None)
    };

    HostConfig {
        memory,
        // memory_swap == memory means zero swap (Docker's memory_swap is
        // RAM+swap total).
        memory_swap: memory,
        cpu_period,
        cpu_quota,
        network_mode: Some(network.to_string()),
        ..Default::default()
    }
}

fn format_env(env: &[(String, String)]) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn create(&self, spec: ContainerSpec) -> Result<Container> {
        if spec.pull {
            self.ensure_image(&spec.image).await?;
        }

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.args.is_empty() {
                None
            } else {
                Some(spec.args.clone())
            },
            env: Some(format_env(&spec.env)),
            host_config: Some(build_host_config(&spec.limits, &spec.network)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        if let Err(e) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
        {
            // Don't leave the half-created container behind.
            let _ = self
                .docker
                .remove_container(
                    &spec.name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(e).with_context(|| format!("Failed to start container {}", spec.name));
        }

        let addr = self.container_addr(&spec.name).await?;
        info!(container = %spec.name, image = %spec.image, addr = %addr, "Container started");

        Ok(Container {
            id: Some(created.id),
            name: spec.name,
            addr: Some(addr),
        })
    }

    async fn init(&self, container: &Container, payload: Value) -> Result<RunResult> {
        let addr = container
            .addr
            .as_deref()
            .with_context(|| format!("Container {} has no init address", container.name))?;

        let started_at = now_millis();
        let response = self
            .http
            .post(format!("http://{}/init", addr))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Init call to container {} failed", container.name))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let ended_at = now_millis();

        let code = if status.is_success() {
            0
        } else {
            i32::from(status.as_u16())
        };
        Ok(RunResult {
            started_at,
            ended_at,
            response: Some((code, body)),
        })
    }

    async fn pause(&self, container: &Container) -> Result<()> {
        self.docker
            .pause_container(&container.name)
            .await
            .with_context(|| format!("Failed to pause container {}", container.name))
    }

    async fn unpause(&self, container: &Container) -> Result<()> {
        self.docker
            .unpause_container(&container.name)
            .await
            .with_context(|| format!("Failed to unpause container {}", container.name))
    }

    async fn kill(&self, container: &Container) -> Result<()> {
        self.docker
            .kill_container(
                &container.name,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
            .with_context(|| format!("Failed to kill container {}", container.name))
    }

    async fn remove(&self, container: &Container) -> Result<()> {
        self.docker
            .remove_container(
                &container.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {}", container.name))
    }

    async fn get_logs(&self, container: &Container) -> Result<String> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&container.name, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(log_output) => {
                    let line = log_output.to_string();
                    if output.len() + line.len() > MAX_LOG_BYTES {
                        output.push_str(&line[..MAX_LOG_BYTES.saturating_sub(output.len())]);
                        output.push_str("\n... (truncated)");
                        break;
                    }
                    output.push_str(&line);
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => break,
                Err(e) => return Err(e).context("Failed to fetch container logs"),
            }
        }

        Ok(output)
    }

    async fn get_log_size(&self, container: &Container) -> Result<u64> {
        let inspect = self
            .docker
            .inspect_container(&container.name, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let Some(log_path) = inspect.log_path.filter(|p| !p.is_empty()) else {
            return Ok(0);
        };
        let meta = tokio::fs::metadata(&log_path)
            .await
            .with_context(|| format!("Failed to stat log file {}", log_path))?;
        Ok(meta.len())
    }

    async fn list_all(&self) -> Result<Vec<Container>> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .and_then(|names| names.first().cloned())
                    .map(|name| name.trim_start_matches('/').to_string())?;
                Some(Container {
                    id: c.id,
                    name,
                    addr: None,
                })
            })
            .collect())
    }
}
