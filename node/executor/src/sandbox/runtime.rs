//! Container runtime seam and its Docker implementation.

use crate::error::SandboxError;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use std::collections::HashMap;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub memory_limit: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// One decoded resource-statistics frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub memory_usage: u64,
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u64,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    pub block_read: u64,
    pub block_write: u64,
}

impl StatsSample {
    pub fn cpu_percentage(&self) -> f64 {
        if self.system_cpu_usage == 0 {
            return 0.0;
        }
        self.cpu_total_usage as f64 / self.system_cpu_usage as f64 * self.online_cpus as f64 * 100.0
    }
}

/// Lifecycle operations on isolated containers.
///
/// Streams borrow the runtime so the runner can drive them from tasks that
/// own an `Arc` of it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start_container(&self, id: &str) -> Result<(), SandboxError>;

    fn stats<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<StatsSample, SandboxError>>;

    /// Raw log chunks, stdout and stderr interleaved.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, SandboxError>>;

    /// Resolves with the exit status once the container stops.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Forced removal.
    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;
}

/// Docker daemon runtime using the `bollard` crate.
pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::Unavailable(format!(
                "failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        use bollard::image::CreateImageOptions;

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(reason) = info.error {
                return Err(SandboxError::ImagePull {
                    image: image.to_string(),
                    reason,
                });
            }
        }
        tracing::debug!(image = %image, "Image ready");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            memory: spec.memory_limit,
            nano_cpus: spec.nano_cpus,
            // Security: no privilege escalation
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(256),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            tty: Some(true),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                "managed-by".to_string(),
                "keeper-sandbox".to_string(),
            )])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::ContainerCreate(e.to_string()))?;

        for warning in &response.warnings {
            tracing::warn!(container = %response.id, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| SandboxError::ContainerStart {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    fn stats<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<StatsSample, SandboxError>> {
        use bollard::container::StatsOptions;

        self.docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            )
            .map(|item| {
                item.map(sample_from_stats)
                    .map_err(|e| SandboxError::Stats(e.to_string()))
            })
            .boxed()
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, SandboxError>> {
        use bollard::container::LogsOptions;

        self.docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|item| {
                item.map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
                    .map_err(|e| SandboxError::Logs(e.to_string()))
            })
            .boxed()
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        use bollard::container::WaitContainerOptions;

        let mut waiter = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match waiter.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Wait(e.to_string())),
            None => Err(SandboxError::Wait(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::ContainerRemove {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

fn sample_from_stats(stats: bollard::container::Stats) -> StatsSample {
    let mut sample = StatsSample {
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|per_cpu| per_cpu.len() as u64)
            .filter(|count| *count > 0)
            .or(stats.cpu_stats.online_cpus)
            .unwrap_or(1),
        ..Default::default()
    };

    for network in stats.networks.unwrap_or_default().values() {
        sample.rx_bytes += network.rx_bytes;
        sample.rx_packets += network.rx_packets;
        sample.rx_errors += network.rx_errors;
        sample.rx_dropped += network.rx_dropped;
        sample.tx_bytes += network.tx_bytes;
        sample.tx_packets += network.tx_packets;
        sample.tx_errors += network.tx_errors;
        sample.tx_dropped += network.tx_dropped;
    }

    for entry in stats
        .blkio_stats
        .io_service_bytes_recursive
        .unwrap_or_default()
    {
        match entry.op.to_ascii_lowercase().as_str() {
            "read" => sample.block_read += entry.value,
            "write" => sample.block_write += entry.value,
            _ => {}
        }
    }

    sample
}
