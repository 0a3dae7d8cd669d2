//! Ephemeral container runs of untrusted scripts with resource metering.
//!
//! Each run gets its own build context and container. While the container
//! executes, a stats reader, a log scanner and the exit wait run concurrently
//! against one hard deadline. The container is force-removed on every path.

pub mod fetch;
pub mod harness;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod runtime;

pub use fetch::{GatewayFetcher, SourceFetcher};
pub use harness::condition_status;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime, StatsSample};

use crate::{
    config::SandboxConfig,
    error::SandboxError,
    fees::{compute_fee, FeeBreakdown, FeeInputs},
};
use futures::StreamExt;
use harness::{BuildContext, LogCapture, WORKDIR};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

/// Counters and output of one finished container run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStats {
    pub output: String,
    pub memory_usage: u64,
    pub cpu_percentage: f64,
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
    /// Bytes per second of program runtime.
    pub bandwidth_rate: f64,
    pub execution_time: Duration,
    pub source_size: usize,
    pub condition_satisfied: bool,
    pub fee: FeeBreakdown,
}

impl ResourceStats {
    fn from_run(run: FinishedRun, source_size: usize) -> Self {
        let sample = run.stats.unwrap_or_default();
        let transferred = (sample.rx_bytes + sample.tx_bytes) as f64;
        let seconds = run.execution_time.as_secs_f64();
        let bandwidth_rate = if seconds > 0.0 {
            transferred / seconds
        } else {
            transferred
        };

        let fee = compute_fee(&FeeInputs {
            source_size_bytes: source_size,
            execution_time: run.execution_time,
            memory_used_bytes: sample.memory_usage,
            number_of_attesters: 0,
        });

        Self {
            condition_satisfied: condition_status(&run.output),
            output: run.output,
            memory_usage: sample.memory_usage,
            cpu_percentage: sample.cpu_percentage(),
            rx_bytes: sample.rx_bytes,
            rx_packets: sample.rx_packets,
            rx_errors: sample.rx_errors,
            rx_dropped: sample.rx_dropped,
            tx_bytes: sample.tx_bytes,
            tx_packets: sample.tx_packets,
            tx_errors: sample.tx_errors,
            tx_dropped: sample.tx_dropped,
            block_read: sample.block_read,
            block_write: sample.block_write,
            bandwidth_rate,
            execution_time: run.execution_time,
            source_size,
            fee,
        }
    }
}

struct FinishedRun {
    output: String,
    stats: Option<StatsSample>,
    execution_time: Duration,
}

/// Runs scripts in fresh containers.
pub struct SandboxRunner {
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn SourceFetcher>,
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn SourceFetcher>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            fetcher,
            config,
        }
    }

    /// Fetch the script behind `source_ref`, run it and meter the run.
    pub async fn run(&self, source_ref: &str) -> Result<ResourceStats, SandboxError> {
        let source = self.fetcher.fetch(source_ref).await?;
        let source_size = source.len();
        let context = tokio::task::spawn_blocking(move || BuildContext::prepare(&source))
            .await
            .map_err(|e| SandboxError::Workspace(std::io::Error::other(e)))??;

        self.runtime.pull_image(&self.config.image).await?;

        let spec = ContainerSpec {
            name: format!("keeper-sandbox-{}", uuid::Uuid::new_v4()),
            image: self.config.image.clone(),
            cmd: BuildContext::command(),
            working_dir: WORKDIR.to_string(),
            binds: vec![context.bind()],
            memory_limit: self.config.memory_limit,
            nano_cpus: self.config.nano_cpus,
        };
        let id = self.runtime.create_container(&spec).await?;
        let guard = ContainerGuard::new(self.runtime.clone(), id.clone());
        info!(container = %id, source = %source_ref, image = %self.config.image, "Sandbox container created");

        let finished = self.supervise(&id).await;
        guard.release().await;
        drop(context);

        let run = finished?;
        let stats = ResourceStats::from_run(run, source_size);
        info!(
            source = %source_ref,
            execution_ms = stats.execution_time.as_millis() as u64,
            memory = stats.memory_usage,
            total_fee = stats.fee.total_fee,
            "Sandbox run finished"
        );
        Ok(stats)
    }

    async fn supervise(&self, id: &str) -> Result<FinishedRun, SandboxError> {
        self.runtime.start_container(id).await?;
        let started = Instant::now();

        let (stats_stop, stats_stop_rx) = watch::channel(false);
        let (logs_stop, logs_stop_rx) = watch::channel(false);
        let (stats_err_tx, mut stats_err_rx) = mpsc::channel(1);

        let stats_task = tokio::spawn(collect_stats(
            self.runtime.clone(),
            id.to_string(),
            stats_stop_rx,
            stats_err_tx,
        ));
        let mut log_task = tokio::spawn(scan_logs(
            self.runtime.clone(),
            id.to_string(),
            logs_stop_rx,
        ));

        let deadline = tokio::time::sleep(self.config.timeout);
        let exit = tokio::select! {
            status = self.runtime.wait(id) => status,
            Some(err) = stats_err_rx.recv() => Err(err),
            _ = deadline => Err(SandboxError::Timeout(self.config.timeout)),
        };
        let container_time = started.elapsed();
        let _ = stats_stop.send(true);

        let exit = match exit {
            Ok(0) => Ok(()),
            Ok(code) => Err(SandboxError::NonZeroExit(code)),
            Err(err) => Err(err),
        };
        if let Err(err) = exit {
            warn!(container = %id, error = %err, "Sandbox run failed");
            let _ = logs_stop.send(true);
            stats_task.abort();
            log_task.abort();
            return Err(err);
        }

        let stats = stats_task
            .await
            .map_err(|e| SandboxError::Stats(e.to_string()))?;

        let capture = match tokio::time::timeout(self.config.log_drain_grace, &mut log_task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(container = %id, "Log stream still open after exit, stopping reader");
                let _ = logs_stop.send(true);
                log_task.await
            }
        }
        .map_err(|e| SandboxError::Logs(e.to_string()))?;

        let execution_time = match capture.execution_time() {
            Some(measured) if !measured.is_zero() => measured,
            _ => container_time,
        };

        Ok(FinishedRun {
            output: capture.output(),
            stats,
            execution_time,
        })
    }
}

/// Keeps the last meaningful stats frame until told to stop.
async fn collect_stats(
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    mut stop: watch::Receiver<bool>,
    errors: mpsc::Sender<SandboxError>,
) -> Option<StatsSample> {
    let mut frames = runtime.stats(&id);
    let mut latest: Option<StatsSample> = None;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = frames.next() => match frame {
                // frames sent after exit are zeroed
                Some(Ok(sample)) if sample.cpu_total_usage > 0 || latest.is_none() => latest = Some(sample),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = errors.send(err).await;
                    break;
                }
                None => break,
            }
        }
    }
    latest
}

async fn scan_logs(
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    mut stop: watch::Receiver<bool>,
) -> LogCapture {
    let mut chunks = runtime.logs(&id);
    let mut capture = LogCapture::default();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            chunk = chunks.next() => match chunk {
                Some(Ok(text)) => capture.push_chunk(&text, Instant::now()),
                Some(Err(err)) => {
                    warn!(container = %id, error = %err, "Log stream failed");
                    break;
                }
                None => break,
            }
        }
    }
    capture.finish(Instant::now())
}

/// Force-removes its container when released or dropped.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Reached only when the run future is cancelled before release.
        if let Some(id) = self.id.take() {
            let runtime = self.runtime.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { remove(runtime.as_ref(), &id).await });
            } else {
                warn!(container = %id, "No runtime to remove container on drop");
            }
        }
    }
}

async fn remove(runtime: &dyn ContainerRuntime, id: &str) {
    match runtime.remove_container(id).await {
        Ok(()) => debug!(container = %id, "Sandbox container removed"),
        Err(err) => warn!(container = %id, error = %err, "Failed to remove sandbox container"),
    }
}
