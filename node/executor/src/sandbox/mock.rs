//! In-memory runtime and fetcher for exercising the runner without Docker.

use super::{
    fetch::SourceFetcher,
    harness::{END_MARKER, START_MARKER},
    runtime::{ContainerRuntime, ContainerSpec, StatsSample},
};
use crate::error::SandboxError;
use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockExit {
    Code(i64),
    /// Never exits.
    Hang,
}

/// Scripted behaviour of one container.
#[derive(Debug, Clone)]
pub struct MockRun {
    pub stdout: String,
    pub stats: Vec<StatsSample>,
    /// Ends the stats stream with a decode failure.
    pub stats_error: Option<String>,
    pub start_error: Option<String>,
    pub exit: MockExit,
}

impl MockRun {
    /// Clean run printing `stdout` between the markers.
    pub fn printing(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stats: vec![StatsSample {
                memory_usage: 32 * 1024 * 1024,
                cpu_total_usage: 200,
                system_cpu_usage: 1000,
                online_cpus: 1,
                rx_bytes: 1024,
                tx_bytes: 512,
                ..Default::default()
            }],
            stats_error: None,
            start_error: None,
            exit: MockExit::Code(0),
        }
    }

    pub fn exiting(code: i64) -> Self {
        Self {
            exit: MockExit::Code(code),
            ..Self::printing("")
        }
    }

    pub fn hanging() -> Self {
        Self {
            exit: MockExit::Hang,
            ..Self::printing("")
        }
    }

    /// Stats stream breaks while the container keeps running.
    pub fn failing_stats(reason: &str) -> Self {
        Self {
            stats_error: Some(reason.to_string()),
            ..Self::hanging()
        }
    }

    pub fn failing_start(reason: &str) -> Self {
        Self {
            start_error: Some(reason.to_string()),
            ..Self::printing("")
        }
    }
}

#[derive(Default)]
struct MockState {
    queued: VecDeque<MockRun>,
    containers: HashMap<String, MockRun>,
    specs: Vec<ContainerSpec>,
    removed: Vec<String>,
}

/// Container runtime that plays back queued [`MockRun`]s, one per container.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    pull_error: Option<String>,
    create_error: Option<String>,
}

impl MockRuntime {
    pub fn new(runs: Vec<MockRun>) -> Self {
        Self {
            state: Mutex::new(MockState {
                queued: runs.into(),
                ..Default::default()
            }),
            pull_error: None,
            create_error: None,
        }
    }

    pub fn failing_pull(reason: &str) -> Self {
        Self {
            pull_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_create(reason: &str) -> Self {
        Self {
            create_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    /// Specs of every container created so far.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().specs.clone()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        let state = self.lock();
        state
            .containers
            .keys()
            .filter(|id| !state.removed.contains(id))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a poisoned lock only happens after a test already panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_for(&self, id: &str) -> Option<MockRun> {
        self.lock().containers.get(id).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        match &self.pull_error {
            Some(reason) => Err(SandboxError::ImagePull {
                image: image.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        if let Some(reason) = &self.create_error {
            return Err(SandboxError::ContainerCreate(reason.clone()));
        }
        let mut state = self.lock();
        let run = state
            .queued
            .pop_front()
            .ok_or_else(|| SandboxError::ContainerCreate("no scripted run left".to_string()))?;
        let id = format!("mock-{}", state.specs.len());
        state.specs.push(spec.clone());
        state.containers.insert(id.clone(), run);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        match self.run_for(id) {
            Some(MockRun {
                start_error: Some(reason),
                ..
            }) => Err(SandboxError::ContainerStart {
                id: id.to_string(),
                reason,
            }),
            Some(_) => Ok(()),
            None => Err(SandboxError::ContainerStart {
                id: id.to_string(),
                reason: "no such container".to_string(),
            }),
        }
    }

    fn stats<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<StatsSample, SandboxError>> {
        let (samples, failure) = self
            .run_for(id)
            .map(|run| (run.stats, run.stats_error))
            .unwrap_or_default();
        let frames = samples
            .into_iter()
            .map(Ok)
            .chain(failure.map(|reason| Err(SandboxError::Stats(reason))));
        stream::iter(frames).boxed()
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, SandboxError>> {
        let chunks = match self.run_for(id) {
            Some(run) if run.exit != MockExit::Hang => vec![
                "go: creating new go.mod: module code\n".to_string(),
                format!("{}\n", START_MARKER),
                format!("{}\n", run.stdout),
                format!("{}\n", END_MARKER),
            ],
            _ => Vec::new(),
        };
        stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        match self.run_for(id).map(|run| run.exit) {
            Some(MockExit::Code(code)) => Ok(code),
            Some(MockExit::Hang) => futures::future::pending().await,
            None => Err(SandboxError::Wait(format!("no such container {}", id))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        self.lock().removed.push(id.to_string());
        Ok(())
    }
}

/// Serves the same source for every reference and records what was asked for.
pub struct StaticFetcher {
    source: Vec<u8>,
    fetched: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new(source: &[u8]) -> Self {
        Self {
            source: source.to_vec(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched
            .lock()
            .map(|refs| refs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, source_ref: &str) -> Result<Vec<u8>, SandboxError> {
        if let Ok(mut refs) = self.fetched.lock() {
            refs.push(source_ref.to_string());
        }
        Ok(self.source.clone())
    }
}
