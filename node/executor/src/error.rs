use keeper_common::{BundleError, ChainError, UnsupportedTaskDefinition};
use std::time::Duration;
use thiserror::Error;

/// Everything that can end one execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    UnsupportedTaskDefinition(#[from] UnsupportedTaskDefinition),

    #[error("argument resolution failed: {0}")]
    Arguments(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error("aggregator rejected task: {0}")]
    Aggregator(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to fetch source from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("failed to prepare build context: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("failed to create container: {0}")]
    ContainerCreate(String),

    #[error("failed to start container {id}: {reason}")]
    ContainerStart { id: String, reason: String },

    #[error("container exited with status {0}")]
    NonZeroExit(i64),

    #[error("failed to decode container stats: {0}")]
    Stats(String),

    #[error("failed waiting for container: {0}")]
    Wait(String),

    #[error("failed reading container logs: {0}")]
    Logs(String),

    #[error("failed to remove container {id}: {reason}")]
    ContainerRemove { id: String, reason: String },

    #[error("container did not finish within {0:?}")]
    Timeout(Duration),

    #[error("script produced no output")]
    EmptyOutput,
}

/// An argument could not be turned into its ABI type.
#[derive(Debug, Error, PartialEq)]
#[error("argument {index} cannot be converted to {target}: {reason}")]
pub struct ConversionError {
    pub index: usize,
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("tls connection failed: {0}")]
    Tls(String),

    #[error("no tls certificates found in connection state")]
    NoCertificates,

    #[error("certificate validation failed: {0}")]
    InvalidCertificate(String),

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;
