pub mod aggregator;
pub mod arguments;
pub mod config;
pub mod error;
pub mod executor;
pub mod fees;
pub mod keeper;
pub mod proof;
pub mod sandbox;
pub mod submitter;
pub mod validation;

pub use config::{KeeperConfig, ProofSource, SandboxConfig};
pub use error::{ConversionError, ExecutorError, ProofError, SandboxError};
pub use executor::{JobExecutor, Stage};
pub use keeper::{Keeper, PerformedTask};
