pub mod contracts;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{BundleError, ChainError, UnsupportedTaskDefinition};
pub use types::*;
