//! Mnemo core crate - shared types, error taxonomy, configuration, logging.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::MnemoConfig;
pub use error::{MnemoError, Result};
pub use types::*;
