//! Coyote Configuration System
//!
//! Provides the runtime limits used by the Coyote execution core:
//! - Value-stack limits (maximum size, overflow slack, per-call minimum)
//! - Host-call nesting limit
//! - Finalizer retry policy
//! - Memory budget for the limited allocator
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.coyote/config.toml)
//! 2. Project config (./coyote.toml, searched upward)
//! 3. Environment variables (COYOTE_*)
//!
//! # Example
//!
//! ```no_run
//! use coyote_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! let limits = config.limits();
//! assert!(limits.max_stack > limits.min_stack);
//! ```

pub mod limits;
pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use limits::VmLimits;
pub use loader::{Config, ConfigLoader};
pub use settings::{CoyoteConfig, LimitsConfig, MemoryConfig};
