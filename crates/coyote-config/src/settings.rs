//! Configuration file format (coyote.toml and ~/.coyote/config.toml)
//!
//! Both files share one schema. Every field is optional so a file only has to
//! mention what it overrides.

use crate::limits::VmLimits;
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of a Coyote configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CoyoteConfig {
    /// Stack and call limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    /// Memory budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
}

/// `[limits]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest regular stack size, in slots (default: 1000000)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stack: Option<usize>,

    /// Extra slots available while reporting a stack overflow (default: 200)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack_extra: Option<usize>,

    /// Free slots guaranteed to each native call (default: 20)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_stack: Option<usize>,

    /// Host-call nesting limit (default: 200)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_c_calls: Option<u32>,

    /// Retries of a failing finalizer pass (default: unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalizer_retry_limit: Option<u32>,
}

/// `[memory]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Byte budget enforced by the limited allocator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<usize>,
}

impl CoyoteConfig {
    /// Load a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the limits this file would produce on top of the defaults
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(memory) = &self.memory {
            if memory.limit_bytes == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "memory.limit_bytes".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        self.limits().validate()
    }

    /// Get the global config file path (~/.coyote/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        Ok(crate::loader::ConfigLoader::global_config_dir()?.join("config.toml"))
    }

    /// Resolve the limits, falling back to defaults for anything unset
    pub fn limits(&self) -> VmLimits {
        let mut limits = VmLimits::default();
        if let Some(section) = &self.limits {
            if let Some(v) = section.max_stack {
                limits.max_stack = v;
            }
            if let Some(v) = section.error_stack_extra {
                limits.error_stack_extra = v;
            }
            if let Some(v) = section.min_stack {
                limits.min_stack = v;
            }
            if let Some(v) = section.max_c_calls {
                limits.max_c_calls = v;
            }
            if section.finalizer_retry_limit.is_some() {
                limits.finalizer_retry_limit = section.finalizer_retry_limit;
            }
        }
        limits
    }

    /// Byte budget for the limited allocator, if any
    pub fn memory_limit(&self) -> Option<usize> {
        self.memory.as_ref().and_then(|m| m.limit_bytes)
    }

    /// Merge another config into this one
    /// Other config takes precedence field by field
    pub fn merge(&mut self, other: &CoyoteConfig) {
        if let Some(theirs) = &other.limits {
            let ours = self.limits.get_or_insert_with(LimitsConfig::default);
            if theirs.max_stack.is_some() {
                ours.max_stack = theirs.max_stack;
            }
            if theirs.error_stack_extra.is_some() {
                ours.error_stack_extra = theirs.error_stack_extra;
            }
            if theirs.min_stack.is_some() {
                ours.min_stack = theirs.min_stack;
            }
            if theirs.max_c_calls.is_some() {
                ours.max_c_calls = theirs.max_c_calls;
            }
            if theirs.finalizer_retry_limit.is_some() {
                ours.finalizer_retry_limit = theirs.finalizer_retry_limit;
            }
        }
        if let Some(theirs) = &other.memory {
            if theirs.limit_bytes.is_some() {
                self.memory = Some(theirs.clone());
            }
        }
    }
}
