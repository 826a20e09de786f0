//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::limits::VmLimits;
use crate::settings::{CoyoteConfig, LimitsConfig, MemoryConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the per-project configuration file
pub const PROJECT_CONFIG_FILE: &str = "coyote.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.coyote/config.toml) - lowest priority
/// 2. Project config (./coyote.toml) - overrides global
/// 3. Environment variables (COYOTE_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Effective settings after merging every layer
    pub settings: CoyoteConfig,

    /// Directory where coyote.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of ~/.coyote/config.toml
    pub fn with_global_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find coyote.toml, layers it over the
    /// global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        self.finish(project_root, project_config)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = CoyoteConfig::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.finish(project_root, project_config)
    }

    fn finish(
        &mut self,
        project_root: Option<PathBuf>,
        project_config: CoyoteConfig,
    ) -> ConfigResult<Config> {
        let mut settings = self.load_global_config()?;
        settings.merge(&project_config);
        let settings = self.apply_env_overrides(settings)?;
        settings.validate()?;

        Ok(Config {
            settings,
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, CoyoteConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = CoyoteConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, CoyoteConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.coyote/config.toml
    fn load_global_config(&mut self) -> ConfigResult<CoyoteConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match CoyoteConfig::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                // No home directory means no global layer
                Err(ConfigError::HomeNotFound) => return Ok(CoyoteConfig::default()),
                Err(e) => return Err(e),
            },
        };

        // Global config is optional - if it doesn't exist, return default
        if !path.exists() {
            return Ok(CoyoteConfig::default());
        }

        CoyoteConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognised: COYOTE_MAX_STACK, COYOTE_MAX_C_CALLS, COYOTE_MEMORY_LIMIT
    fn apply_env_overrides(&self, mut config: CoyoteConfig) -> ConfigResult<CoyoteConfig> {
        if let Some(max_stack) = env_number::<usize>("COYOTE_MAX_STACK")? {
            config
                .limits
                .get_or_insert_with(LimitsConfig::default)
                .max_stack = Some(max_stack);
        }

        if let Some(max_c_calls) = env_number::<u32>("COYOTE_MAX_C_CALLS")? {
            config
                .limits
                .get_or_insert_with(LimitsConfig::default)
                .max_c_calls = Some(max_c_calls);
        }

        if let Some(limit) = env_number::<usize>("COYOTE_MEMORY_LIMIT")? {
            config.memory = Some(MemoryConfig {
                limit_bytes: Some(limit),
            });
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.coyote)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".coyote"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> ConfigResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("expected a non-negative integer, got '{}'", raw),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Get the effective VM limits
    pub fn limits(&self) -> VmLimits {
        self.settings.limits()
    }

    /// Get the effective memory budget
    pub fn memory_limit(&self) -> Option<usize> {
        self.settings.memory_limit()
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Whether a coyote.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(PROJECT_CONFIG_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn isolated_loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::with_global_config_path(dir.path().join("no-global.toml"))
    }

    #[test]
    #[serial]
    fn test_load_project_config() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
max_stack = 8000
"#,
        );

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.limits().max_stack, 8000);
        assert!(config.is_project());
    }

    #[test]
    #[serial]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
max_c_calls = 90
"#,
        );

        let sub_dir = temp_dir.path().join("a").join("b");
        fs::create_dir_all(&sub_dir).unwrap();

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.limits().max_c_calls, 90);
        assert_eq!(config.project_root(), Some(temp_dir.path()));
    }

    #[test]
    #[serial]
    fn test_no_project_config() {
        let temp_dir = TempDir::new().unwrap();

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.limits(), VmLimits::default());
        assert!(!config.is_project());
    }

    #[test]
    #[serial]
    fn test_project_overrides_global() {
        let global_dir = TempDir::new().unwrap();
        let global_path = global_dir.path().join("config.toml");
        fs::write(
            &global_path,
            r#"
[limits]
max_stack = 6000
max_c_calls = 40

[memory]
limit_bytes = 2048
"#,
        )
        .unwrap();

        let project_dir = TempDir::new().unwrap();
        create_config_file(
            project_dir.path(),
            r#"
[limits]
max_c_calls = 120
"#,
        );

        let mut loader = ConfigLoader::with_global_config_path(global_path);
        let config = loader.load_from_directory(project_dir.path()).unwrap();

        assert_eq!(config.limits().max_stack, 6000);
        assert_eq!(config.limits().max_c_calls, 120);
        assert_eq!(config.memory_limit(), Some(2048));
    }

    #[test]
    #[serial]
    fn test_env_overrides_project() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
max_stack = 8000
"#,
        );

        env::set_var("COYOTE_MAX_STACK", "9000");
        env::set_var("COYOTE_MEMORY_LIMIT", "65536");

        let mut loader = isolated_loader(&temp_dir);
        let result = loader.load_from_directory(temp_dir.path());

        env::remove_var("COYOTE_MAX_STACK");
        env::remove_var("COYOTE_MEMORY_LIMIT");

        let config = result.unwrap();
        assert_eq!(config.limits().max_stack, 9000);
        assert_eq!(config.memory_limit(), Some(65536));
    }

    #[test]
    #[serial]
    fn test_malformed_env_value() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("COYOTE_MAX_C_CALLS", "lots");
        let mut loader = isolated_loader(&temp_dir);
        let result = loader.load_from_directory(temp_dir.path());
        env::remove_var("COYOTE_MAX_C_CALLS");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    #[serial]
    fn test_env_can_make_config_invalid() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("COYOTE_MAX_C_CALLS", "3");
        let mut loader = isolated_loader(&temp_dir);
        let result = loader.load_from_directory(temp_dir.path());
        env::remove_var("COYOTE_MAX_C_CALLS");

        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_invalid_toml_reports_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = create_config_file(temp_dir.path(), "[limits\nmax_stack = 1");

        let mut loader = isolated_loader(&temp_dir);
        match loader.load_from_file(&path) {
            Err(ConfigError::TomlParseError { file, .. }) => assert_eq!(file, path),
            other => panic!("expected TOML parse error, got {:?}", other),
        }
    }
}
