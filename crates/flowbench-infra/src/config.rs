//! Engine configuration loader.
//!
//! Resolution order:
//! 1. an explicit path (`--config`), which must exist and parse;
//! 2. `./flowbench.toml`;
//! 3. `{config_dir}/flowbench/config.toml`.
//!
//! A missing implicit file yields [`EngineConfig::default()`]. A malformed
//! implicit file logs a warning and also yields the default.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use flowbench_types::config::EngineConfig;

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "flowbench.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A validated configuration and the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EngineConfig,
    pub source: Option<PathBuf>,
}

/// Load and validate the engine configuration.
pub async fn load_engine_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    if let Some(path) = explicit {
        let config = read_config_file(path).await?;
        validate_config(&config)?;
        return Ok(LoadedConfig {
            config,
            source: Some(path.to_path_buf()),
        });
    }

    for path in implicit_config_paths() {
        match read_config_file(&path).await {
            Ok(config) => {
                validate_config(&config)?;
                tracing::debug!(path = %path.display(), "Loaded configuration");
                return Ok(LoadedConfig {
                    config,
                    source: Some(path),
                });
            }
            Err(ConfigError::NotFound(_)) => continue,
            Err(err) => {
                tracing::warn!("{err}, using defaults");
                return Ok(LoadedConfig {
                    config: EngineConfig::default(),
                    source: None,
                });
            }
        }
    }

    tracing::debug!("No configuration file found, using defaults");
    Ok(LoadedConfig {
        config: EngineConfig::default(),
        source: None,
    })
}

/// Candidate locations when no explicit path is given, in lookup order.
pub fn implicit_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("flowbench").join("config.toml"));
    }
    paths
}

/// Read and parse one config file.
pub async fn read_config_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Cross-reference checks serde cannot express.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    let mut problems = Vec::new();

    if config.engine.max_concurrency == 0 {
        problems.push("engine.max_concurrency must be at least 1".to_string());
    }
    if config.benchmark.max_parallel == 0 {
        problems.push("benchmark.max_parallel must be at least 1".to_string());
    }

    let mut adapters = HashSet::new();
    for adapter in &config.adapters {
        if !adapters.insert(adapter.name.as_str()) {
            problems.push(format!("duplicate adapter '{}'", adapter.name));
        }
    }

    let mut models = HashSet::new();
    for model in &config.models {
        if !models.insert(model.name.as_str()) {
            problems.push(format!("duplicate model '{}'", model.name));
        }
        if model.adapters.is_empty() {
            problems.push(format!("model '{}' has no adapters", model.name));
        }
        for binding in &model.adapters {
            if !adapters.contains(binding.adapter.as_str()) {
                problems.push(format!(
                    "model '{}' references unknown adapter '{}'",
                    model.name, binding.adapter
                ));
            }
        }
    }

    if let Some(default) = &config.engine.default_model {
        if !models.contains(default.as_str()) {
            problems.push(format!("engine.default_model '{default}' is not a configured model"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = r#"
[engine]
max_concurrency = 2
default_model = "fast"

[[adapters]]
name = "ollama"
type = "openai_compatible"
base_url = "http://localhost:11434/v1"
locality = "local"

[[models]]
name = "fast"

[[models.adapters]]
adapter = "ollama"
model = "llama3.2"
"#;

    #[tokio::test]
    async fn load_engine_config_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        tokio::fs::write(&path, VALID).await.unwrap();

        let loaded = load_engine_config(Some(&path)).await.unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.engine.max_concurrency, 2);
        assert_eq!(loaded.config.models[0].adapters[0].model, "llama3.2");
    }

    #[tokio::test]
    async fn load_engine_config_explicit_missing_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.toml");
        let err = load_engine_config(Some(&path)).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_engine_config_explicit_malformed_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, "this is not { valid toml !!!").await.unwrap();

        let err = load_engine_config(Some(&path)).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[tokio::test]
    async fn read_config_file_empty_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.toml");
        tokio::fs::write(&path, "").await.unwrap();

        let config = read_config_file(&path).await.unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn validate_rejects_unknown_adapter_binding() {
        let mut config: EngineConfig = toml::from_str(VALID).unwrap();
        config.models[0].adapters[0].adapter = "vllm".into();

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown adapter 'vllm'"));
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut config: EngineConfig = toml::from_str(VALID).unwrap();
        config.adapters.push(config.adapters[0].clone());
        config.models.push(config.models[0].clone());

        let ConfigError::Invalid(problems) = validate_config(&config).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(problems.contains(&"duplicate adapter 'ollama'".to_string()));
        assert!(problems.contains(&"duplicate model 'fast'".to_string()));
    }

    #[test]
    fn validate_rejects_unknown_default_model() {
        let mut config: EngineConfig = toml::from_str(VALID).unwrap();
        config.engine.default_model = Some("slow".into());

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("default_model 'slow'"));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = EngineConfig::default();
        config.engine.max_concurrency = 0;
        config.benchmark.max_parallel = 0;

        let ConfigError::Invalid(problems) = validate_config(&config).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn implicit_paths_start_with_local_file() {
        let paths = implicit_config_paths();
        assert_eq!(paths[0], PathBuf::from(LOCAL_CONFIG_FILE));
    }
}
