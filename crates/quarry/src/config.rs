//! Engine configuration.
//!
//! Read from TOML, YAML or JSON. Every field is optional:
//!
//! ```toml
//! progress_interval = 1000
//!
//! [runner]
//! threads = 4
//!
//! [annotations]
//! max_sample_sets = 1000
//! max_sample_records = 100
//!
//! [optimizer]
//! enabled = true
//! ```

use crate::annotation::InMemoryRowAnnotationFactory;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runner: RunnerConfig,
    pub annotations: AnnotationConfig,
    pub optimizer: OptimizerConfig,
    /// Rows between progress notifications; 0 disables them.
    pub progress_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker threads. 1 runs tables one after another on the calling thread.
    pub threads: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub max_sample_sets: usize,
    pub max_sample_records: usize,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            max_sample_sets: InMemoryRowAnnotationFactory::DEFAULT_MAX_SAMPLE_SETS,
            max_sample_records: InMemoryRowAnnotationFactory::DEFAULT_MAX_SAMPLE_RECORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Push eligible filters into the source query.
    pub enabled: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
}

impl EngineConfig {
    /// Parse with an explicit format (`json`, `yaml`/`yml`, `toml`).
    pub fn from_bytes_format(data: &[u8], format: &str) -> Result<Self, ConfigError> {
        match format {
            "json" => serde_json::from_slice(data).map_err(|e| ConfigError::Parse(e.to_string())),
            "yaml" | "yml" => {
                serde_yaml::from_slice(data).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            "toml" => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| ConfigError::Parse(format!("Invalid UTF-8: {}", e)))?;
                toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Read a config file; the format follows the extension, TOML if none.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "toml".to_string());
        Self::from_bytes_format(&data, &format)
    }

    /// Like [`from_path`](Self::from_path), but a missing or broken file
    /// yields the defaults.
    pub fn load_from_path(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.runner.threads, 1);
        assert_eq!(config.annotations.max_sample_sets, 1000);
        assert_eq!(config.annotations.max_sample_records, 100);
        assert!(config.optimizer.enabled);
        assert_eq!(config.progress_interval, 0);
    }

    #[test]
    fn test_partial_toml() {
        let toml = b"[runner]\nthreads = 4\n\n[optimizer]\nenabled = false\n";
        let config = EngineConfig::from_bytes_format(toml, "toml").unwrap();

        assert_eq!(config.runner.threads, 4);
        assert!(!config.optimizer.enabled);
        assert_eq!(config.annotations, AnnotationConfig::default());
    }

    #[test]
    fn test_yaml_and_json() {
        let yaml = b"annotations:\n  max_sample_records: 5\nprogress_interval: 10\n";
        let config = EngineConfig::from_bytes_format(yaml, "yml").unwrap();
        assert_eq!(config.annotations.max_sample_records, 5);
        assert_eq!(config.annotations.max_sample_sets, 1000);
        assert_eq!(config.progress_interval, 10);

        let json = br#"{"runner": {"threads": 2}}"#;
        assert_eq!(EngineConfig::from_bytes_format(json, "json").unwrap().runner.threads, 2);
    }

    #[test]
    fn test_unsupported_format() {
        assert!(matches!(
            EngineConfig::from_bytes_format(b"", "ini"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_from_path_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "runner:\n  threads: 3").unwrap();

        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.runner.threads, 3);
    }

    #[test]
    fn test_load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.toml");
        assert_eq!(EngineConfig::load_from_path(Some(&missing)), EngineConfig::default());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "runner = [").unwrap();
        assert_eq!(EngineConfig::load_from_path(Some(&broken)), EngineConfig::default());

        assert_eq!(EngineConfig::load_from_path(None), EngineConfig::default());
    }
}
