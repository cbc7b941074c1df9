use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_ENV_PREFIX: &str = "SHELFSIGHT";
const DEFAULT_CONFIG_FILE: &str = "shelfsight";
const DATABASE_FILENAME: &str = "shelfsight.db";

/// Everything the classifier and its binary can be tuned with.
/// Every field has a default, so an empty (or missing) config file is valid.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model: ModelConfig,
    pub thresholds: Thresholds,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// ONNX export of the embedding network, truncated after its pooling layer.
    pub path: PathBuf,
    pub input_height: usize,
    pub input_width: usize,
    pub embedding_dim: usize,
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models").join("mobilenet_v2_feature_vector.onnx"),
            input_height: 224,
            input_width: 224,
            embedding_dim: 1280,
            intra_threads: 4,
        }
    }
}

/// The two confidence cutoffs of the decision rule.
/// At or above `report` a confidence value is worth returning; at or above
/// `assert` the best label is returned as the product name.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    pub report: f64,
    pub assert: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { report: 50.0, assert: 60.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub busy_timeout_secs: u64,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_secs: 5,
            pool_size: 8,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_body_size_mb: usize,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size_mb: 10,
            timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {e}")))
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size_mb * 1024 * 1024
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ClassifierConfig {
    /// Loads `shelfsight.toml` from the working directory (or `path`, which must then exist),
    /// and applies `SHELFSIGHT__SECTION__KEY` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_source = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: ClassifierConfig = config::Config::builder()
            .add_source(file_source)
            .add_source(config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.input_height == 0 || self.model.input_width == 0 {
            return Err(Error::Config("model input resolution must be non-zero".into()));
        }
        if self.model.embedding_dim == 0 {
            return Err(Error::Config("embedding dimension must be non-zero".into()));
        }
        let Thresholds { report, assert } = self.thresholds;
        if !(0.0..=100.0).contains(&report) || !(0.0..=100.0).contains(&assert) || report > assert {
            return Err(Error::Config(format!(
                "thresholds must satisfy 0 <= report <= assert <= 100 (report {report}, assert {assert})"
            )));
        }
        if self.store.pool_size == 0 {
            return Err(Error::Config("store pool size must be non-zero".into()));
        }
        Ok(())
    }
}

/// The database lives in the platform data directory when there is one,
/// otherwise next to the process.
fn default_database_path() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("shelfsight").join(DATABASE_FILENAME),
        None => PathBuf::from(DATABASE_FILENAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_model() {
        let cfg = ClassifierConfig::default();
        assert_eq!(cfg.model.input_height, 224);
        assert_eq!(cfg.model.input_width, 224);
        assert_eq!(cfg.model.embedding_dim, 1280);
        assert_eq!(cfg.thresholds, Thresholds { report: 50.0, assert: 60.0 });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut cfg = ClassifierConfig::default();
        cfg.thresholds = Thresholds { report: 70.0, assert: 60.0 };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let mut cfg = ClassifierConfig::default();
        cfg.model.input_width = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[thresholds]\nreport = 40.0\nassert = 75.0\n\n[server]\nport = 9090\n",
        )
        .unwrap();

        let cfg = ClassifierConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.thresholds, Thresholds { report: 40.0, assert: 75.0 });
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.model.embedding_dim, 1280);
    }

    #[test]
    fn socket_addr_uses_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.socket_addr().unwrap().port(), 8080);
    }
}
