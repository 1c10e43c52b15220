use std::{
    fs::File,
    io::BufReader,
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    sanitize::{Sanitizer, SanitizerPolicy},
    schema::TypeInference,
    writer::DEFAULT_BATCH_SIZE,
};

/// Everything an [`crate::engine::ImportEngine`] is constructed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Upper bound on rows per bulk statement.
    #[serde(alias = "batchSize")]
    pub batch_size: usize,
    /// Per-call deadline; chunks not started in time are skipped.
    #[serde(alias = "timeoutSecs", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub sanitizer: SanitizerPolicy,
    #[serde(alias = "typeInference")]
    pub type_inference: TypeInference,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: None,
            sanitizer: SanitizerPolicy::default(),
            type_inference: TypeInference::default(),
        }
    }
}

impl ImportConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let config: ImportConfig = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing config YAML {path:?}"))?;
        config
            .validate()
            .with_context(|| format!("Validating config {path:?}"))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating config file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing config YAML")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Sanitizer::new(&self.sanitizer).map(|_| ())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
