use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use swarming_core::{atomic_write_json_pretty, SIDE_EFFECTS_CONFIG_NAME};

/// Where the post-processing side effects (result upload, TKO) go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideEffectsConfig {
    pub tko: TkoConfig,
    pub google_storage: GoogleStorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TkoConfig {
    pub proxy_socket: String,
    pub mysql_user: String,
    pub mysql_password_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleStorageConfig {
    pub bucket: String,
    pub credentials_file: String,
}

impl SideEffectsConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parse side effects config")
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("tko.proxy_socket", &self.tko.proxy_socket),
            ("tko.mysql_user", &self.tko.mysql_user),
            ("tko.mysql_password_file", &self.tko.mysql_password_file),
            ("google_storage.bucket", &self.google_storage.bucket),
            ("google_storage.credentials_file", &self.google_storage.credentials_file),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(anyhow!(
                "side effects config is missing: {}",
                missing.join(", ")
            ));
        }
        for (name, value) in [
            ("tko.proxy_socket", &self.tko.proxy_socket),
            ("tko.mysql_password_file", &self.tko.mysql_password_file),
            ("google_storage.credentials_file", &self.google_storage.credentials_file),
        ] {
            if !Path::new(value).exists() {
                return Err(anyhow!("side effects config {}: {} does not exist", name, value));
            }
        }
        Ok(())
    }

    /// Drops the config into the results directory for the offloader.
    pub fn write_to(&self, results_dir: &Path) -> Result<()> {
        let path = results_dir.join(SIDE_EFFECTS_CONFIG_NAME);
        atomic_write_json_pretty(&path, self)
            .with_context(|| format!("write side effects config {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote side effects config");
        Ok(())
    }
}
