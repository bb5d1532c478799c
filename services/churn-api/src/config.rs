use anyhow::Result;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "churn-api";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// `users.json` + `userdata.json`, rewritten in full on every mutation.
    #[default]
    Json,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub log_level: String,
    pub bind_addr: String,
    pub model_path: PathBuf,
    pub pipeline_path: PathBuf,
    #[serde(default)]
    pub model_sha256: Option<String>,
    #[serde(default)]
    pub pipeline_sha256: Option<String>,
    pub storage_backend: StorageBackend,
    pub users_path: PathBuf,
    pub results_path: PathBuf,
    pub sled_path: PathBuf,
    pub first_user_id: u64,
    pub max_upload_bytes: usize,
}

impl ServiceConfig {
    /// Defaults, then `CHURN_CONFIG_FILE`, then `CHURN_*` environment.
    pub fn load() -> Result<Self> {
        Self::from_builder(churn_core::config_builder(SERVICE_NAME)?)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let cfg = builder
            .set_default("service_name", SERVICE_NAME)?
            .set_default("log_level", "info")?
            .set_default("bind_addr", "0.0.0.0:8000")?
            .set_default("model_path", "model/model.json")?
            .set_default("pipeline_path", "model/pipeline.json")?
            .set_default("storage_backend", "json")?
            .set_default("users_path", "data/users.json")?
            .set_default("results_path", "data/userdata.json")?
            .set_default("sled_path", "data/churn.sled")?
            .set_default("first_user_id", 1_i64)?
            .set_default("max_upload_bytes", 10_i64 * 1024 * 1024)?
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Defaults with every data and artifact path rooted at `dir`.
    pub fn rooted_at(dir: &Path) -> Result<Self> {
        let mut cfg = Self::from_builder(config::Config::builder())?;
        cfg.model_path = dir.join("model.json");
        cfg.pipeline_path = dir.join("pipeline.json");
        cfg.users_path = dir.join("users.json");
        cfg.results_path = dir.join("userdata.json");
        cfg.sled_path = dir.join("churn.sled");
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_flat_json_layout() {
        let cfg = ServiceConfig::from_builder(config::Config::builder()).unwrap();
        assert_eq!(cfg.users_path, PathBuf::from("data/users.json"));
        assert_eq!(cfg.results_path, PathBuf::from("data/userdata.json"));
        assert_eq!(cfg.storage_backend, StorageBackend::Json);
        assert_eq!(cfg.first_user_id, 1);
        assert!(cfg.model_sha256.is_none());
    }

    #[test]
    fn overrides_win_over_defaults() {
        let builder = config::Config::builder()
            .set_override("storage_backend", "sled")
            .unwrap()
            .set_override("first_user_id", 1000_i64)
            .unwrap();
        let cfg = ServiceConfig::from_builder(builder).unwrap();
        assert_eq!(cfg.storage_backend, StorageBackend::Sled);
        assert_eq!(cfg.first_user_id, 1000);
    }
}
