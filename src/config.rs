use std::collections::BTreeMap;

use anyhow::Result;
use blob_store::{lint::LintAction, StorageConfig};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{analyzer::AnalyzerKind, attacher::AttacherConfig};

/// Which transitions are handed to the background job system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub promote: bool,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintConfig {
    #[serde(default)]
    pub action: LintAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    pub storages: BTreeMap<String, StorageConfig>,
    /// Backend key for fresh uploads.
    pub cache: String,
    /// Backend key for promoted attachments.
    pub store: String,
    pub analyzer: AnalyzerKind,
    pub background: BackgroundConfig,
    pub lint: LintConfig,
    pub structured_logging: bool,
}

impl Default for StowageConfig {
    fn default() -> Self {
        let storages = ["cache", "store"]
            .into_iter()
            .map(|name| (name.to_string(), StorageConfig::file_system(name)))
            .collect();
        StowageConfig {
            storages,
            cache: "cache".to_string(),
            store: "store".to_string(),
            analyzer: AnalyzerKind::default(),
            background: BackgroundConfig::default(),
            lint: LintConfig::default(),
            structured_logging: false,
        }
    }
}

impl StowageConfig {
    pub fn from_path(path: &str) -> Result<StowageConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<StowageConfig> {
        let config: StowageConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for key in [&self.cache, &self.store] {
            if !self.storages.contains_key(key) {
                return Err(anyhow::anyhow!("storage {} is not configured", key));
            }
        }
        if self.cache == self.store {
            return Err(anyhow::anyhow!(
                "cache and store must be different storages, both are {}",
                self.cache
            ));
        }
        Ok(())
    }

    pub fn attacher_config(&self) -> AttacherConfig {
        AttacherConfig {
            cache: self.cache.clone(),
            store: self.store.clone(),
            background: self.background,
        }
    }
}
