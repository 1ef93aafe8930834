//! On-disk configuration for the asset cache and download engine.
//!
//! Mirrors this workspace's layered approach to server configuration: a
//! [`toml_edit::Document`] read from disk, with `-c key=value` command line
//! overrides merged in before the final typed config is deserialized.

use std::str::FromStr;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

pub mod defaults {
    pub const DEFAULT_BUDGET_MB: u64 = 500;
    pub const DEFAULT_DOWNLOAD_BASE_BACKOFF_MS: u64 = 200;
    pub const DEFAULT_DOWNLOAD_BACKOFF_CAP_MS: u64 = 30_000;
    pub const DEFAULT_MAX_DOWNLOAD_RETRY: u32 = 10;
    pub const DEFAULT_CHECK_BACKOFF_CAP_S: u64 = 300;
    pub const DEFAULT_UPDATE_RETRY_INTERVAL_MS: u64 = 30_000;
    pub const DEFAULT_MAX_UPDATE_NOTIFICATIONS: u32 = 10;

    // Test-build tunables, matching the `UNIT_TEST` knobs in the original source.
    pub const TEST_DOWNLOAD_BASE_BACKOFF_MS: u64 = 10;
    pub const TEST_DOWNLOAD_BACKOFF_CAP_MS: u64 = 200;
    pub const TEST_MAX_DOWNLOAD_RETRY: u32 = 2;
    pub const TEST_UPDATE_RETRY_INTERVAL_MS: u64 = 100;
    pub const TEST_MAX_UPDATE_NOTIFICATIONS: u32 = 2;
}

/// Effective, validated configuration for a running Asset Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetManagerConf {
    pub base_directory: Utf8PathBuf,
    pub budget_mb: u64,
    /// Test/back-door escape hatch for the URL allow-list (§9 Open Question).
    /// Never implied by an empty allow-list; must be set explicitly.
    pub allow_all_urls: bool,
    pub url_allow_list: Vec<String>,
    /// Base URL the default endpoint builder derives service-check URLs from.
    pub service_base_url: String,
    pub download_base_backoff_ms: u64,
    pub download_backoff_cap_ms: u64,
    pub max_download_retry: u32,
    pub check_backoff_cap_s: u64,
    pub update_retry_interval_ms: u64,
    pub max_update_notifications: u32,
}

impl Default for AssetManagerConf {
    fn default() -> Self {
        Self {
            base_directory: Utf8PathBuf::from("./asset_manager_data"),
            budget_mb: defaults::DEFAULT_BUDGET_MB,
            allow_all_urls: false,
            url_allow_list: Vec::new(),
            service_base_url: "https://davs.example.com".to_string(),
            download_base_backoff_ms: defaults::DEFAULT_DOWNLOAD_BASE_BACKOFF_MS,
            download_backoff_cap_ms: defaults::DEFAULT_DOWNLOAD_BACKOFF_CAP_MS,
            max_download_retry: defaults::DEFAULT_MAX_DOWNLOAD_RETRY,
            check_backoff_cap_s: defaults::DEFAULT_CHECK_BACKOFF_CAP_S,
            update_retry_interval_ms: defaults::DEFAULT_UPDATE_RETRY_INTERVAL_MS,
            max_update_notifications: defaults::DEFAULT_MAX_UPDATE_NOTIFICATIONS,
        }
    }
}

impl AssetManagerConf {
    /// Parse a config file, apply `-c key=value` style overrides, and validate.
    ///
    /// `overrides` are raw TOML fragments the way `pageserver -c` takes them,
    /// e.g. `budget_mb=750`.
    pub fn load(cfg_file_path: &Utf8Path, overrides: &[String]) -> anyhow::Result<Self> {
        let mut toml = if cfg_file_path.is_file() {
            std::fs::read_to_string(cfg_file_path)
                .with_context(|| format!("failed to read config at '{cfg_file_path}'"))?
                .parse::<toml_edit::Document>()
                .with_context(|| format!("failed to parse '{cfg_file_path}' as toml"))?
        } else {
            toml_edit::Document::new()
        };

        for option_line in overrides {
            let doc = toml_edit::Document::from_str(option_line)
                .with_context(|| format!("option '{option_line}' is not valid toml"))?;
            for (key, item) in doc.iter() {
                toml.insert(key, item.clone());
            }
        }

        let conf: AssetManagerConf = toml_edit::de::from_document(toml)
            .context("failed to deserialize asset manager configuration")?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.budget_mb > 0, "budget_mb must be positive");
        anyhow::ensure!(
            self.max_download_retry > 0,
            "max_download_retry must be positive"
        );
        Ok(())
    }

    pub fn save(&self, cfg_file_path: &Utf8Path) -> anyhow::Result<()> {
        let doc = toml_edit::ser::to_document(self).context("failed to serialize config")?;
        std::fs::write(cfg_file_path, doc.to_string())
            .with_context(|| format!("failed to write config to '{cfg_file_path}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AssetManagerConf::default().validate().unwrap();
    }

    #[test]
    fn load_applies_overrides_without_a_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("asset_manager.toml");
        let conf = AssetManagerConf::load(
            &cfg_path,
            &["budget_mb=750".to_string(), "allow_all_urls=true".to_string()],
        )
        .unwrap();
        assert_eq!(conf.budget_mb, 750);
        assert!(conf.allow_all_urls);
    }
}
