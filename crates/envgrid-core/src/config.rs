//! envgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvgridConfig {
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub cluster: ClusterConfig,
    pub apply: ApplyConfig,
    pub release: ReleaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/envgrid/envgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory of `{project}.yaml` template files.
    pub templates_dir: PathBuf,
    /// Directory of `{repo}/{chart}-{version}/values.yaml` chart packages.
    pub charts_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("./templates"),
            charts_dir: PathBuf::from("./charts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Where the local backend writes applied manifests and release values.
    pub output_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./rendered"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Retry passes over the failed subset after the first pass.
    pub retry_attempts: u32,
    /// Delay between full retry passes.
    pub retry_interval_ms: u64,
    /// Delay between individual items within a pass.
    pub item_interval_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_interval_ms: 3000,
            item_interval_ms: 500,
        }
    }
}

impl ApplyConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn item_interval(&self) -> Duration {
        Duration::from_millis(self.item_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Helm release naming template; `$Service$`, `$EnvName$`,
    /// `$Namespace$` and `$Product$` are substituted.
    pub naming: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            naming: "$Service$-$EnvName$".to_string(),
        }
    }
}

impl EnvgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EnvgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnvgridConfig::default();
        assert_eq!(config.apply.retry_attempts, 3);
        assert_eq!(config.apply.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.apply.item_interval(), Duration::from_millis(500));
        assert_eq!(config.release.naming, "$Service$-$EnvName$");
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[store]
path = "/tmp/envgrid.redb"

[apply]
retry_attempts = 5
"#;
        let config: EnvgridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/envgrid.redb"));
        assert_eq!(config.apply.retry_attempts, 5);
        assert_eq!(config.apply.item_interval_ms, 500);
        assert_eq!(config.catalog, CatalogConfig::default());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = EnvgridConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("retry_attempts = 3"));
        let back: EnvgridConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config =
            EnvgridConfig::load_or_default(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config, EnvgridConfig::default());
    }
}
