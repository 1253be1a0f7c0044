pub mod config;
pub mod env;
pub mod vars;

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

/// Parse a YAML input file.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
