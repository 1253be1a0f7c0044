use std::path::Path;

use envgrid_core::EnvgridConfig;
use envgrid_engine::Reconciler;
use envgrid_state::StateStore;
use tracing::info;

use crate::local;

pub fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(path, EnvgridConfig::default().to_toml_string()?)?;
    println!("✓ Generated {}", path.display());
    Ok(())
}

/// Load configuration, open the store and wire the local backends.
pub fn open(config_path: &Path, data_dir: Option<&Path>) -> anyhow::Result<Reconciler> {
    let mut config = EnvgridConfig::load_or_default(config_path)?;
    if let Some(dir) = data_dir {
        config.store.path = dir.join("envgrid.redb");
    }

    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");

    Ok(Reconciler::from_config(
        store,
        local::collaborators(&config),
        &config,
    ))
}
