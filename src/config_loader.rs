use crate::config::Config;
use color_eyre::eyre::{Result, WrapErr};
use log::info;
use std::fs::File;
use std::path::Path;

/// Load, parse and validate configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<Config> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open config file {}", config_path.display()))?;

    let config: Config = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse config file {}", config_path.display()))?;

    config
        .validate()
        .wrap_err_with(|| format!("Invalid configuration in {}", config_path.display()))?;

    info!(
        "Configuration: {} topology with {} nodes on {:?}",
        config.topology.variant, config.topology.node_count, config.topology.network_classes
    );
    Ok(config)
}
