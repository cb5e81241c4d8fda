use anyhow::{Context, Result};
use snow_owl_tftp::config::TftpServerConfig;
use std::path::Path;

pub fn load_config(path: &Path) -> Result<TftpServerConfig> {
    let contents = std::fs::read_to_string(path).context("failed to read configuration file")?;
    toml::from_str(&contents).context("failed to parse configuration file")
}

pub fn save_config(path: &Path, config: &TftpServerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize configuration")?;
    std::fs::write(path, contents).context("failed to write configuration file")
}
