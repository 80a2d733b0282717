//! CLI command implementations

pub mod init_config;
pub mod inspect;
pub mod run;

use std::path::Path;

use anyhow::Context;
use sideload_kernel::config::SideloadConfig;

/// Load the configuration file, or the defaults when none is given
pub fn load_config(path: Option<&Path>) -> anyhow::Result<SideloadConfig> {
    match path {
        Some(path) => SideloadConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(SideloadConfig::default()),
    }
}
