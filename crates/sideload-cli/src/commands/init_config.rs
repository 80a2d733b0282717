//! `sideload init-config` command implementation

use std::path::Path;

use anyhow::bail;
use colored::Colorize;
use sideload_kernel::config::SideloadConfig;

/// Execute the `sideload init-config` command
pub fn run(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite it",
            output.display()
        );
    }

    println!("{} Writing default configuration: {}", "→".green(), output.display());

    let content = render(output, &SideloadConfig::default())?;
    std::fs::write(output, content)?;

    println!("{} Configuration written", "✓".green());
    Ok(())
}

/// Serialize in the format matching the file extension, TOML otherwise
fn render(output: &Path, config: &SideloadConfig) -> anyhow::Result<String> {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    Ok(match ext.as_str() {
        "json" => serde_json::to_string_pretty(config)?,
        _ => toml::to_string_pretty(config)?,
    })
}
