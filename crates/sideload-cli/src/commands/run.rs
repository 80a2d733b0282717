//! `sideload run` command implementation

use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;
use sideload_kernel::config::SideloadConfig;
use sideload_kernel::{InMemoryRegistry, Scope};
use sideload_loader::{ArchiveLoad, SideloadManager};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Execute the `sideload run` command
pub async fn run(
    mut config: SideloadConfig,
    dir: Option<PathBuf>,
    poll_ms: Option<u64>,
    watch: bool,
) -> anyhow::Result<()> {
    if let Some(dir) = dir {
        config = config.with_plugin_dir(dir);
    }
    if let Some(poll_ms) = poll_ms {
        config.watch.poll_interval_ms = poll_ms;
    }
    let watch = watch && config.watch.enabled;

    let registry = Arc::new(InMemoryRegistry::new());
    let manager = SideloadManager::with_dylib_loader(config, registry.clone(), Scope::root())?;

    println!(
        "{} Sideloading from: {}",
        "→".green(),
        manager.plugin_dir().display().to_string().cyan()
    );

    let loads = manager.load_initial().await?;
    print_loads(&loads);
    print_modules(&registry);

    if !watch {
        manager.shutdown().await?;
        return Ok(());
    }

    let mut changes = manager.subscribe();
    manager.start_watching()?;
    println!(
        "{} Watching for changes every {}ms, press Ctrl-C to stop",
        "→".green(),
        manager.config().watch.poll_interval_ms
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupt received");
                break;
            }
            change = changes.recv() => match change {
                Ok(_) => {
                    println!("{} Modules changed", "↻".yellow());
                    print_modules(&registry);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} change notifications", skipped);
                    print_modules(&registry);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("{} Shutting down", "→".green());
    manager.shutdown().await?;
    println!("{} Stopped", "✓".green());
    Ok(())
}

fn print_loads(loads: &[ArchiveLoad]) {
    if loads.is_empty() {
        println!("  {}", "No archives found".dimmed());
        return;
    }

    for load in loads {
        let name = load
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match &load.result {
            Ok(report) if report.is_complete() => {
                println!(
                    "  {} {} ({} modules)",
                    "✓".green(),
                    name,
                    report.loaded.len()
                );
            }
            Ok(report) => {
                println!(
                    "  {} {} ({}/{} modules)",
                    "!".yellow(),
                    name,
                    report.loaded.len(),
                    report.total
                );
                for failure in &report.failures {
                    println!("      {}", failure.to_string().yellow());
                }
            }
            Err(e) => println!("  {} {}: {}", "✗".red(), name, e.to_string().red()),
        }
    }
}

fn print_modules(registry: &InMemoryRegistry) {
    let enabled = registry.enabled_names();
    let mut names = registry.names();
    names.sort();

    println!("  {} modules registered", names.len().to_string().yellow());
    for name in names {
        if enabled.contains(&name) {
            println!("    {} {}", "●".green(), name);
        } else {
            println!("    {} {}", "○".dimmed(), name.dimmed());
        }
    }
}
