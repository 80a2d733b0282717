//! `sideload inspect` command implementation
//!
//! Opens an archive in its own loading context, scans it and prints the
//! modules in the order they would be instantiated. Nothing is registered.
//! Exits with an error when the archive has a dependency cycle.

use std::path::Path;

use colored::Colorize;
use comfy_table::{ContentArrangement, Table};
use sideload_loader::{
    ArchiveLoader, DependencyGraph, DylibLoader, ModuleSummary, OpenedArchive, scan,
};

/// Execute the `sideload inspect` command
pub fn run(archive: &Path, json: bool) -> anyhow::Result<()> {
    let OpenedArchive { candidates, handle } = DylibLoader::new().open(archive)?;
    let label = archive.display().to_string();

    let (summaries, cycle) = {
        let classes = scan(&label, candidates);
        let found: Vec<ModuleSummary> = classes.iter().map(|c| c.summary()).collect();
        match DependencyGraph::build(classes).topological_sort() {
            Ok(ordered) => (ordered.iter().map(|c| c.summary()).collect(), None),
            Err(e) => (found, Some(e)),
        }
    };

    if json {
        let out = serde_json::json!({
            "archive": label,
            "sha256": handle.digest(),
            "modules": summaries,
            "cycle": cycle.as_ref().map(|e| &e.members),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{} {}", "Archive:".bold(), label.cyan());
        if let Some(digest) = handle.digest() {
            println!("{} {}", "SHA-256:".bold(), digest.dimmed());
        }
        if summaries.is_empty() {
            println!("  {}", "No modules declared".dimmed());
        } else {
            println!("{}", summary_table(&summaries));
        }
        if let Some(e) = &cycle {
            println!("{} {}", "✗".red(), e.to_string().red());
            println!("  {}", "Listed in declaration order; the archive would not load".dimmed());
        }
    }

    drop(handle);
    match cycle {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn summary_table(summaries: &[ModuleSummary]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["#", "Type", "Name", "Version", "Enabled", "Depends on"]);

    for (i, summary) in summaries.iter().enumerate() {
        let dependencies = summary
            .dependencies
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            (i + 1).to_string(),
            summary.type_id.to_string(),
            summary.name.clone(),
            summary.version.clone().unwrap_or_default(),
            if summary.enabled_by_default { "yes" } else { "no" }.to_string(),
            dependencies,
        ]);
    }

    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);
    table
}
