// src/commands/update.rs
//! Manifest, diff and plan commands

use super::{format_bytes, print_json, read_tree};
use anyhow::Result;
use deltaship::update::{self, Manifest, UpdatePlan, UpdatePlanner};
use std::path::Path;
use tracing::info;

pub fn cmd_manifest(dir: &Path, output: Option<&Path>) -> Result<()> {
    let manifest = Manifest::from_dir(dir)?;
    info!("Scanned {} files under {}", manifest.len(), dir.display());

    match output {
        Some(path) => {
            manifest.save(path)?;
            println!(
                "Wrote manifest of {} files ({}) to {}",
                manifest.len(),
                format_bytes(manifest.total_size()),
                path.display()
            );
        }
        None => println!("{}", manifest.to_json()?),
    }
    Ok(())
}

pub fn cmd_diff(local: &Path, remote: &Path, json: bool) -> Result<()> {
    let diff = update::diff(&read_tree(local)?, &read_tree(remote)?);
    if json {
        return print_json(&diff);
    }

    if diff.is_unchanged() {
        println!("No differences ({} files identical)", diff.same.len());
        return Ok(());
    }
    for entry in &diff.new {
        println!("  + {} ({})", entry.path, format_bytes(entry.size));
    }
    for entry in &diff.modified {
        println!(
            "  M {} ({} -> {})",
            entry.path,
            format_bytes(entry.old.size),
            format_bytes(entry.new.size)
        );
    }
    for entry in &diff.deleted {
        println!("  - {}", entry.path);
    }
    println!(
        "\n{} new, {} modified, {} deleted, {} unchanged",
        diff.new.len(),
        diff.modified.len(),
        diff.deleted.len(),
        diff.same.len()
    );
    Ok(())
}

pub fn cmd_plan(planner: &UpdatePlanner, old: &Path, new: &Path, json: bool) -> Result<()> {
    let plan = planner.plan(&read_tree(old)?, &read_tree(new)?);
    if json {
        return print_json(&plan);
    }
    print_plan(&plan);
    Ok(())
}

pub fn print_plan(plan: &UpdatePlan) {
    if plan.is_empty() {
        println!("Already up to date");
        return;
    }

    for file in &plan.to_add {
        println!("  add     {} ({})", file.path, format_bytes(file.size));
    }
    for file in &plan.to_replace {
        println!(
            "  replace {} ({}, {:?})",
            file.path,
            format_bytes(file.size),
            file.reason
        );
    }
    for file in &plan.to_patch {
        println!(
            "  patch   {} ({} patch for {}{})",
            file.path,
            format_bytes(file.patch_size),
            format_bytes(file.size),
            if file.estimated { ", estimated" } else { "" }
        );
    }
    for file in &plan.to_delete {
        println!("  delete  {}", file.path);
    }

    println!();
    println!(
        "Transfer: {} of {} changed ({:.0}% saved), about {:.0}s",
        format_bytes(plan.total_transfer_size),
        format_bytes(plan.total_original_size),
        plan.compression_ratio * 100.0,
        plan.estimated_seconds
    );
}
