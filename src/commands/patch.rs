// src/commands/patch.rs
//! Binary patch commands

use super::format_bytes;
use anyhow::Result;
use deltaship::delta::{DEFAULT_MAX_PATCH_RATIO, PatchEngine};
use std::path::Path;

pub fn cmd_patch_create(old: &Path, new: &Path, output: &Path, level: i32) -> Result<()> {
    let engine = PatchEngine::new(level, DEFAULT_MAX_PATCH_RATIO);
    let metrics = engine.create_patch_file(old, new, output)?;
    println!(
        "Created {} ({} for a {} file, {:.1}% saved)",
        output.display(),
        format_bytes(metrics.patch_size),
        format_bytes(metrics.new_size),
        metrics.savings_percentage()
    );
    Ok(())
}

pub fn cmd_patch_apply(old: &Path, patch: &Path, output: &Path) -> Result<()> {
    let hash = PatchEngine::default().apply_patch_file(old, patch, output)?;
    println!("Wrote {} (sha256 {})", output.display(), hash);
    Ok(())
}

pub fn cmd_patch_estimate(old: &Path, new: &Path) -> Result<()> {
    let estimate = PatchEngine::default().estimate(old, new)?;
    println!(
        "Estimated patch size: {} ({} -> {})",
        format_bytes(estimate.estimated_patch_size),
        format_bytes(estimate.old_size),
        format_bytes(estimate.new_size)
    );
    if estimate.recommended {
        println!("Patching is recommended");
    } else {
        println!("Ship the full file instead");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_apply() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old.bin");
        let new = temp.path().join("new.bin");
        let patch = temp.path().join("app.patch");
        let rebuilt = temp.path().join("rebuilt.bin");

        let base = "deltaship patch fixture line\n".repeat(400);
        std::fs::write(&old, &base).unwrap();
        std::fs::write(&new, base.replace("fixture", "FIXTURE")).unwrap();

        cmd_patch_create(&old, &new, &patch, 3).unwrap();
        cmd_patch_apply(&old, &patch, &rebuilt).unwrap();
        assert_eq!(std::fs::read(&rebuilt).unwrap(), std::fs::read(&new).unwrap());

        // Applying against the wrong base fails
        assert!(cmd_patch_apply(&new, &patch, &temp.path().join("bad.bin")).is_err());
    }
}
