// src/cli/patch.rs
//! Binary patch subcommands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum PatchCommands {
    /// Create a patch turning OLD into NEW
    Create {
        old: PathBuf,
        new: PathBuf,

        /// Patch file to write
        #[arg(short, long)]
        output: PathBuf,

        /// zstd compression level
        #[arg(long, default_value = "3")]
        level: i32,
    },

    /// Rebuild NEW from OLD and a patch
    Apply {
        old: PathBuf,
        patch: PathBuf,

        /// File to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Estimate whether patching OLD into NEW is worthwhile
    Estimate { old: PathBuf, new: PathBuf },
}
