// src/cli/mod.rs
//! CLI definitions for deltaship
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//!
//! Operator commands work directly on a storage root:
//! - `init`, `serve`, `reconcile`
//! - `health`, `cleanup`, `retention`, `rollback`, `protect`
//!
//! Client commands:
//! - `manifest`, `diff`, `plan` - inspect file trees
//! - `patch` - create, apply and estimate binary patches
//! - `download`, `upload` - resumable transfers against a server or a local root

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

mod patch;

pub use patch::PatchCommands;

#[derive(Parser)]
#[command(name = "deltaship")]
#[command(author = "Deltaship Contributors")]
#[command(version)]
#[command(about = "Incremental package distribution engine", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage root, overriding the configuration file
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the storage layout and database
    Init,

    /// Run the HTTP server
    Serve {
        /// Bind address, overriding the configuration file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Build the manifest of a directory
    Manifest {
        /// Directory to scan
        dir: PathBuf,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two file trees (directories or manifest files)
    Diff {
        /// Local side
        local: PathBuf,

        /// Remote side
        remote: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan the update from one file tree to another
    Plan {
        /// Current tree (directory or manifest file)
        old: PathBuf,

        /// Target tree (directory or manifest file)
        new: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Binary patch operations
    #[command(subcommand)]
    Patch(PatchCommands),

    /// Show storage health
    Health {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a cleanup pass now
    Cleanup {
        /// Reason recorded with the run
        #[arg(long, default_value = "manual")]
        reason: String,

        /// Show recent runs instead of cleaning up
        #[arg(long)]
        history: bool,
    },

    /// Show or change retention limits
    Retention {
        /// Package kind to change (full, patch, hotfix)
        kind: Option<String>,

        /// Versions to keep for the kind
        max_versions: Option<u32>,
    },

    /// Restore a deleted package from its latest backup
    Rollback {
        /// Package ID
        package_id: i64,
    },

    /// Repair uploads interrupted by a crash
    Reconcile,

    /// Exempt a version from retention cleanup
    Protect {
        version: String,

        #[arg(short, long)]
        platform: String,

        #[arg(short, long)]
        arch: String,

        /// Remove the protection instead
        #[arg(long)]
        unprotect: bool,
    },

    /// Update a directory to a version
    Download {
        /// Destination directory
        dest: PathBuf,

        #[arg(short, long)]
        platform: String,

        #[arg(short, long)]
        arch: String,

        /// Target version (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Version currently in the destination; enables patches
        #[arg(long)]
        from: Option<String>,

        /// Server URL; the local storage root is used when omitted
        #[arg(short, long)]
        server: Option<String>,

        /// Only transfer these paths
        #[arg(long = "file")]
        files: Vec<String>,

        /// Keep files the target version no longer has
        #[arg(long)]
        keep_deleted: bool,

        /// Log progress instead of drawing a bar
        #[arg(long)]
        quiet: bool,
    },

    /// Publish a package
    Upload {
        /// Package file
        file: PathBuf,

        #[arg(long)]
        version: String,

        #[arg(short, long)]
        platform: String,

        #[arg(short, long)]
        arch: String,

        /// Package kind (full, patch, hotfix)
        #[arg(short, long, default_value = "full")]
        kind: String,

        /// Source version for patch packages
        #[arg(long)]
        from: Option<String>,

        /// Server URL; registers into the local storage root when omitted
        #[arg(short, long)]
        server: Option<String>,

        /// API key for the server
        #[arg(long)]
        api_key: Option<String>,

        /// Log progress instead of drawing a bar
        #[arg(long)]
        quiet: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
