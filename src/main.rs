// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser};

mod cli;
mod commands;

use cli::{Cli, Commands, PatchCommands};
use commands::{DownloadArgs, UploadArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays clean
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = cli.command else {
        println!("deltaship - incremental package distribution");
        println!("Run 'deltaship --help' for usage information");
        return Ok(());
    };

    // Commands that need no configuration
    match &command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "deltaship", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Manifest { dir, output } => return commands::cmd_manifest(dir, output.as_deref()),
        Commands::Diff { local, remote, json } => return commands::cmd_diff(local, remote, *json),
        Commands::Patch(patch) => {
            return match patch {
                PatchCommands::Create {
                    old,
                    new,
                    output,
                    level,
                } => commands::cmd_patch_create(old, new, output, *level),
                PatchCommands::Apply { old, patch, output } => {
                    commands::cmd_patch_apply(old, patch, output)
                }
                PatchCommands::Estimate { old, new } => commands::cmd_patch_estimate(old, new),
            };
        }
        _ => {}
    }

    let config = commands::load_config(cli.config.as_deref(), cli.root)?;

    match command {
        Commands::Init => commands::cmd_init(&config),
        Commands::Serve { bind } => {
            let mut server_config = deltaship::server::ServerConfig::from_engine(&config)?;
            if let Some(bind) = bind {
                server_config.bind_addr = bind
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", bind, e))?;
            }
            let lifecycle = commands::open_lifecycle(&config)?;
            let planner = commands::planner(&config)?;
            deltaship::server::run_server(server_config, lifecycle, planner).await
        }
        Commands::Plan { old, new, json } => {
            commands::cmd_plan(&commands::planner(&config)?, &old, &new, json)
        }
        Commands::Health { json } => commands::cmd_health(&commands::open_lifecycle(&config)?, json),
        Commands::Cleanup { reason, history } => {
            commands::cmd_cleanup(&commands::open_lifecycle(&config)?, &reason, history)
        }
        Commands::Retention { kind, max_versions } => commands::cmd_retention(
            &commands::open_lifecycle(&config)?,
            kind.as_deref(),
            max_versions,
        ),
        Commands::Rollback { package_id } => {
            commands::cmd_rollback(&commands::open_lifecycle(&config)?, package_id)
        }
        Commands::Reconcile => commands::cmd_reconcile(&commands::open_lifecycle(&config)?),
        Commands::Protect {
            version,
            platform,
            arch,
            unprotect,
        } => commands::cmd_protect(
            &commands::open_registry(&config)?,
            &version,
            &platform,
            &arch,
            unprotect,
        ),
        Commands::Download {
            dest,
            platform,
            arch,
            version,
            from,
            server,
            files,
            keep_deleted,
            quiet,
        } => {
            commands::cmd_download(
                &config,
                DownloadArgs {
                    dest: &dest,
                    platform: &platform,
                    arch: &arch,
                    version,
                    from,
                    server: server.as_deref(),
                    files,
                    keep_deleted,
                    quiet,
                },
            )
            .await
        }
        Commands::Upload {
            file,
            version,
            platform,
            arch,
            kind,
            from,
            server,
            api_key,
            quiet,
        } => {
            commands::cmd_upload(
                &config,
                UploadArgs {
                    file: &file,
                    version: &version,
                    platform: &platform,
                    arch: &arch,
                    kind: &kind,
                    from,
                    server: server.as_deref(),
                    api_key,
                    quiet,
                },
            )
            .await
        }
        Commands::Completions { .. }
        | Commands::Manifest { .. }
        | Commands::Diff { .. }
        | Commands::Patch(_) => Ok(()),
    }
}
