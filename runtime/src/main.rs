// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use harvest_runtime::cli::{self, collect_cmd::CollectArgs};
use harvest_runtime::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvest: resilient multi-phase review collection",
    version,
    after_help = "Run 'harvest <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect items from a page across the recent, worst and best orderings
    Collect {
        /// Page URL to collect from
        url: String,
        /// Collection config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Surface profile describing the page's locators and labels (JSON)
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Target for the "recent" phase
        #[arg(long)]
        recent: Option<usize>,
        /// Target for the "worst" phase
        #[arg(long)]
        worst: Option<usize>,
        /// Target for the "best" phase
        #[arg(long)]
        best: Option<usize>,
        /// Total time budget in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Write the full result as JSON to this file
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Disable memory sampling and cleanup
        #[arg(long)]
        no_memory_management: bool,
    },
    /// Check environment and diagnose issues
    Doctor {
        /// Collection config file to validate
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("HARVEST_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("HARVEST_QUIET", "1");
    }
    if cli.no_color {
        std::env::set_var("HARVEST_NO_COLOR", "1");
    }
    logging::init(cli.verbose, cli.log_json);

    let result = match cli.command {
        Commands::Collect {
            url,
            config,
            profile,
            recent,
            worst,
            best,
            timeout,
            output,
            no_memory_management,
        } => {
            cli::collect_cmd::run(CollectArgs {
                url,
                config,
                profile,
                recent,
                worst,
                best,
                timeout,
                output,
                no_memory_management,
            })
            .await
        }
        Commands::Doctor { config } => cli::doctor::run(config).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "harvest", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if !cli::output::is_quiet() && !cli::output::is_json() {
            eprintln!("  Error: {e:#}");
        }
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        }
        std::process::exit(1);
    }

    result
}
