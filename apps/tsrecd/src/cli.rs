// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tsrec.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts the tsrecd server
    Serve,
    /// Generate a default config file and print it to stdout
    DefaultConfig,
}

/// Dispatches the CLI command. Defaults to `serve`.
///
/// Exits the process with status 1 on startup errors.
// Allow eprintln/println before logging is initialized (CLI output)
#[allow(clippy::disallowed_macros)]
pub async fn handle_command(cli: &Cli) {
    match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => handle_serve_command(&cli.config).await,
        Commands::DefaultConfig => match toml::to_string_pretty(&config::Config::default()) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("Failed to render default config: {e}");
                std::process::exit(1);
            },
        },
    }
}

#[allow(clippy::disallowed_macros)]
async fn handle_serve_command(config_path: &str) {
    let loaded = match config::load(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        },
    };

    let guard = match crate::logging::init_logging(&loaded.config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        },
    };

    if let Some(path) = &loaded.file_missing {
        warn!(path, "config file not found, using defaults and environment");
    }
    info!(
        address = %loaded.config.server.address,
        bot_id = loaded.config.bot.id,
        recording_enabled = loaded.config.recording.enabled,
        "starting tsrecd"
    );

    if let Err(e) = crate::server::run(&loaded.config, config_path).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }

    drop(guard);
}
