// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! micart CLI
//!
//! runc-shaped command-line interface that drives RTOS guests through micad.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod logging;

use micart_core::config::DEFAULT_CONFIG_PATH;

/// micart - OCI-shaped runtime for mica RTOS guests
#[derive(Parser)]
#[command(name = "micart")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for container state (overrides the config file)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Runtime configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a container and allocate its guest
    Create {
        container_id: String,

        /// Path to the bundle directory
        #[arg(short, long, default_value = ".")]
        bundle: PathBuf,

        /// File to write the process id to
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Start a created container
    Start { container_id: String },

    /// Create and start a container in one step
    Run {
        container_id: String,

        /// Path to the bundle directory
        #[arg(short, long, default_value = ".")]
        bundle: PathBuf,

        /// File to write the process id to
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Keep the container's state on failure
        #[arg(long)]
        keep: bool,
    },

    /// Run the task in a running container
    Exec { container_id: String },

    /// Suspend a running container
    Pause { container_id: String },

    /// Resume a paused container
    Resume { container_id: String },

    /// Restore a stopped container
    Restore { container_id: String },

    /// Send a signal to the container's guest
    Kill {
        container_id: String,

        /// Signal name or number
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },

    /// Delete a container and its state
    Delete {
        container_id: String,

        /// Kill the guest if it is still running
        #[arg(short, long)]
        force: bool,
    },

    /// Print the OCI state of a container
    State { container_id: String },

    /// List containers
    List {
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Write a new config.json into a bundle
    Spec {
        /// Path to the bundle directory
        #[arg(short, long, default_value = ".")]
        bundle: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, cli.log.as_deref(), cli.log_format) {
        eprintln!("micart: failed to set up logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Command failed");
        eprintln!("micart: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // `spec` needs no runtime configuration.
    if let Commands::Spec { bundle } = &cli.command {
        return commands::spec::execute(bundle).await;
    }

    let ctx = commands::RuntimeContext::new(cli.root.as_deref(), &cli.config)?;

    match cli.command {
        Commands::Create {
            container_id,
            bundle,
            pid_file,
        } => commands::create::execute(&ctx, &container_id, &bundle, pid_file.as_deref()).await,
        Commands::Start { container_id } => commands::start::execute(&ctx, &container_id).await,
        Commands::Run {
            container_id,
            bundle,
            pid_file,
            keep,
        } => {
            commands::run::execute(&ctx, &container_id, &bundle, pid_file.as_deref(), keep).await
        }
        Commands::Exec { container_id } => {
            commands::simple::execute(&ctx, &container_id, commands::simple::Action::Exec).await
        }
        Commands::Pause { container_id } => {
            commands::simple::execute(&ctx, &container_id, commands::simple::Action::Pause).await
        }
        Commands::Resume { container_id } => {
            commands::simple::execute(&ctx, &container_id, commands::simple::Action::Resume).await
        }
        Commands::Restore { container_id } => {
            commands::simple::execute(&ctx, &container_id, commands::simple::Action::Restore).await
        }
        Commands::Kill {
            container_id,
            signal,
        } => commands::kill::execute(&ctx, &container_id, &signal).await,
        Commands::Delete {
            container_id,
            force,
        } => commands::delete::execute(&ctx, &container_id, force).await,
        Commands::State { container_id } => commands::state::execute(&ctx, &container_id).await,
        Commands::List { format } => commands::list::execute(&ctx, format).await,
        Commands::Spec { .. } => Ok(()),
    }
}
