mod error;
mod logging;
mod mail_reader;
mod mail_relay;
mod settings;
mod watcher;
mod web;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::SettingsError;
use crate::settings::{Config, DEFAULT_CONFIG_PATH};
use crate::watcher::Reflector;

#[derive(Parser)]
#[command(
    name = "mail-reflector",
    about = "Forwards mail from allowed senders to a list of recipients"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single check pass and exit
    Check,
    /// Watch the mailbox until interrupted
    Serve,
    /// Serve the status API and watch the mailbox in the background
    Web {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a configuration file interactively
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the version
    Version,
}

fn load_config(path: &Path) -> Result<Config> {
    let hint = || {
        format!(
            "run `mail-reflector init --config {}` to create one",
            path.display()
        )
    };

    let config = settings::load_settings(path).with_context(hint)?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(SettingsError::Invalid(problems)).with_context(hint);
    }
    config.log_warnings();
    Ok(config)
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown requested");
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        logging::parse_level(&cli.log_level)
    };
    logging::setup_logger(level)?;

    match cli.command {
        Command::Version => {
            println!("mail-reflector {}", env!("CARGO_PKG_VERSION"));
        }
        Command::Init { force } => {
            settings::init::run(&cli.config, force)?;
        }
        Command::Check => {
            let config = load_config(&cli.config)?;
            let reflector = Reflector::from_config(&config)?;
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let report = reflector.check_once(&cancel).await?;
            println!("{}", report);
        }
        Command::Serve => {
            let config = load_config(&cli.config)?;
            let reflector = Reflector::from_config(&config)?;
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            reflector.serve(cancel).await;
        }
        Command::Web { bind, port } => {
            let mut config = load_config(&cli.config)?;
            if let Some(bind) = bind {
                config.web.bind = bind;
            }
            if let Some(port) = port {
                config.web.port = port;
            }

            let reflector = Reflector::from_config(&config)?;
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let watcher = tokio::spawn({
                let reflector = reflector.clone();
                let cancel = cancel.clone();
                async move { reflector.serve(cancel).await }
            });

            let served = web::entrypoint(reflector, &config.web, cancel.clone()).await;
            cancel.cancel();
            watcher.await.context("watch loop panicked")?;
            served?;
        }
    }

    Ok(())
}
