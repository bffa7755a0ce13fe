//! revsh daemon
//!
//! Runs sessions against local shells and commands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::session::SessionDispatcher;
use daemon::stdio::{self, RunRequest};

/// revsh daemon - bridges sessions to local shells and commands.
#[derive(Parser, Debug)]
#[command(name = "revshd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one session over this process's stdin and stdout
    Run {
        /// Allocate a pseudo-terminal and start the shell
        #[arg(long)]
        pty: bool,

        /// Terminal type exported to the shell
        #[arg(long, default_value = "xterm-256color")]
        term: String,

        /// Shell to start in pty mode (overrides the config)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,

        /// Command and arguments to run without a pty
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Validate the configuration
    Check,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(default_config_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let path = config_path(&cli);
    let mut config = Config::load(&path)?;
    config.apply_env_overrides();

    let log_guard = daemon::logging::init(&config.daemon, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", path);

    match cli.command {
        Commands::Run {
            pty,
            term,
            shell,
            command,
        } => {
            if let Some(shell) = shell {
                config.session.shell = shell;
            }
            config.validate()?;

            if !pty && command.is_empty() {
                tracing::info!("No command given and no pty requested; waiting for hangup");
            }

            let dispatcher = SessionDispatcher::new(config.session);
            let request = RunRequest { pty, term, command };
            let result = stdio::serve(&dispatcher, request).await;

            if let Err(e) = &result {
                eprintln!("Error: {}", e);
            }
            let code = stdio::process_exit_code(&result);

            // process::exit skips destructors, so flush the log writer first.
            drop(log_guard);
            std::process::exit(code);
        }

        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }

        Commands::Config(ConfigCommands::Path) => {
            println!("{}", path.display());
        }

        Commands::Config(ConfigCommands::Check) => match config.validate() {
            Ok(()) => println!("Configuration OK: {}", path.display()),
            Err(e) => {
                eprintln!("Invalid configuration in {}: {}", path.display(), e);
                drop(log_guard);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
