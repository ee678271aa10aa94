//! sharetty
//!
//! Shares one shell with every browser that connects.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sharetty::config::{default_config_path, Config};
use sharetty::orchestrator::Orchestrator;
use sharetty::session::{EndReason, SessionOutcome};
use tracing_subscriber::EnvFilter;

/// sharetty - one shared shell, many browser viewers.
#[derive(Parser, Debug)]
#[command(name = "sharetty")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the shared shell and serve it
    Serve {
        /// Address to bind (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,

        /// Shell to run (overrides config)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    let command = cli.command.clone().unwrap_or(Commands::Serve {
        bind: None,
        port: None,
        shell: None,
    });

    if let Commands::Serve { bind, port, shell } = &command {
        if let Some(bind) = bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(shell) = shell {
            config.session.shell = shell.clone();
        }
    }

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    // Validate configuration
    config.validate()?;

    match command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Serve { .. } => {
            tracing::info!("sharetty starting...");

            let mut orchestrator = Orchestrator::new(config);
            orchestrator.start().await?;

            let outcome = orchestrator.run_until(wait_for_shutdown_signal()).await?;
            let code = process_exit_code(orchestrator.shutdown_requested(), &outcome);
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

/// Picks the process exit code once the session is over.
///
/// A requested shutdown is a clean exit whatever the shell reported while
/// being hung up. Otherwise the shell's own exit code is passed through.
fn process_exit_code(shutdown_requested: bool, outcome: &SessionOutcome) -> i32 {
    if shutdown_requested {
        return 0;
    }
    match (outcome.exit_code, outcome.reason) {
        (Some(code), _) => code,
        (None, EndReason::IoError) => 1,
        (None, _) => 0,
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Failed to register signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["sharetty"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["sharetty", "serve"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Serve {
                bind: None,
                port: None,
                shell: None
            })
        );
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "sharetty",
            "serve",
            "--bind",
            "127.0.0.1",
            "-p",
            "7681",
            "--shell",
            "/bin/bash",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Serve {
                bind: Some("127.0.0.1".to_string()),
                port: Some(7681),
                shell: Some("/bin/bash".to_string()),
            })
        );
    }

    #[test]
    fn test_serve_rejects_bad_port() {
        assert!(Cli::try_parse_from(["sharetty", "serve", "--port", "99999"]).is_err());
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["sharetty", "config"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Config));
    }

    #[test]
    fn test_exit_code_after_shutdown_signal_is_zero() {
        let hung_up = SessionOutcome {
            reason: EndReason::Terminated,
            exit_code: Some(1),
        };
        assert_eq!(process_exit_code(true, &hung_up), 0);
    }

    #[test]
    fn test_exit_code_follows_shell() {
        let exited = SessionOutcome {
            reason: EndReason::ChildExit,
            exit_code: Some(3),
        };
        assert_eq!(process_exit_code(false, &exited), 3);

        let failed = SessionOutcome {
            reason: EndReason::IoError,
            exit_code: None,
        };
        assert_eq!(process_exit_code(false, &failed), 1);

        let unknown = SessionOutcome {
            reason: EndReason::ChildExit,
            exit_code: None,
        };
        assert_eq!(process_exit_code(false, &unknown), 0);
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["sharetty", "serve", "--verbose", "--config", "/tmp/c.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }
}
