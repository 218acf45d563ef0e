//! vmhost CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmhost::config::{AgentConfig, DEFAULT_CONFIG_PATH};

mod cli;

/// vmhost - per-host agent for short-lived runner VMs
#[derive(Parser, Debug)]
#[command(name = "vmhost")]
#[command(about = "Per-host agent for short-lived runner VMs")]
#[command(version)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, env = "VMHOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit JSON log lines.
    #[arg(long, global = true, env = "VMHOST_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent and serve the HTTP API.
    Serve(cli::serve::ServeCmd),

    /// Print a freshly generated machine identifier.
    MachineId(cli::machine_id::MachineIdCmd),
}

fn main() {
    let cli = Cli::parse();

    let config = AgentConfig::load(&cli.config);
    let log_json = cli.log_json || config.as_ref().is_ok_and(|c| c.log_json);
    init_logging(log_json);

    tracing::debug!(version = vmhost::VERSION, config = %cli.config.display(), "starting vmhost");

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(config),
        Commands::MachineId(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmhost=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
