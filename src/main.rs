use std::io;
use std::path::{Path, PathBuf};
use clap_complete::{generate, Shell};
use clap::{Parser, Subcommand, CommandFactory};
use colored::Colorize;
use anyhow::{Context, Result};
use tracing::{error, info};

mod config;
use config::{Config, ForwardSpec};

mod error;
mod forward;
mod health;
mod logging;
mod pipe;
mod port;
mod ssh;
mod supervisor;
mod teardown;
mod transport;

use ssh::SshConnector;
use supervisor::{Supervisor, SupervisorOptions};
use teardown::TeardownCause;

#[derive(Parser)]
#[command(name = "sshf")]
#[command(about = "Keep an SSH connection up and forward local ports through it")]
struct Cli {
    /// Configuration file (default: ./.sshforwardrc, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and forward until interrupted (the default)
    Run,
    /// Validate the configuration and check that local ports are free
    Check,
    /// List configured forwards
    List,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, verbose, command } = Cli::parse();

    match command.unwrap_or(Commands::Run) {
        Commands::Completions { shell } => {
            generate_completions(shell);
        }
        Commands::Run => {
            logging::init_logging(verbose);
            run_forwarder(config.as_deref()).await?;
        }
        Commands::Check => {
            let (config, path) = Config::load(config.as_deref())?;
            check_forwards(&config, &path)?;
        }
        Commands::List => {
            let (config, _) = Config::load(config.as_deref())?;
            list_forwards(&config);
        }
    }

    Ok(())
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(
        shell,
        &mut cmd,
        "sshf",
        &mut io::stdout()
    );
}

async fn run_forwarder(config_path: Option<&Path>) -> Result<()> {
    let (config, path) = Config::load(config_path).inspect_err(|e| error!("{:#}", e))?;
    info!(
        "Loaded {} forward(s) from {}",
        config.forwards.len(),
        path.display()
    );

    let supervisor = Supervisor::new(
        SshConnector,
        config.ssh_server.clone(),
        config.forwards.clone(),
        SupervisorOptions::from(&config.options),
    );

    let shutdown = supervisor.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.fire(TeardownCause::Shutdown);
        }
    });

    if let Err(e) = supervisor.run().await {
        error!("{}", e);
        return Err(e).context("Cannot keep forwards up");
    }

    for (spec, stats) in supervisor.stats() {
        info!(
            "{}: {} connection(s), {}B sent, {}B received",
            spec.name, stats.accepted, stats.sent, stats.received
        );
    }
    Ok(())
}

fn describe(forward: &ForwardSpec) -> String {
    format!(
        "{} → {}:{}",
        forward.bind_addr().cyan(),
        forward.remote_host.cyan(),
        forward.remote_port.to_string().cyan()
    )
}

fn list_forwards(config: &Config) {
    let server = &config.ssh_server;
    println!("\n{} {}@{}:{}\n",
             "SSH server:".bold().underline(),
             server.username,
             server.host,
             server.port);

    for (index, forward) in config.forwards.iter().enumerate() {
        println!("  {}: {}", index.to_string().bold(), forward.name);
        println!("     {}", describe(forward));
    }
    println!();
}

fn check_forwards(config: &Config, path: &Path) -> Result<()> {
    println!("{} {}\n", "✓ Configuration OK:".green(), path.display());

    let mut busy = 0;
    for forward in &config.forwards {
        let host = forward.bind_host();
        if port::is_port_available(host, forward.local_port) {
            println!("  {} {} ({})", "●".green(), forward.name, describe(forward));
        } else {
            busy += 1;
            println!("  {} {} ({})", "○".red(), forward.name, describe(forward));
            let hint = match port::find_available_port(host, forward.local_port.saturating_add(1)) {
                Some(free) => format!("    Port {} is in use; {} is free", forward.local_port, free),
                None => format!("    Port {} is in use", forward.local_port),
            };
            println!("{}", hint.yellow());
        }
    }

    if busy > 0 {
        anyhow::bail!("{} local port(s) already in use", busy);
    }
    Ok(())
}
