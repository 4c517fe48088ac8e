//! Iris supervisor CLI. Commands speak to the extension daemons over the
//! authenticated control socket; exit code 0 means ok, 1 a reported
//! failure, 2 an unexpected error.

mod client;
mod commands;
mod snapshot;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use iris_model::ipc::IpcRequest;
use tracing_subscriber::EnvFilter;

use crate::commands::Outcome;

const DEFAULT_CA_FILE: &str = "/var/lib/iris/ca.pem";

#[derive(Debug, Parser)]
#[command(name = "irisctl", version, about = "Iris supervisor control")]
struct Args {
    /// Configuration file (TOML). Environment variables override it.
    #[arg(long, env = "IRIS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report extension health and write the JSON status snapshot.
    Status,
    /// Bounce interception on the proxy extension.
    Reinstall,
    /// Enable interception.
    StartProxy,
    /// Disable interception.
    StopProxy,
    /// Sweep expired firewall rules.
    CleanProxy,
    /// Verify the proxy extension is active.
    InstallProxy,
    /// Verify the DNS proxy tier is active.
    InstallDns,
    /// Deliver the root CA to the proxy extension, generating one on
    /// first use.
    SendCa {
        #[arg(long, default_value = DEFAULT_CA_FILE)]
        ca_file: PathBuf,
    },
    /// Probe every extension's control socket.
    CheckExtensions,
    /// Run the batch scanner tiers and print the fused findings.
    Scan,
    /// Firewall rule management.
    Firewall {
        #[command(subcommand)]
        command: FirewallCommand,
    },
}

#[derive(Debug, Subcommand)]
enum FirewallCommand {
    Add(commands::AddRuleArgs),
    Remove {
        id: String,
    },
    Toggle {
        id: String,
    },
    List,
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = match iris_config::load_from(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = match args.command {
        Command::Status => commands::status(&config).await,
        Command::Reinstall => commands::reinstall(&config).await,
        Command::StartProxy => {
            commands::set_interception(&config, true).await
        }
        Command::StopProxy => {
            commands::set_interception(&config, false).await
        }
        Command::CleanProxy => commands::clean_proxy(&config).await,
        Command::InstallProxy => {
            commands::install_extension(&config, "iris-proxy").await
        }
        Command::InstallDns => {
            commands::install_extension(&config, "iris-dns").await
        }
        Command::SendCa { ca_file } => {
            commands::send_ca(&config, &ca_file).await
        }
        Command::CheckExtensions => commands::check_extensions(&config).await,
        Command::Scan => commands::scan(&config).await,
        Command::Firewall { command } => match command {
            FirewallCommand::Add(rule) => {
                commands::firewall_add(&config, rule).await
            }
            FirewallCommand::Remove { id } => {
                commands::firewall_simple(
                    &config,
                    IpcRequest::RemoveFirewallRule(id.into()),
                )
                .await
            }
            FirewallCommand::Toggle { id } => {
                commands::firewall_simple(
                    &config,
                    IpcRequest::ToggleFirewallRule(id.into()),
                )
                .await
            }
            FirewallCommand::List => {
                commands::firewall_simple(
                    &config,
                    IpcRequest::ListFirewallRules,
                )
                .await
            }
            FirewallCommand::Cleanup => {
                commands::firewall_simple(
                    &config,
                    IpcRequest::CleanupExpiredRules,
                )
                .await
            }
        },
    };

    match outcome {
        Ok(Outcome::Ok) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Failed(reason)) => {
            println!("failed: {reason}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
