//! Command implementations. Every command resolves to `ok` or `failed`
//! with a reason; unexpected errors bubble as `anyhow` and exit nonzero.

use std::path::Path;

use anyhow::Context;
use iris_config::IrisConfig;
use iris_core::ca::CertAuthority;
use iris_core::fusion::FusionEngine;
use iris_core::scan::ScannerRuntime;
use iris_model::firewall::{FirewallAction, FirewallRule};
use iris_model::ipc::{IpcRequest, IpcResponse};
use tracing::{info, warn};

use crate::client::IpcClient;
use crate::snapshot;

/// What a command reports back; `main` maps this onto exit codes.
#[derive(Debug)]
pub enum Outcome {
    Ok,
    Failed(String),
}

impl Outcome {
    fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed(reason.into())
    }
}

async fn connect(config: &IrisConfig) -> Option<IpcClient> {
    match IpcClient::connect(
        &config.ipc.socket_path,
        config.ipc.call_timeout(),
    )
    .await
    {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(
                target: "ctl",
                socket = %config.ipc.socket_path.display(),
                error = %e,
                "proxy extension unreachable"
            );
            None
        }
    }
}

pub async fn status(config: &IrisConfig) -> anyhow::Result<Outcome> {
    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    let response = client.call(IpcRequest::GetStatus).await?;
    let IpcResponse::Status(status) = response else {
        return Ok(Outcome::failed("unexpected status reply"));
    };

    println!("extension:     {} {}", status.extension, status.version);
    println!(
        "interception:  {}",
        if status.interception_enabled { "on" } else { "off" }
    );
    println!(
        "root ca:       {}",
        if status.ca_installed { "installed" } else { "missing" }
    );
    println!("active flows:  {}", status.active_flows);
    println!("flows seen:    {}", status.flows_seen);
    println!("exchanges:     {}", status.exchanges_captured);
    println!("dns queries:   {}", status.dns_queries);
    println!("events:        {}", status.events_normalized);
    println!("alerts:        {}", status.alerts_fired);
    println!(
        "capture:       {} / {} bytes",
        status.capture_used_bytes, status.capture_budget_bytes
    );

    // Snapshot for non-interactive consumers.
    let path = &config.ipc.status_snapshot_path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&status)?)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(target: "ctl", path = %path.display(), "status snapshot written");
    Ok(Outcome::Ok)
}

pub async fn set_interception(
    config: &IrisConfig,
    enabled: bool,
) -> anyhow::Result<Outcome> {
    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    match client
        .call(IpcRequest::SetInterceptionEnabled(enabled))
        .await?
    {
        IpcResponse::Ok => Ok(Outcome::Ok),
        other => Ok(Outcome::failed(format!("unexpected reply: {other:?}"))),
    }
}

/// Tear interception down and bring it back, forcing the extension to
/// re-register its flow claims.
pub async fn reinstall(config: &IrisConfig) -> anyhow::Result<Outcome> {
    match set_interception(config, false).await? {
        Outcome::Ok => set_interception(config, true).await,
        failed => Ok(failed),
    }
}

pub async fn clean_proxy(config: &IrisConfig) -> anyhow::Result<Outcome> {
    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    match client.call(IpcRequest::CleanupExpiredRules).await? {
        IpcResponse::CleanedUp { count } => {
            println!("removed {count} expired rules");
            Ok(Outcome::Ok)
        }
        other => Ok(Outcome::failed(format!("unexpected reply: {other:?}"))),
    }
}

pub async fn check_extensions(
    config: &IrisConfig,
) -> anyhow::Result<Outcome> {
    match connect(config).await {
        Some(mut client) => match client.call(IpcRequest::GetStatus).await {
            Ok(IpcResponse::Status(status)) => {
                println!(
                    "{}: reachable ({})",
                    status.extension, status.version
                );
                Ok(Outcome::Ok)
            }
            Ok(_) | Err(_) => {
                println!("iris-proxy: unresponsive");
                Ok(Outcome::failed("proxy extension unresponsive"))
            }
        },
        None => {
            println!("iris-proxy: unreachable");
            Ok(Outcome::failed("proxy extension unreachable"))
        }
    }
}

/// Verify an extension is reachable and interception is enabled. The
/// platform's extension manager owns the actual installation.
pub async fn install_extension(
    config: &IrisConfig,
    name: &str,
) -> anyhow::Result<Outcome> {
    match set_interception(config, true).await? {
        Outcome::Ok => {
            println!("{name}: active");
            Ok(Outcome::Ok)
        }
        failed => Ok(failed),
    }
}

/// Load (or create) the root CA and deliver it to the proxy extension.
pub async fn send_ca(
    config: &IrisConfig,
    ca_file: &Path,
) -> anyhow::Result<Outcome> {
    let pem = load_or_generate_root(ca_file).await?;
    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    match client.call(IpcRequest::InstallCa { pem }).await? {
        IpcResponse::Ok => {
            println!("root ca installed");
            Ok(Outcome::Ok)
        }
        IpcResponse::Error { message, .. } => {
            Ok(Outcome::failed(format!("ca rejected: {message}")))
        }
        other => Ok(Outcome::failed(format!("unexpected reply: {other:?}"))),
    }
}

async fn load_or_generate_root(ca_file: &Path) -> anyhow::Result<String> {
    if ca_file.exists() {
        return std::fs::read_to_string(ca_file)
            .with_context(|| format!("reading {}", ca_file.display()));
    }
    info!(
        target: "ctl",
        path = %ca_file.display(),
        "no root on disk, generating"
    );
    let ca = tokio::task::spawn_blocking(|| {
        CertAuthority::generate("Iris Root CA")
    })
    .await
    .context("root generation task")??;
    let pem = ca.export_pem().await?;
    if let Some(parent) = ca_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(ca_file, pem.as_bytes())
        .with_context(|| format!("writing {}", ca_file.display()))?;
    restrict_permissions(ca_file)?;
    Ok(pem.to_string())
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

/// Run the batch scanner tiers over a fresh process snapshot, fold the
/// findings together with recent alerts, and print the fused view. Every
/// scanner gets a result line, failures included.
pub async fn scan(config: &IrisConfig) -> anyhow::Result<Outcome> {
    let snapshot = snapshot::take();
    println!("snapshot: {} processes", snapshot.processes.len());

    let runtime = ScannerRuntime::with_builtin();
    let report = runtime.run(&snapshot).await;

    for outcome in &report.outcomes {
        match &outcome.error {
            Some(error) => println!(
                "  {:<16} [{}] FAILED: {error} ({:?})",
                outcome.scanner_id,
                outcome.tier.as_str(),
                outcome.elapsed
            ),
            None => println!(
                "  {:<16} [{}] {} findings ({:?})",
                outcome.scanner_id,
                outcome.tier.as_str(),
                outcome.anomalies.len(),
                outcome.elapsed
            ),
        }
    }

    let mut fusion = FusionEngine::new();
    for anomaly in report.anomalies() {
        fusion.ingest_anomaly(anomaly);
    }

    // Recent alerts enrich the fused picture when the extension is up.
    if let Some(mut client) = connect(config).await {
        if let Ok(IpcResponse::Alerts { items, .. }) =
            client.call(IpcRequest::PollAlerts { cursor: 0 }).await
        {
            println!("alerts:   {} recent", items.len());
            for alert in &items {
                fusion.ingest_alert(alert);
            }
        }
    }

    let campaigns = fusion.recluster(chrono::Utc::now());
    let entities = fusion.entities();

    println!("entities: {}", entities.len());
    for entity in entities.iter().take(20) {
        println!(
            "  {:<40} score {:.2}  stages {}",
            entity.key.to_string(),
            entity.score,
            entity
                .stages
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    for campaign in &campaigns {
        println!(
            "campaign {}: {} members, {} stages, class {}",
            campaign.id,
            campaign.members.len(),
            campaign.stages.len(),
            campaign.class.as_str()
        );
    }
    Ok(Outcome::Ok)
}

#[derive(Debug, clap::Args)]
pub struct AddRuleArgs {
    #[arg(long)]
    pub id: String,
    #[arg(long, value_parser = ["allow", "block"])]
    pub action: String,
    #[arg(long)]
    pub process_path: Option<String>,
    #[arg(long)]
    pub signing_id: Option<String>,
    #[arg(long)]
    pub remote_host: Option<String>,
    /// Remote port; must be numeric.
    #[arg(long)]
    pub port: Option<String>,
    /// Rule lifetime in seconds; permanent when omitted.
    #[arg(long)]
    pub ttl_seconds: Option<i64>,
}

pub async fn firewall_add(
    config: &IrisConfig,
    args: AddRuleArgs,
) -> anyhow::Result<Outcome> {
    // Port strings validate before anything reaches the extension.
    let port = match args.port.as_deref() {
        Some(raw) => match iris_core::firewall::parse_port(raw) {
            Ok(port) => Some(port),
            Err(e) => return Ok(Outcome::failed(e.to_string())),
        },
        None => None,
    };

    let action = match args.action.as_str() {
        "allow" => FirewallAction::Allow,
        _ => FirewallAction::Block,
    };
    let rule = FirewallRule {
        id: args.id.into(),
        action,
        process_path: args.process_path,
        signing_id: args.signing_id,
        remote_host: args.remote_host,
        remote_port: port,
        active: true,
        expires_at: args
            .ttl_seconds
            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
    };

    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    match client.call(IpcRequest::AddFirewallRule(rule)).await? {
        IpcResponse::Ok => Ok(Outcome::Ok),
        IpcResponse::Error { message, .. } => Ok(Outcome::failed(message)),
        other => Ok(Outcome::failed(format!("unexpected reply: {other:?}"))),
    }
}

pub async fn firewall_simple(
    config: &IrisConfig,
    request: IpcRequest,
) -> anyhow::Result<Outcome> {
    let Some(mut client) = connect(config).await else {
        return Ok(Outcome::failed("proxy extension unreachable"));
    };
    match client.call(request).await? {
        IpcResponse::Ok => Ok(Outcome::Ok),
        IpcResponse::CleanedUp { count } => {
            println!("removed {count} expired rules");
            Ok(Outcome::Ok)
        }
        IpcResponse::FirewallRules(rules) => {
            for rule in rules {
                println!(
                    "{:<20} {:<5} process={} host={} port={} active={}",
                    rule.id,
                    rule.action.as_str(),
                    rule.process_path.as_deref().unwrap_or("*"),
                    rule.remote_host.as_deref().unwrap_or("*"),
                    rule.remote_port
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "*".into()),
                    rule.active,
                );
            }
            Ok(Outcome::Ok)
        }
        IpcResponse::Error { message, .. } => Ok(Outcome::failed(message)),
        other => Ok(Outcome::failed(format!("unexpected reply: {other:?}"))),
    }
}
