//! The Iris network-extension daemon: claims outbound flows, intercepts
//! TLS with per-host synthesized leaves, proxies DNS over HTTPS, runs the
//! detection engine, and serves the supervisor's IPC surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iris_proxy::daemon::DaemonState;
use iris_proxy::dns::{DnsProxy, QuerySink};
use iris_proxy::doh::DohClient;
use iris_proxy::ipc_server;
use iris_proxy::router::FlowRouter;
use iris_proxy::source::flow_channel;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const FLOW_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Parser)]
#[command(
    name = "iris-proxy",
    version,
    about = "Iris network extension daemon"
)]
struct Args {
    /// Configuration file (TOML). Environment variables override it.
    #[arg(long, env = "IRIS_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket path, overriding configuration.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = iris_config::load_from(args.config.as_deref())
        .context("loading configuration")?;
    if let Some(socket) = args.socket {
        config.ipc.socket_path = socket;
    }

    let state = DaemonState::init(config)?;
    state.spawn_maintenance();

    let doh = DohClient::new(&state.config.dns)
        .context("building doh client")?;
    let dns = Arc::new(DnsProxy::new(
        Arc::new(doh),
        Arc::clone(&state) as Arc<dyn QuerySink>,
        state.config.dns.udp_idle_timeout(),
    ));

    // The kernel-side extension glue claims flows and offers them through
    // this injector; the router owns them from there to close.
    let (injector, flows) = flow_channel(FLOW_CHANNEL_CAPACITY);
    let router = Arc::new(FlowRouter::new(Arc::clone(&state), dns));
    tokio::spawn(Arc::clone(&router).run(flows));
    let _flow_injector = injector;

    let ipc = tokio::spawn(ipc_server::run(Arc::clone(&state)));

    shutdown_signal().await;
    state.shutdown_gracefully(SHUTDOWN_GRACE).await;
    ipc.abort();
    info!(target: "daemon", "daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())
        .expect("terminate signal handler installs");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
