use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_CAPTURE_MEMORY_BUDGET_BYTES: u64 = 30 * 1024 * 1024 * 1024;
pub const DEFAULT_BODY_CAP_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_PREVIEW_BYTES: usize = 8192;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DOH_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DNS_UDP_IDLE_SECS: u64 = 300;
pub const DEFAULT_ALERT_DEDUP_WINDOW_SECS: u64 = 60;
pub const DEFAULT_IPC_CALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IrisConfig {
    pub capture: CaptureConfig,
    pub proxy: ProxyConfig,
    pub dns: DnsConfig,
    pub detection: DetectionConfig,
    pub ipc: IpcConfig,
}

/// Budgets for captured exchange bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Aggregate retained capture bytes across all flows. Enforced on every
    /// write; oldest exchanges are evicted first.
    pub memory_budget_bytes: u64,
    /// Per-exchange body preview retained for display.
    pub preview_bytes: usize,
    /// Per-message total body cap; exceeding it aborts the exchange.
    pub body_cap_bytes: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_CAPTURE_MEMORY_BUDGET_BYTES,
            preview_bytes: DEFAULT_PREVIEW_BYTES,
            body_cap_bytes: DEFAULT_BODY_CAP_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub max_connections: usize,
    pub stale_timeout_seconds: u64,
    pub handshake_timeout_seconds: u64,
    /// On-disk location of persisted firewall rules.
    pub firewall_rules_path: PathBuf,
}

impl ProxyConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            stale_timeout_seconds: DEFAULT_STALE_TIMEOUT_SECS,
            handshake_timeout_seconds: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            firewall_rules_path: PathBuf::from(
                "/var/lib/iris/firewall-rules.json",
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsConfig {
    /// DoH upstream endpoint ("https://cloudflare-dns.com/dns-query").
    pub upstream_url: String,
    /// Literal address used to reach the upstream without invoking DNS.
    pub bootstrap_ip: String,
    pub timeout_seconds: u64,
    pub udp_idle_timeout_seconds: u64,
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_seconds)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://cloudflare-dns.com/dns-query".into(),
            bootstrap_ip: "1.1.1.1".into(),
            timeout_seconds: DEFAULT_DOH_TIMEOUT_SECS,
            udp_idle_timeout_seconds: DEFAULT_DNS_UDP_IDLE_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub alert_dedup_window_seconds: u64,
}

impl DetectionConfig {
    pub fn alert_dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_window_seconds)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            alert_dedup_window_seconds: DEFAULT_ALERT_DEDUP_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
    pub call_timeout_seconds: u64,
    /// Where `irisctl status` writes its JSON snapshot.
    pub status_snapshot_path: PathBuf,
}

impl IpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/iris/proxy.sock"),
            call_timeout_seconds: DEFAULT_IPC_CALL_TIMEOUT_SECS,
            status_snapshot_path: PathBuf::from("/var/lib/iris/status.json"),
        }
    }
}
