use std::path::{Path, PathBuf};

use crate::models::IrisConfig;
use crate::util::{env_parse, env_string};
use crate::validation::validate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("config file {0}: {1}")]
    File(PathBuf, std::io::Error),

    #[error("config file {0}: {1}")]
    Toml(PathBuf, String),

    #[error("environment: {0}")]
    Environment(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration: defaults, then the optional TOML file named by
/// `IRIS_CONFIG` (if any), then environment overrides.
pub fn load() -> Result<IrisConfig, ConfigLoadError> {
    let _ = dotenvy::dotenv();
    let file = env_string("IRIS_CONFIG").map(PathBuf::from);
    load_from(file.as_deref())
}

pub fn load_from(file: Option<&Path>) -> Result<IrisConfig, ConfigLoadError> {
    let mut config = match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigLoadError::File(path.to_path_buf(), e))?;
            toml::from_str(&raw).map_err(|e| {
                ConfigLoadError::Toml(path.to_path_buf(), e.to_string())
            })?
        }
        None => IrisConfig::default(),
    };

    apply_env(&mut config).map_err(ConfigLoadError::Environment)?;
    validate(&config).map_err(ConfigLoadError::Invalid)?;
    Ok(config)
}

fn apply_env(config: &mut IrisConfig) -> Result<(), String> {
    if let Some(v) = env_parse("IRIS_CAPTURE_MEMORY_BUDGET_BYTES")? {
        config.capture.memory_budget_bytes = v;
    }
    if let Some(v) = env_parse("IRIS_PREVIEW_BYTES")? {
        config.capture.preview_bytes = v;
    }
    if let Some(v) = env_parse("IRIS_BODY_CAP_BYTES")? {
        config.capture.body_cap_bytes = v;
    }
    if let Some(v) = env_parse("IRIS_MAX_CONNECTIONS")? {
        config.proxy.max_connections = v;
    }
    if let Some(v) = env_parse("IRIS_STALE_TIMEOUT_SECONDS")? {
        config.proxy.stale_timeout_seconds = v;
    }
    if let Some(v) = env_parse("IRIS_HANDSHAKE_TIMEOUT_SECONDS")? {
        config.proxy.handshake_timeout_seconds = v;
    }
    if let Some(v) = env_string("IRIS_FIREWALL_RULES_PATH") {
        config.proxy.firewall_rules_path = PathBuf::from(v);
    }
    if let Some(v) = env_string("IRIS_DOH_UPSTREAM_URL") {
        config.dns.upstream_url = v;
    }
    if let Some(v) = env_string("IRIS_DOH_BOOTSTRAP_IP") {
        config.dns.bootstrap_ip = v;
    }
    if let Some(v) = env_parse("IRIS_DOH_TIMEOUT_SECONDS")? {
        config.dns.timeout_seconds = v;
    }
    if let Some(v) = env_parse("IRIS_DNS_UDP_IDLE_SECONDS")? {
        config.dns.udp_idle_timeout_seconds = v;
    }
    if let Some(v) = env_parse("IRIS_ALERT_DEDUP_WINDOW_SECONDS")? {
        config.detection.alert_dedup_window_seconds = v;
    }
    if let Some(v) = env_string("IRIS_IPC_SOCKET") {
        config.ipc.socket_path = PathBuf::from(v);
    }
    if let Some(v) = env_parse("IRIS_IPC_CALL_TIMEOUT_SECONDS")? {
        config.ipc.call_timeout_seconds = v;
    }
    if let Some(v) = env_string("IRIS_STATUS_SNAPSHOT_PATH") {
        config.ipc.status_snapshot_path = PathBuf::from(v);
    }
    Ok(())
}
