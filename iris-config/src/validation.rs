use std::net::IpAddr;

use crate::models::IrisConfig;

/// Reject configurations that would wedge a daemon at runtime. Zero-valued
/// budgets and timeouts are configuration errors, not requests for
/// unlimited behavior.
pub fn validate(config: &IrisConfig) -> Result<(), String> {
    if config.capture.preview_bytes == 0 {
        return Err("capture.preview_bytes must be positive".into());
    }
    if config.capture.body_cap_bytes == 0 {
        return Err("capture.body_cap_bytes must be positive".into());
    }
    if config.capture.memory_budget_bytes < config.capture.body_cap_bytes {
        return Err(
            "capture.memory_budget_bytes must be at least body_cap_bytes"
                .into(),
        );
    }
    if config.proxy.max_connections == 0 {
        return Err("proxy.max_connections must be positive".into());
    }
    if config.proxy.handshake_timeout_seconds == 0 {
        return Err("proxy.handshake_timeout_seconds must be positive".into());
    }
    if config.dns.timeout_seconds == 0 {
        return Err("dns.timeout_seconds must be positive".into());
    }
    if !config.dns.upstream_url.starts_with("https://") {
        return Err(format!(
            "dns.upstream_url must be https, got {:?}",
            config.dns.upstream_url
        ));
    }
    if config.dns.bootstrap_ip.parse::<IpAddr>().is_err() {
        return Err(format!(
            "dns.bootstrap_ip must be a literal address, got {:?}",
            config.dns.bootstrap_ip
        ));
    }
    if config.ipc.socket_path.as_os_str().is_empty() {
        return Err("ipc.socket_path must be set".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IrisConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&IrisConfig::default()).is_ok());
    }

    #[test]
    fn hostname_bootstrap_is_rejected() {
        let mut config = IrisConfig::default();
        config.dns.bootstrap_ip = "dns.example.com".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn plain_http_upstream_is_rejected() {
        let mut config = IrisConfig::default();
        config.dns.upstream_url = "http://1.1.1.1/dns-query".into();
        assert!(validate(&config).is_err());
    }
}
