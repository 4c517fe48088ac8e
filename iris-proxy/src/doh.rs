//! DNS-over-HTTPS upstream client. The upstream is reached by its
//! bootstrap IP, never by name, so resolving the resolver cannot recurse
//! into us. There is no plain-DNS fallback of any kind: upstream failure
//! surfaces as an error and the DNS proxy answers SERVFAIL.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use iris_config::DnsConfig;
use tracing::{debug, warn};

const CONTENT_TYPE: &str = "application/dns-message";

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("upstream config: {0}")]
    Config(String),

    #[error("upstream request failed: {0}")]
    Request(String),

    #[error("upstream returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug)]
pub struct DohClient {
    http: reqwest::Client,
    url: reqwest::Url,
    timeout: Duration,
}

impl DohClient {
    pub fn new(config: &DnsConfig) -> Result<Self, DohError> {
        let url = reqwest::Url::parse(&config.upstream_url)
            .map_err(|e| DohError::Config(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| DohError::Config("upstream url has no host".into()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let bootstrap: IpAddr = config
            .bootstrap_ip
            .parse()
            .map_err(|_| DohError::Config("bootstrap ip invalid".into()))?;

        let http = reqwest::Client::builder()
            .resolve(&host, SocketAddr::new(bootstrap, port))
            .timeout(config.timeout())
            .build()
            .map_err(|e| DohError::Config(e.to_string()))?;

        debug!(
            target: "dns::doh",
            upstream = %url,
            bootstrap = %bootstrap,
            "doh client ready"
        );
        Ok(Self {
            http,
            url,
            timeout: config.timeout(),
        })
    }

    pub fn upstream(&self) -> String {
        self.url.to_string()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward one wire-format query, returning the wire-format answer.
    pub async fn query(&self, wire_query: &[u8]) -> Result<Vec<u8>, DohError> {
        let response = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, CONTENT_TYPE)
            .body(wire_query.to_vec())
            .send()
            .await
            .map_err(|e| {
                warn!(target: "dns::doh", error = %e, "upstream unreachable");
                DohError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DohError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DohError::Request(e.to_string()))?;
        Ok(body.to_vec())
    }
}
