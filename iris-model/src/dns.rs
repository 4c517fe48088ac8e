use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::FlowAttribution;
use crate::ids::QueryId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    pub record_type: u16,
    pub ttl: u32,
    pub rdata: String,
}

/// One resolved (or failed) DNS query as recorded by the DNS proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryRecord {
    pub id: QueryId,
    pub timestamp: DateTime<Utc>,
    pub attribution: Option<FlowAttribution>,
    pub domain: String,
    pub qtype: u16,
    pub rcode: u8,
    pub answers: Vec<DnsAnswer>,
    pub latency_ms: u64,
    /// Upstream resolver URL the query was forwarded to.
    pub upstream: String,
}

impl DnsQueryRecord {
    /// Record-type mnemonic for the common types, numeric otherwise.
    pub fn qtype_str(&self) -> String {
        match self.qtype {
            1 => "A".into(),
            2 => "NS".into(),
            5 => "CNAME".into(),
            12 => "PTR".into(),
            15 => "MX".into(),
            16 => "TXT".into(),
            28 => "AAAA".into(),
            33 => "SRV".into(),
            65 => "HTTPS".into(),
            other => other.to_string(),
        }
    }
}
