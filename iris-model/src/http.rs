use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::FlowId;

/// A single header line. Original case is preserved for display; comparison
/// is the caller's concern and is case-insensitive everywhere in the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// One side of a captured exchange: either the request or the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapturedMessage {
    /// Request method, empty for responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Request target, empty for responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Status code, zero for requests.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub version: String,
    pub headers: Vec<Header>,
    /// First bytes of the body, bounded by the preview budget.
    #[serde(with = "preview_bytes")]
    pub body_preview: Vec<u8>,
    /// Total body size on the wire, which may exceed the preview.
    pub body_size: u64,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl CapturedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub flow_id: FlowId,
    pub request: CapturedMessage,
    pub response: Option<CapturedMessage>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the exchange terminated abnormally (peer close mid-message,
    /// framing violation, body cap exceeded).
    pub error: Option<String>,
}

impl CapturedExchange {
    /// Approximate retained size, used against the aggregate capture budget.
    pub fn retained_bytes(&self) -> usize {
        let headers = |m: &CapturedMessage| {
            m.headers
                .iter()
                .map(|h| h.name.len() + h.value.len())
                .sum::<usize>()
        };
        let mut total = self.request.body_preview.len() + headers(&self.request);
        if let Some(resp) = &self.response {
            total += resp.body_preview.len() + headers(resp);
        }
        total
    }
}

// Body previews are arbitrary bytes; JSON needs them armored.
mod preview_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_bytes_round_trip() {
        let exchange = CapturedExchange {
            flow_id: FlowId::new(),
            request: CapturedMessage {
                method: "GET".into(),
                path: "/".into(),
                version: "HTTP/1.1".into(),
                body_preview: vec![0, 1, 2, 0xff, 0xfe],
                ..Default::default()
            },
            response: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };

        let json = serde_json::to_string(&exchange).unwrap();
        let back: CapturedExchange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request.body_preview, vec![0, 1, 2, 0xff, 0xfe]);
        assert_eq!(back.request.method, "GET");
    }
}
