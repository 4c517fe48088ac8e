//! Certificate authority: one long-lived root key, on-demand leaf issuance
//! cached by identity.
//!
//! `issue` is single-flight per identity: the async mutex spans cache
//! lookup and generation, so concurrent calls for the same host coalesce
//! onto one generated leaf. Leaves are cached in least-recently-accessed
//! order, capacity 256 by default.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::codec::x509::{
    LeafTemplate, SanEntry, assemble_certificate, tbs_ca_certificate,
    tbs_certificate,
};

const DEFAULT_CACHE_CAPACITY: usize = 256;
const LEAF_KEY_BITS: usize = 2048;
const ROOT_KEY_BITS: usize = 3072;
/// Leaves are backdated slightly so freshly issued certificates validate on
/// hosts with modest clock drift.
const NOT_BEFORE_SKEW_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("rng failure: {0}")]
    Rng(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("root material rejected: {0}")]
    RootImport(String),

    #[error("issuance task aborted")]
    TaskAborted,
}

/// What a leaf is bound to: a DNS name or an IP literal. The SAN entry
/// follows the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeafIdentity {
    Dns(String),
    Ip(IpAddr),
}

impl LeafIdentity {
    /// IP literals become IP identities; everything else is a DNS name.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => LeafIdentity::Ip(ip),
            Err(_) => LeafIdentity::Dns(host.to_ascii_lowercase()),
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            LeafIdentity::Dns(name) => name.clone(),
            LeafIdentity::Ip(ip) => ip.to_string(),
        }
    }

    fn san_entry(&self) -> SanEntry {
        match self {
            LeafIdentity::Dns(name) => SanEntry::Dns(name.clone()),
            LeafIdentity::Ip(ip) => SanEntry::Ip(*ip),
        }
    }
}

/// An issued leaf: certificate DER plus its PKCS#8 private key. The key
/// bytes are zeroized when the last reference drops.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub cert_der: Vec<u8>,
    pub key_pkcs8_der: Zeroizing<Vec<u8>>,
}

#[derive(Debug)]
struct CaInner {
    root_key: RsaPrivateKey,
    root_cert_der: Vec<u8>,
    root_cn: String,
    cache: HashMap<LeafIdentity, Arc<IssuedLeaf>>,
    /// Access order, least-recently-accessed at the front.
    order: VecDeque<LeafIdentity>,
    capacity: usize,
}

#[derive(Debug)]
pub struct CertAuthority {
    inner: Mutex<CaInner>,
}

impl CertAuthority {
    /// Generate a fresh root. Used by the supervisor at first install; the
    /// proxy extension receives the result over IPC instead.
    pub fn generate(root_cn: &str) -> Result<Self, CaError> {
        let root_key = RsaPrivateKey::new(&mut OsRng, ROOT_KEY_BITS)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;
        let root_cert_der = self_signed_root(&root_key, root_cn)?;
        info!(target: "ca", cn = root_cn, "generated root certificate");
        Ok(Self::from_parts(root_key, root_cert_der, root_cn))
    }

    /// Reconstruct the authority from PEM-armored root material (one
    /// CERTIFICATE block and one PRIVATE KEY block), as delivered over IPC.
    pub fn from_pem(pem: &str) -> Result<Self, CaError> {
        let mut cursor = std::io::Cursor::new(pem.as_bytes());
        let mut cert_der: Option<Vec<u8>> = None;
        let mut key_der: Option<Zeroizing<Vec<u8>>> = None;

        for item in rustls_pemfile::read_all(&mut cursor) {
            match item.map_err(|e| CaError::RootImport(e.to_string()))? {
                rustls_pemfile::Item::X509Certificate(der) => {
                    cert_der = Some(der.as_ref().to_vec());
                }
                rustls_pemfile::Item::Pkcs8Key(der) => {
                    key_der =
                        Some(Zeroizing::new(der.secret_pkcs8_der().to_vec()));
                }
                rustls_pemfile::Item::Pkcs1Key(der) => {
                    let key =
                        RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                            .map_err(|e| {
                                CaError::RootImport(e.to_string())
                            })?;
                    let doc = key
                        .to_pkcs8_der()
                        .map_err(|e| CaError::RootImport(e.to_string()))?;
                    key_der = Some(Zeroizing::new(doc.as_bytes().to_vec()));
                }
                _ => {}
            }
        }

        let cert_der = cert_der
            .ok_or_else(|| CaError::RootImport("no certificate block".into()))?;
        let key_der = key_der
            .ok_or_else(|| CaError::RootImport("no private key block".into()))?;
        let root_key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|e| CaError::RootImport(e.to_string()))?;

        Ok(Self::from_parts(root_key, cert_der, "Iris Root CA"))
    }

    fn from_parts(
        root_key: RsaPrivateKey,
        root_cert_der: Vec<u8>,
        root_cn: &str,
    ) -> Self {
        Self {
            inner: Mutex::new(CaInner {
                root_key,
                root_cert_der,
                root_cn: root_cn.to_string(),
                cache: HashMap::new(),
                order: VecDeque::new(),
                capacity: DEFAULT_CACHE_CAPACITY,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_cache_capacity(&self, capacity: usize) {
        self.inner.lock().await.capacity = capacity.max(1);
    }

    pub async fn root_cert_der(&self) -> Vec<u8> {
        self.inner.lock().await.root_cert_der.clone()
    }

    /// Root certificate and key as PEM, for keychain installation and IPC
    /// transfer. The caller owns keeping the buffer short-lived.
    pub async fn export_pem(&self) -> Result<Zeroizing<String>, CaError> {
        let inner = self.inner.lock().await;
        let key_doc = inner
            .root_key
            .to_pkcs8_der()
            .map_err(|e| CaError::RootImport(e.to_string()))?;
        let mut pem = String::new();
        pem.push_str(&pem_block("CERTIFICATE", &inner.root_cert_der));
        pem.push_str(&pem_block("PRIVATE KEY", key_doc.as_bytes()));
        Ok(Zeroizing::new(pem))
    }

    /// Issue (or fetch from cache) a leaf for `identity`. Cache hits
    /// refresh the identity's recency; misses generate a 2048-bit key on a
    /// blocking thread while holding the issuance lock.
    pub async fn issue(
        &self,
        identity: &LeafIdentity,
    ) -> Result<Arc<IssuedLeaf>, CaError> {
        let mut inner = self.inner.lock().await;

        if let Some(leaf) = inner.cache.get(identity).cloned() {
            let position =
                inner.order.iter().position(|id| id == identity);
            if let Some(position) = position {
                inner.order.remove(position);
            }
            inner.order.push_back(identity.clone());
            debug!(
                target: "ca",
                identity = %identity.as_display(),
                "leaf cache hit"
            );
            return Ok(leaf);
        }

        let template = leaf_template(identity, &inner.root_cn)?;
        let root_key = inner.root_key.clone();
        let leaf = tokio::task::spawn_blocking(move || {
            generate_leaf(&root_key, template)
        })
        .await
        .map_err(|_| CaError::TaskAborted)??;

        let leaf = Arc::new(leaf);
        if inner.cache.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.cache.remove(&oldest);
            }
        }
        inner.cache.insert(identity.clone(), Arc::clone(&leaf));
        inner.order.push_back(identity.clone());
        info!(
            target: "ca",
            identity = %identity.as_display(),
            cached = inner.cache.len(),
            "issued leaf certificate"
        );
        Ok(leaf)
    }
}

fn leaf_template(
    identity: &LeafIdentity,
    root_cn: &str,
) -> Result<LeafTemplate, CaError> {
    let mut serial = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(|e| CaError::Rng(e.to_string()))?;

    let now = Utc::now();
    Ok(LeafTemplate {
        serial,
        issuer_cn: root_cn.to_string(),
        subject_cn: identity.as_display(),
        not_before: now - ChronoDuration::seconds(NOT_BEFORE_SKEW_SECS),
        not_after: now + ChronoDuration::days(365),
        san: vec![identity.san_entry()],
    })
}

fn generate_leaf(
    root_key: &RsaPrivateKey,
    template: LeafTemplate,
) -> Result<IssuedLeaf, CaError> {
    let leaf_key = RsaPrivateKey::new(&mut OsRng, LEAF_KEY_BITS)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let tbs = tbs_certificate(&template, &leaf_key.to_public_key());
    let signature = sign_tbs(root_key, &tbs)?;
    let cert_der = assemble_certificate(&tbs, &signature);

    let key_doc = leaf_key
        .to_pkcs8_der()
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    Ok(IssuedLeaf {
        cert_der,
        key_pkcs8_der: Zeroizing::new(key_doc.as_bytes().to_vec()),
    })
}

fn self_signed_root(
    root_key: &RsaPrivateKey,
    root_cn: &str,
) -> Result<Vec<u8>, CaError> {
    let mut serial = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(|e| CaError::Rng(e.to_string()))?;

    let now = Utc::now();
    let template = LeafTemplate {
        serial,
        issuer_cn: root_cn.to_string(),
        subject_cn: root_cn.to_string(),
        not_before: now - ChronoDuration::seconds(NOT_BEFORE_SKEW_SECS),
        not_after: now + ChronoDuration::days(365 * 10),
        san: Vec::new(),
    };
    let tbs = tbs_ca_certificate(&template, &root_key.to_public_key());
    let signature = sign_tbs(root_key, &tbs)?;
    Ok(assemble_certificate(&tbs, &signature))
}

fn sign_tbs(key: &RsaPrivateKey, tbs: &[u8]) -> Result<Vec<u8>, CaError> {
    let digest = Sha256::digest(tbs);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CaError::Signing(e.to_string()))
}

fn pem_block(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn test_authority() -> CertAuthority {
        // 3072-bit root generation is slow in debug builds; tests share one
        // root, exported once on a plain thread so the helper works from
        // any runtime.
        use std::sync::OnceLock;
        static ROOT_PEM: OnceLock<String> = OnceLock::new();
        let pem = ROOT_PEM.get_or_init(|| {
            std::thread::spawn(|| {
                let ca = CertAuthority::generate("Iris Test Root").unwrap();
                futures::executor::block_on(ca.export_pem())
                    .unwrap()
                    .to_string()
            })
            .join()
            .expect("root generation thread")
        });
        CertAuthority::from_pem(pem).unwrap()
    }

    #[tokio::test]
    async fn issued_leaf_parses_as_valid_x509_v3() {
        let ca = test_authority();
        let identity = LeafIdentity::parse("example.com");
        let leaf = ca.issue(&identity).await.unwrap();

        let (rest, cert) =
            X509Certificate::from_der(&leaf.cert_der).unwrap();
        assert!(rest.is_empty());
        assert_eq!(cert.version(), X509Version::V3);
        assert!(!cert
            .basic_constraints()
            .unwrap()
            .map(|bc| bc.value.ca)
            .unwrap_or(false));

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SAN present");
        assert!(san.value.general_names.iter().any(|gn| matches!(
            gn,
            GeneralName::DNSName("example.com")
        )));

        // Full 128-bit serial entropy.
        assert!(cert.raw_serial().len() >= 16);
    }

    #[tokio::test]
    async fn ip_identity_gets_ip_san() {
        let ca = test_authority();
        let identity = LeafIdentity::parse("192.0.2.9");
        assert!(matches!(identity, LeafIdentity::Ip(_)));
        let leaf = ca.issue(&identity).await.unwrap();

        let (_, cert) = X509Certificate::from_der(&leaf.cert_der).unwrap();
        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SAN present");
        assert!(san.value.general_names.iter().any(|gn| matches!(
            gn,
            &GeneralName::IPAddress(&[192, 0, 2, 9])
        )));
    }

    #[tokio::test]
    async fn cache_coalesces_repeat_issues() {
        let ca = test_authority();
        let identity = LeafIdentity::parse("cached.example.com");
        let first = ca.issue(&identity).await.unwrap();
        let second = ca.issue(&identity).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed_not_oldest_insert() {
        let ca = test_authority();
        ca.set_cache_capacity(2).await;

        let a = LeafIdentity::parse("a.test");
        let b = LeafIdentity::parse("b.test");
        let c = LeafIdentity::parse("c.test");

        let leaf_a = ca.issue(&a).await.unwrap();
        let _leaf_b = ca.issue(&b).await.unwrap();
        // Touch `a` so `b` becomes least recently accessed.
        let again_a = ca.issue(&a).await.unwrap();
        assert!(Arc::ptr_eq(&leaf_a, &again_a));

        // Inserting `c` evicts `b`, not the older-by-insertion `a`.
        let _leaf_c = ca.issue(&c).await.unwrap();
        let third_a = ca.issue(&a).await.unwrap();
        assert!(Arc::ptr_eq(&leaf_a, &third_a), "a stayed cached");
    }

    #[tokio::test]
    async fn pem_round_trip_preserves_signing_ability() {
        let ca = test_authority();
        let pem = ca.export_pem().await.unwrap();
        let restored = CertAuthority::from_pem(&pem).unwrap();
        let leaf = restored
            .issue(&LeafIdentity::parse("roundtrip.test"))
            .await
            .unwrap();
        assert!(
            X509Certificate::from_der(&leaf.cert_der).is_ok()
        );
    }
}
