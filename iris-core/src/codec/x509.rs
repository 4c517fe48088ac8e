//! X.509 v3 leaf certificate assembly over the DER writer.
//!
//! This module is pure structure: it builds the TBSCertificate bytes and
//! glues a detached signature on. Key generation and signing live with the
//! certificate authority.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use rsa::traits::PublicKeyParts;

use super::der;

const OID_SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_KEY_USAGE: &str = "2.5.29.15";
const OID_EXT_KEY_USAGE: &str = "2.5.29.37";
const OID_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

#[derive(Debug, Clone)]
pub struct LeafTemplate {
    pub serial: [u8; 16],
    pub issuer_cn: String,
    pub subject_cn: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub san: Vec<SanEntry>,
}

/// Build the TBSCertificate for a server leaf: v3, the given 128-bit
/// serial, sha256WithRSAEncryption, single-RDN names, CA:false, key usage
/// digitalSignature+keyEncipherment, extended key usage serverAuth, and the
/// SAN entries.
pub fn tbs_certificate(
    template: &LeafTemplate,
    public_key: &RsaPublicKey,
) -> Vec<u8> {
    let version = der::context(0, &der::small_integer(2));
    let serial = der::unsigned_integer(&template.serial);
    let signature_alg = signature_algorithm();
    let issuer = single_rdn_name(&template.issuer_cn);
    let validity = der::sequence(&[
        der::time(template.not_before),
        der::time(template.not_after),
    ]);
    let subject = single_rdn_name(&template.subject_cn);
    let spki = subject_public_key_info(public_key);
    let extensions = der::context(
        3,
        &der::sequence(&[
            basic_constraints_not_ca(),
            key_usage_digital_signature_key_encipherment(),
            ext_key_usage_server_auth(),
            subject_alt_name(&template.san),
        ]),
    );

    der::sequence(&[
        version, serial, signature_alg, issuer, validity, subject, spki,
        extensions,
    ])
}

/// Build the TBSCertificate for the self-signed root: CA:true with
/// certificate-signing key usage, no SAN.
pub fn tbs_ca_certificate(
    template: &LeafTemplate,
    public_key: &RsaPublicKey,
) -> Vec<u8> {
    let version = der::context(0, &der::small_integer(2));
    let serial = der::unsigned_integer(&template.serial);
    let signature_alg = signature_algorithm();
    let issuer = single_rdn_name(&template.issuer_cn);
    let validity = der::sequence(&[
        der::time(template.not_before),
        der::time(template.not_after),
    ]);
    let subject = single_rdn_name(&template.subject_cn);
    let spki = subject_public_key_info(public_key);
    let extensions = der::context(
        3,
        &der::sequence(&[
            basic_constraints_ca(),
            key_usage_cert_sign(),
        ]),
    );

    der::sequence(&[
        version, serial, signature_alg, issuer, validity, subject, spki,
        extensions,
    ])
}

/// Wrap a TBSCertificate and its PKCS#1 v1.5 signature into the outer
/// Certificate SEQUENCE.
pub fn assemble_certificate(tbs: &[u8], signature: &[u8]) -> Vec<u8> {
    der::sequence(&[
        tbs.to_vec(),
        signature_algorithm(),
        der::bit_string(signature),
    ])
}

fn signature_algorithm() -> Vec<u8> {
    der::sequence(&[der::oid(OID_SHA256_WITH_RSA), der::null()])
}

fn single_rdn_name(cn: &str) -> Vec<u8> {
    der::sequence(&[der::set(&[der::sequence(&[
        der::oid(OID_COMMON_NAME),
        der::utf8_string(cn),
    ])])])
}

fn subject_public_key_info(key: &RsaPublicKey) -> Vec<u8> {
    let rsa_public_key = der::sequence(&[
        der::unsigned_integer(&key.n().to_bytes_be()),
        der::unsigned_integer(&key.e().to_bytes_be()),
    ]);
    der::sequence(&[
        der::sequence(&[der::oid(OID_RSA_ENCRYPTION), der::null()]),
        der::bit_string(&rsa_public_key),
    ])
}

fn extension(oid: &str, critical: bool, inner: Vec<u8>) -> Vec<u8> {
    let mut parts = vec![der::oid(oid)];
    if critical {
        parts.push(der::tlv(0x01, &[0xFF]));
    }
    parts.push(der::octet_string(&inner));
    der::sequence(&parts)
}

fn basic_constraints_not_ca() -> Vec<u8> {
    // CA defaults to FALSE, so the constraint sequence is empty.
    extension(OID_BASIC_CONSTRAINTS, true, der::sequence(&[]))
}

fn basic_constraints_ca() -> Vec<u8> {
    extension(
        OID_BASIC_CONSTRAINTS,
        true,
        der::sequence(&[der::tlv(0x01, &[0xFF])]),
    )
}

fn key_usage_cert_sign() -> Vec<u8> {
    // Bits 5 (keyCertSign) and 6 (cRLSign): 0x06 with one unused bit.
    extension(
        OID_KEY_USAGE,
        true,
        der::tlv(der::TAG_BIT_STRING, &[0x01, 0x06]),
    )
}

fn key_usage_digital_signature_key_encipherment() -> Vec<u8> {
    // Bits 0 (digitalSignature) and 2 (keyEncipherment): 0xA0 with five
    // trailing unused bits.
    extension(
        OID_KEY_USAGE,
        true,
        der::tlv(der::TAG_BIT_STRING, &[0x05, 0xA0]),
    )
}

fn ext_key_usage_server_auth() -> Vec<u8> {
    extension(
        OID_EXT_KEY_USAGE,
        false,
        der::sequence(&[der::oid(OID_SERVER_AUTH)]),
    )
}

fn subject_alt_name(entries: &[SanEntry]) -> Vec<u8> {
    let names: Vec<Vec<u8>> = entries
        .iter()
        .map(|entry| match entry {
            SanEntry::Dns(host) => {
                der::context_primitive(2, host.as_bytes())
            }
            SanEntry::Ip(IpAddr::V4(ip)) => {
                der::context_primitive(7, &ip.octets())
            }
            SanEntry::Ip(IpAddr::V6(ip)) => {
                der::context_primitive(7, &ip.octets())
            }
        })
        .collect();
    extension(OID_SUBJECT_ALT_NAME, false, der::sequence(&names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::der::read_tlv;
    use chrono::TimeZone;
    use rsa::BigUint;

    fn test_key() -> RsaPublicKey {
        // A fixed small key keeps the structural tests fast; real issuance
        // uses 2048-bit keys from the authority.
        RsaPublicKey::new(
            BigUint::from_bytes_be(&[
                0xC3, 0x51, 0x77, 0x21, 0x0B, 0x5D, 0x39, 0xC1, 0xA1, 0x55,
                0x0C, 0x1A, 0x8C, 0x1F, 0x6F, 0x2F, 0x9A, 0x9E, 0x51, 0x63,
                0xA7, 0x11, 0x8D, 0x31, 0xF1, 0x0D, 0x73, 0x19, 0x0F, 0x2D,
                0xB3, 0x8B,
            ]),
            BigUint::from(65537u32),
        )
        .expect("valid modulus")
    }

    fn template() -> LeafTemplate {
        LeafTemplate {
            serial: [0xAB; 16],
            issuer_cn: "Iris Root CA".into(),
            subject_cn: "example.com".into(),
            not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap(),
            san: vec![
                SanEntry::Dns("example.com".into()),
                SanEntry::Ip("192.0.2.7".parse().unwrap()),
            ],
        }
    }

    #[test]
    fn tbs_is_well_formed_der() {
        let tbs = tbs_certificate(&template(), &test_key());
        let outer = read_tlv(&tbs).unwrap();
        assert_eq!(outer.tag, der::TAG_SEQUENCE);
        assert_eq!(outer.encoded_len, tbs.len());

        // First child is the [0] EXPLICIT version holding INTEGER 2.
        let version = read_tlv(outer.content).unwrap();
        assert_eq!(version.tag, 0xA0);
        let v = read_tlv(version.content).unwrap();
        assert_eq!(v.content, &[2]);

        // Second child is the 16-byte serial, padded if the high bit is set.
        let serial =
            read_tlv(&outer.content[version.encoded_len..]).unwrap();
        assert_eq!(serial.tag, der::TAG_INTEGER);
        assert_eq!(serial.content.len(), 17);
        assert_eq!(serial.content[0], 0);
    }

    #[test]
    fn assembled_certificate_nests_tbs_unchanged() {
        let tbs = tbs_certificate(&template(), &test_key());
        let cert = assemble_certificate(&tbs, &[0x42; 64]);
        let outer = read_tlv(&cert).unwrap();
        assert_eq!(outer.tag, der::TAG_SEQUENCE);
        let inner_tbs = read_tlv(outer.content).unwrap();
        assert_eq!(&outer.content[..inner_tbs.encoded_len], &tbs[..]);
    }

    #[test]
    fn san_encodes_dns_and_ip_forms() {
        let tbs = tbs_certificate(&template(), &test_key());
        // The DNS SAN appears as [2] IA5-ish bytes, the IP as [7] octets.
        let dns_needle = {
            let mut v = vec![0x82, 0x0B];
            v.extend_from_slice(b"example.com");
            v
        };
        let ip_needle = vec![0x87, 0x04, 192, 0, 2, 7];
        assert!(
            tbs.windows(dns_needle.len()).any(|w| w == dns_needle),
            "dns SAN missing"
        );
        assert!(
            tbs.windows(ip_needle.len()).any(|w| w == ip_needle),
            "ip SAN missing"
        );
    }
}
