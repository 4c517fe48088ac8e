//! Minimal ASN.1 DER encoding, sufficient for the X.509 v3 leaves the
//! certificate authority emits, plus the small reader the tests use to
//! check length consistency.

use super::CodecError;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Emit a definite-length TLV.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    push_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    let significant = &bytes[first..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

pub fn sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

pub fn set(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SET, &parts.concat())
}

/// Context-specific constructed tag [n], EXPLICIT.
pub fn context(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xA0 | n, content)
}

/// Context-specific primitive tag [n], IMPLICIT.
pub fn context_primitive(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0x80 | n, content)
}

/// INTEGER from unsigned big-endian magnitude. A leading pad byte keeps
/// high-bit values positive; an empty magnitude encodes zero.
pub fn unsigned_integer(magnitude: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let first = magnitude.iter().position(|&b| b != 0);
        match first {
            Some(i) => &magnitude[i..],
            None => &[],
        }
    };
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.is_empty() {
        content.push(0);
    } else {
        if trimmed[0] & 0x80 != 0 {
            content.push(0);
        }
        content.extend_from_slice(trimmed);
    }
    tlv(TAG_INTEGER, &content)
}

pub fn small_integer(value: i64) -> Vec<u8> {
    // Values the certificate profile needs are tiny and non-negative.
    debug_assert!((0..=127).contains(&value));
    tlv(TAG_INTEGER, &[value as u8])
}

/// BIT STRING with no unused bits.
pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(bytes.len() + 1);
    content.push(0);
    content.extend_from_slice(bytes);
    tlv(TAG_BIT_STRING, &content)
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, bytes)
}

pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

pub fn utf8_string(s: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, s.as_bytes())
}

pub fn printable_string(s: &str) -> Vec<u8> {
    tlv(TAG_PRINTABLE_STRING, s.as_bytes())
}

pub fn ia5_string(s: &str) -> Vec<u8> {
    tlv(TAG_IA5_STRING, s.as_bytes())
}

/// Encode a dotted OID.
pub fn oid(dotted: &str) -> Vec<u8> {
    let arcs: Vec<u64> = dotted
        .split('.')
        .map(|a| a.parse().expect("oid arcs are compile-time constants"))
        .collect();
    debug_assert!(arcs.len() >= 2);
    let mut content = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        content.extend_from_slice(&base128(arc));
    }
    tlv(TAG_OID, &content)
}

fn base128(mut value: u64) -> Vec<u8> {
    let mut rev = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        rev.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    rev.reverse();
    rev
}

/// Time encoding follows the X.509 rule: UTCTime through 2049,
/// GeneralizedTime from 2050.
pub fn time(t: chrono::DateTime<chrono::Utc>) -> Vec<u8> {
    use chrono::Datelike;
    if t.year() < 2050 {
        tlv(
            TAG_UTC_TIME,
            t.format("%y%m%d%H%M%SZ").to_string().as_bytes(),
        )
    } else {
        tlv(
            TAG_GENERALIZED_TIME,
            t.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
        )
    }
}

/// A parsed TLV view over a DER buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    /// Total encoded length including tag and length bytes.
    pub encoded_len: usize,
}

/// Read one TLV from the front of `buf`, rejecting inconsistent length
/// bytes (indefinite lengths, non-minimal forms, lengths past the buffer).
pub fn read_tlv(buf: &[u8]) -> Result<Tlv<'_>, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated("der tlv"));
    }
    let tag = buf[0];
    let first = buf[1];
    let (len, header) = if first < 0x80 {
        (usize::from(first), 2)
    } else if first == 0x80 {
        return Err(CodecError::malformed(
            "der tlv",
            "indefinite length is not DER",
        ));
    } else {
        let n = usize::from(first & 0x7F);
        if n > 8 || buf.len() < 2 + n {
            return Err(CodecError::malformed(
                "der tlv",
                "length bytes inconsistent",
            ));
        }
        let mut len = 0usize;
        for &b in &buf[2..2 + n] {
            len = len
                .checked_mul(256)
                .and_then(|l| l.checked_add(usize::from(b)))
                .ok_or_else(|| {
                    CodecError::malformed("der tlv", "length overflow")
                })?;
        }
        if len < 0x80 {
            return Err(CodecError::malformed(
                "der tlv",
                "non-minimal length encoding",
            ));
        }
        (len, 2 + n)
    };
    let end = header
        .checked_add(len)
        .ok_or_else(|| CodecError::malformed("der tlv", "length overflow"))?;
    if end > buf.len() {
        return Err(CodecError::malformed(
            "der tlv",
            "declared length exceeds buffer",
        ));
    }
    Ok(Tlv {
        tag,
        content: &buf[header..end],
        encoded_len: end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn short_and_long_lengths() {
        let short = octet_string(&[0u8; 10]);
        assert_eq!(short[1], 10);

        let long = octet_string(&vec![0u8; 300]);
        assert_eq!(long[1], 0x82);
        assert_eq!(((long[2] as usize) << 8) | long[3] as usize, 300);
    }

    #[test]
    fn integer_padding() {
        // High bit set requires a leading zero to stay positive.
        assert_eq!(unsigned_integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(unsigned_integer(&[0x7F]), vec![0x02, 0x01, 0x7F]);
        // Leading zeros trim; zero itself survives.
        assert_eq!(unsigned_integer(&[0x00, 0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(unsigned_integer(&[0x00]), vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn known_oid_encoding() {
        // sha256WithRSAEncryption
        assert_eq!(
            oid("1.2.840.113549.1.1.11"),
            vec![
                0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01,
                0x0B
            ]
        );
    }

    #[test]
    fn utc_time_before_2050_generalized_after() {
        let before = chrono::Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(time(before)[0], TAG_UTC_TIME);

        let after = chrono::Utc.with_ymd_and_hms(2051, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(time(after)[0], TAG_GENERALIZED_TIME);
    }

    #[test]
    fn tlv_reader_round_trip() {
        let encoded = sequence(&[small_integer(7), null()]);
        let tlv = read_tlv(&encoded).unwrap();
        assert_eq!(tlv.tag, TAG_SEQUENCE);
        assert_eq!(tlv.encoded_len, encoded.len());

        let inner = read_tlv(tlv.content).unwrap();
        assert_eq!(inner.tag, TAG_INTEGER);
        assert_eq!(inner.content, &[7]);
    }

    #[test]
    fn tlv_reader_rejects_inconsistent_lengths() {
        // Declared longer than buffer.
        assert!(matches!(
            read_tlv(&[0x30, 0x05, 0x00]),
            Err(CodecError::Malformed { .. })
        ));
        // Indefinite length.
        assert!(matches!(
            read_tlv(&[0x30, 0x80, 0x00, 0x00]),
            Err(CodecError::Malformed { .. })
        ));
        // Non-minimal long form.
        assert!(matches!(
            read_tlv(&[0x04, 0x81, 0x05, 1, 2, 3, 4, 5]),
            Err(CodecError::Malformed { .. })
        ));
    }
}
