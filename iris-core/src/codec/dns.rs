//! DNS wire-format (RFC 1035) parsing and encoding.
//!
//! Every advance through the input is cursor-guarded; parsing never reads
//! past the declared buffer length. Compression pointers must point
//! strictly backwards, which rules out pointer loops without a visited set.

use super::CodecError;

/// Largest message accepted over TCP (the 2-byte prefix ceiling).
pub const MAX_TCP_MESSAGE: usize = 65_535;
/// Largest UDP response forwarded back to a client.
pub const MAX_UDP_RESPONSE: usize = 4096;
/// Wire header size.
pub const HEADER_LEN: usize = 12;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;

const FLAG_RESPONSE: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// Human-readable rdata for the record types the UI cares about;
    /// hex for the rest.
    pub fn rdata_display(&self) -> String {
        match (self.rtype, self.rdata.len()) {
            (1, 4) => {
                format!(
                    "{}.{}.{}.{}",
                    self.rdata[0], self.rdata[1], self.rdata[2], self.rdata[3]
                )
            }
            (28, 16) => {
                let mut segments = [0u16; 8];
                for (i, chunk) in self.rdata.chunks_exact(2).enumerate() {
                    segments[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
                }
                std::net::Ipv6Addr::from(segments).to_string()
            }
            _ => self
                .rdata
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// Build a SERVFAIL answer for a failed upstream exchange. Constructed
    /// from the transaction id alone with zeroed counts, never from the raw
    /// query bytes.
    pub fn servfail(txid: u16) -> Self {
        Self {
            id: txid,
            flags: FLAG_RESPONSE | u16::from(RCODE_SERVFAIL),
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or_else(|| {
            CodecError::malformed("dns message", "length overflow")
        })?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated("dns message"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse a full wire-format message.
pub fn parse(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::malformed(
            "dns message",
            format!("{} bytes is below the 12-byte header", buf.len()),
        ));
    }

    let mut r = Reader::new(buf);
    let id = r.u16()?;
    let flags = r.u16()?;
    let qdcount = r.u16()?;
    let ancount = r.u16()?;
    let nscount = r.u16()?;
    let arcount = r.u16()?;

    let mut questions = Vec::with_capacity(qdcount.min(32) as usize);
    for _ in 0..qdcount {
        let name = parse_name(buf, &mut r)?;
        questions.push(Question {
            name,
            qtype: r.u16()?,
            qclass: r.u16()?,
        });
    }

    let mut sections = [
        (ancount, Vec::with_capacity(ancount.min(32) as usize)),
        (nscount, Vec::new()),
        (arcount, Vec::new()),
    ];
    for (count, records) in &mut sections {
        for _ in 0..*count {
            let name = parse_name(buf, &mut r)?;
            let rtype = r.u16()?;
            let rclass = r.u16()?;
            let ttl = r.u32()?;
            let rdlength = r.u16()? as usize;
            let rdata = r.take(rdlength)?.to_vec();
            records.push(Record {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            });
        }
    }
    let [(_, answers), (_, authorities), (_, additionals)] = sections;

    Ok(Message {
        id,
        flags,
        questions,
        answers,
        authorities,
        additionals,
    })
}

/// Decode a possibly-compressed name starting at the reader's position.
/// A label byte with the top two bits set is a 14-bit pointer; it must
/// refer strictly backwards into the message.
fn parse_name(buf: &[u8], r: &mut Reader<'_>) -> Result<String, CodecError> {
    let mut name = String::new();
    let mut jumped = false;
    // Position the reader resumes from after the first pointer jump.
    let mut resume = 0usize;
    let mut cursor = r.pos;

    loop {
        let b0 = *buf.get(cursor).ok_or(CodecError::Truncated("dns name"))?;
        if b0 & 0xC0 == 0xC0 {
            let b1 = *buf
                .get(cursor + 1)
                .ok_or(CodecError::Truncated("dns name"))?;
            let target =
                ((usize::from(b0) & 0x3F) << 8) | usize::from(b1);
            if target >= cursor {
                return Err(CodecError::malformed(
                    "dns name",
                    "compression pointer does not point backwards",
                ));
            }
            if !jumped {
                resume = cursor + 2;
                jumped = true;
            }
            cursor = target;
            continue;
        }
        if b0 & 0xC0 != 0 {
            return Err(CodecError::malformed(
                "dns name",
                format!("reserved label type {:#04x}", b0 & 0xC0),
            ));
        }

        let len = usize::from(b0);
        cursor += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return Err(CodecError::malformed(
                "dns name",
                format!("label length {len} exceeds 63"),
            ));
        }
        let end = cursor
            .checked_add(len)
            .ok_or_else(|| CodecError::malformed("dns name", "overflow"))?;
        if end > buf.len() {
            return Err(CodecError::Truncated("dns name"));
        }
        if !name.is_empty() {
            name.push('.');
        }
        for &c in &buf[cursor..end] {
            // Wire labels are arbitrary bytes; display form escapes the
            // non-printable ones.
            if c.is_ascii_graphic() && c != b'.' {
                name.push(c as char);
            } else {
                name.push_str(&format!("\\{c:03}"));
            }
        }
        if name.len() > MAX_NAME_LEN + MAX_NAME_LEN {
            return Err(CodecError::malformed(
                "dns name",
                "name exceeds 255 octets",
            ));
        }
        cursor = end;
    }

    r.pos = if jumped { resume } else { cursor };
    Ok(name)
}

/// Encode a message. Names are written uncompressed, so parse(encode(m))
/// round-trips structurally.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    out.extend_from_slice(&message.id.to_be_bytes());
    out.extend_from_slice(&message.flags.to_be_bytes());
    for count in [
        message.questions.len(),
        message.answers.len(),
        message.authorities.len(),
        message.additionals.len(),
    ] {
        let count = u16::try_from(count).map_err(|_| {
            CodecError::malformed("dns message", "section count exceeds u16")
        })?;
        out.extend_from_slice(&count.to_be_bytes());
    }

    for q in &message.questions {
        encode_name(&q.name, &mut out)?;
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
    for record in message
        .answers
        .iter()
        .chain(&message.authorities)
        .chain(&message.additionals)
    {
        encode_name(&record.name, &mut out)?;
        out.extend_from_slice(&record.rtype.to_be_bytes());
        out.extend_from_slice(&record.rclass.to_be_bytes());
        out.extend_from_slice(&record.ttl.to_be_bytes());
        let rdlength = u16::try_from(record.rdata.len()).map_err(|_| {
            CodecError::malformed("dns message", "rdata exceeds u16")
        })?;
        out.extend_from_slice(&rdlength.to_be_bytes());
        out.extend_from_slice(&record.rdata);
    }
    Ok(out)
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if !name.is_empty() {
        for label in name.split('.') {
            let bytes = label.as_bytes();
            if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
                return Err(CodecError::malformed(
                    "dns name",
                    format!("label {label:?} not encodable"),
                ));
            }
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
    }
    out.push(0);
    Ok(())
}

/// Build a minimal query for `name`/`qtype` with recursion desired.
pub fn encode_query(
    txid: u16,
    name: &str,
    qtype: u16,
) -> Result<Vec<u8>, CodecError> {
    encode(&Message {
        id: txid,
        flags: 0x0100,
        questions: vec![Question {
            name: name.to_string(),
            qtype,
            qclass: 1,
        }],
        answers: Vec::new(),
        authorities: Vec::new(),
        additionals: Vec::new(),
    })
}

/// One step of TCP stream framing: if `buf` holds a complete
/// length-prefixed message, return `(message_bytes, consumed)`.
/// A zero-length prefix is a protocol violation.
pub fn take_tcp_frame(
    buf: &[u8],
) -> Result<Option<(&[u8], usize)>, CodecError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let declared = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    if declared == 0 {
        return Err(CodecError::malformed(
            "dns tcp frame",
            "zero-length message",
        ));
    }
    if buf.len() < 2 + declared {
        return Ok(None);
    }
    Ok(Some((&buf[2..2 + declared], 2 + declared)))
}

/// Prefix an encoded message with its 2-byte length for TCP transport.
pub fn tcp_frame(message: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u16::try_from(message.len()).map_err(|_| {
        CodecError::TooLarge {
            context: "dns tcp frame",
            size: message.len() as u64,
            budget: MAX_TCP_MESSAGE as u64,
        }
    })?;
    let mut out = Vec::with_capacity(2 + message.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(message);
    Ok(out)
}
