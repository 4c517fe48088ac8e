//! Incremental HTTP/1.1 message parsing.
//!
//! One `MessageParser` per direction of a flow. Bytes are pushed as they
//! arrive; `poll_message` makes as much progress as the buffer allows and
//! yields a `CompleteMessage` when head and body are fully framed. After a
//! yield the parser is reset with any unconsumed bytes retained, so
//! pipelined messages parse back to back.
//!
//! Framing resolution order: chunked transfer-encoding wins and forbids a
//! Content-Length in the same message (request smuggling); a single agreed
//! Content-Length gives fixed framing; bodyless statuses/methods give none;
//! responses otherwise read until close.

use iris_model::http::Header;

use super::CodecError;

/// Header block cap. A head that grows past this without terminating is
/// rejected rather than buffered further.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const NO_BODY_METHODS: &[&str] =
    &["GET", "HEAD", "DELETE", "OPTIONS", "TRACE", "CONNECT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub head_cap: usize,
    /// Per-message total body cap; a declared or accumulated size past this
    /// aborts the exchange before the body is buffered.
    pub body_cap: u64,
    pub preview: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            head_cap: MAX_HEAD_BYTES,
            body_cap: 100 * 1024 * 1024,
            preview: 8192,
        }
    }
}

/// Parsed request-line or status-line plus headers.
#[derive(Debug, Clone, Default)]
pub struct ParsedHead {
    pub method: String,
    pub target: String,
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<Header>,
}

impl ParsedHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    fn headers_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| h.is(name))
            .map(|h| h.value.as_str())
    }
}

/// A fully framed message: head, bounded body preview, true body size.
#[derive(Debug, Clone)]
pub struct CompleteMessage {
    pub head: ParsedHead,
    pub body_preview: Vec<u8>,
    pub body_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailer,
    UntilClose,
}

#[derive(Debug)]
pub struct MessageParser {
    role: Role,
    limits: ParserLimits,
    buf: Vec<u8>,
    state: State,
    head: Option<ParsedHead>,
    preview: Vec<u8>,
    body_size: u64,
    /// Responses to HEAD (and CONNECT) carry no body regardless of headers;
    /// the pipeline sets this from the paired request.
    no_body_response: bool,
}

impl MessageParser {
    pub fn request(limits: ParserLimits) -> Self {
        Self::new(Role::Request, limits)
    }

    pub fn response(limits: ParserLimits) -> Self {
        Self::new(Role::Response, limits)
    }

    fn new(role: Role, limits: ParserLimits) -> Self {
        Self {
            role,
            limits,
            buf: Vec::new(),
            state: State::Head,
            head: None,
            preview: Vec::new(),
            body_size: 0,
            no_body_response: false,
        }
    }

    pub fn set_no_body_response(&mut self, no_body: bool) {
        self.no_body_response = no_body;
    }

    /// Bytes buffered but not yet consumed by a completed message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take every unconsumed byte out of the parser, resetting it to the
    /// head state. Used when a flow changes protocol mid-stream (CONNECT
    /// upgrade): the retained bytes belong to the tunneled protocol.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.state = State::Head;
        self.head = None;
        self.preview.clear();
        self.body_size = 0;
        std::mem::take(&mut self.buf)
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drive the parser over the buffered bytes. Returns a message when one
    /// completes; `None` means more input is needed.
    pub fn poll_message(
        &mut self,
    ) -> Result<Option<CompleteMessage>, CodecError> {
        loop {
            match self.state {
                State::Head => {
                    let Some(head_len) = self.find_head_end()? else {
                        return Ok(None);
                    };
                    let head_bytes: Vec<u8> =
                        self.buf.drain(..head_len).collect();
                    let head = parse_head(self.role, &head_bytes)?;
                    self.state = self.resolve_framing(&head)?;
                    self.head = Some(head);
                }
                State::Fixed { remaining } => {
                    if remaining == 0 {
                        return Ok(Some(self.take_message()));
                    }
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    self.state = State::Fixed {
                        remaining: remaining - take as u64,
                    };
                    self.consume_body(take);
                    if remaining == take as u64 {
                        return Ok(Some(self.take_message()));
                    }
                    return Ok(None);
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.check_body_budget(size)?;
                    if size == 0 {
                        self.state = State::Trailer;
                    } else {
                        self.state = State::ChunkData { remaining: size };
                    }
                }
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    self.consume_body(take);
                    if remaining == take as u64 {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData {
                            remaining: remaining - take as u64,
                        };
                        return Ok(None);
                    }
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(CodecError::malformed(
                            "chunked body",
                            "chunk data not terminated by CRLF",
                        ));
                    }
                    self.buf.drain(..2);
                    self.state = State::ChunkSize;
                }
                State::Trailer => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        return Ok(Some(self.take_message()));
                    }
                    // Trailer fields are framing only; not captured.
                }
                State::UntilClose => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = self.buf.len();
                    self.consume_body(take);
                    return Ok(None);
                }
            }
        }
    }

    /// Signal end of stream. An until-close body completes; an idle parser
    /// reports nothing; anything mid-message is a truncated peer close.
    pub fn finish(&mut self) -> Result<Option<CompleteMessage>, CodecError> {
        match self.state {
            State::UntilClose => Ok(Some(self.take_message())),
            State::Head if self.buf.is_empty() && self.head.is_none() => {
                Ok(None)
            }
            State::Fixed { remaining: 0 } => Ok(Some(self.take_message())),
            _ => Err(CodecError::Truncated("http message")),
        }
    }

    fn find_head_end(&mut self) -> Result<Option<usize>, CodecError> {
        if let Some(pos) =
            self.buf.windows(4).position(|w| w == b"\r\n\r\n")
        {
            let head_len = pos + 4;
            if head_len > self.limits.head_cap {
                return Err(CodecError::malformed(
                    "http head",
                    "header block exceeds cap",
                ));
            }
            return Ok(Some(head_len));
        }
        if self.buf.len() > self.limits.head_cap {
            return Err(CodecError::malformed(
                "http head",
                "header block exceeds cap without terminating",
            ));
        }
        Ok(None)
    }

    /// Pull one CRLF-terminated line off the buffer, excluding the CRLF.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line: Vec<u8> = self.buf.drain(..pos).collect();
                self.buf.drain(..2);
                Ok(Some(line))
            }
            None if self.buf.len() > self.limits.head_cap => {
                Err(CodecError::malformed(
                    "chunked body",
                    "chunk size line exceeds cap",
                ))
            }
            None => Ok(None),
        }
    }

    fn consume_body(&mut self, n: usize) {
        let room = self.limits.preview.saturating_sub(self.preview.len());
        if room > 0 {
            let take = room.min(n);
            self.preview.extend_from_slice(&self.buf[..take]);
        }
        self.body_size += n as u64;
        self.buf.drain(..n);
    }

    fn check_body_budget(&self, incoming: u64) -> Result<(), CodecError> {
        let projected = self.body_size.saturating_add(incoming);
        if projected > self.limits.body_cap {
            return Err(CodecError::TooLarge {
                context: "http body",
                size: projected,
                budget: self.limits.body_cap,
            });
        }
        Ok(())
    }

    fn resolve_framing(&self, head: &ParsedHead) -> Result<State, CodecError> {
        let chunked = head
            .headers_named("transfer-encoding")
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
        let content_lengths: Vec<&str> =
            head.headers_named("content-length").collect();

        if chunked {
            // Transfer-Encoding together with Content-Length is the classic
            // smuggling vector; the message is rejected outright.
            if !content_lengths.is_empty() {
                return Err(CodecError::malformed(
                    "http framing",
                    "both Transfer-Encoding and Content-Length present",
                ));
            }
            return Ok(State::ChunkSize);
        }

        if !content_lengths.is_empty() {
            let mut agreed: Option<u64> = None;
            for raw in &content_lengths {
                let value: u64 = raw.trim().parse().map_err(|_| {
                    CodecError::malformed(
                        "http framing",
                        format!("invalid Content-Length {raw:?}"),
                    )
                })?;
                match agreed {
                    Some(prev) if prev != value => {
                        return Err(CodecError::malformed(
                            "http framing",
                            "conflicting Content-Length values",
                        ));
                    }
                    _ => agreed = Some(value),
                }
            }
            let length = agreed.unwrap_or(0);
            if length > self.limits.body_cap {
                return Err(CodecError::TooLarge {
                    context: "http body",
                    size: length,
                    budget: self.limits.body_cap,
                });
            }
            return Ok(State::Fixed { remaining: length });
        }

        match self.role {
            Role::Request => {
                if NO_BODY_METHODS.contains(&head.method.as_str()) {
                    Ok(State::Fixed { remaining: 0 })
                } else {
                    // A request body must be delimited; absent framing
                    // means no body.
                    Ok(State::Fixed { remaining: 0 })
                }
            }
            Role::Response => {
                let bodyless = self.no_body_response
                    || (100..200).contains(&head.status)
                    || head.status == 204
                    || head.status == 304;
                if bodyless {
                    Ok(State::Fixed { remaining: 0 })
                } else {
                    Ok(State::UntilClose)
                }
            }
        }
    }

    fn take_message(&mut self) -> CompleteMessage {
        let message = CompleteMessage {
            head: self.head.take().unwrap_or_default(),
            body_preview: std::mem::take(&mut self.preview),
            body_size: self.body_size,
        };
        self.body_size = 0;
        self.state = State::Head;
        message
    }
}

fn parse_head(role: Role, bytes: &[u8]) -> Result<ParsedHead, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| {
        CodecError::malformed("http head", "head is not valid UTF-8")
    })?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next().ok_or_else(|| {
        CodecError::malformed("http head", "missing start line")
    })?;

    let mut head = match role {
        Role::Request => parse_request_line(start_line)?,
        Role::Response => parse_status_line(start_line)?,
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(CodecError::malformed(
                "http head",
                "obsolete line folding",
            ));
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            CodecError::malformed(
                "http head",
                format!("header line without colon: {line:?}"),
            )
        })?;
        if name.is_empty() || name.contains(' ') {
            return Err(CodecError::malformed(
                "http head",
                format!("invalid header name: {name:?}"),
            ));
        }
        head.headers.push(Header::new(name, value.trim()));
    }

    Ok(head)
}

fn parse_request_line(line: &str) -> Result<ParsedHead, CodecError> {
    let mut parts = line.split(' ');
    let (method, target, version) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => {
                return Err(CodecError::malformed(
                    "http head",
                    format!("invalid request line: {line:?}"),
                ));
            }
        };
    if method.is_empty()
        || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'-')
    {
        return Err(CodecError::malformed(
            "http head",
            format!("invalid method: {method:?}"),
        ));
    }
    validate_version(version)?;
    Ok(ParsedHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        ..Default::default()
    })
}

fn parse_status_line(line: &str) -> Result<ParsedHead, CodecError> {
    let mut parts = line.splitn(3, ' ');
    let (version, code) = match (parts.next(), parts.next()) {
        (Some(v), Some(c)) => (v, c),
        _ => {
            return Err(CodecError::malformed(
                "http head",
                format!("invalid status line: {line:?}"),
            ));
        }
    };
    validate_version(version)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::malformed(
            "http head",
            format!("invalid status code: {code:?}"),
        ));
    }
    Ok(ParsedHead {
        status: code.parse().expect("three ascii digits"),
        reason: parts.next().unwrap_or("").to_string(),
        version: version.to_string(),
        ..Default::default()
    })
}

fn validate_version(version: &str) -> Result<(), CodecError> {
    match version {
        "HTTP/1.0" | "HTTP/1.1" => Ok(()),
        other => Err(CodecError::malformed(
            "http head",
            format!("unsupported version: {other:?}"),
        )),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let text = std::str::from_utf8(line).map_err(|_| {
        CodecError::malformed("chunked body", "chunk size not UTF-8")
    })?;
    // Chunk extensions after ';' are framing noise.
    let digits = text.split(';').next().unwrap_or("").trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(CodecError::malformed(
            "chunked body",
            format!("invalid chunk size: {digits:?}"),
        ));
    }
    u64::from_str_radix(digits, 16).map_err(|_| {
        CodecError::malformed(
            "chunked body",
            format!("invalid chunk size: {digits:?}"),
        )
    })
}

/// Parse a CONNECT authority target into `(host, port)`. Host must be
/// ASCII; port must be numeric.
pub fn connect_target(target: &str) -> Result<(String, u16), CodecError> {
    if !target.is_ascii() {
        return Err(CodecError::malformed(
            "connect target",
            "authority is not ASCII",
        ));
    }
    let (host, port) = target.rsplit_once(':').ok_or_else(|| {
        CodecError::malformed("connect target", "missing port")
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CodecError::malformed("connect target", "empty host"));
    }
    let port: u16 = port.parse().map_err(|_| {
        CodecError::malformed(
            "connect target",
            format!("non-numeric port: {port:?}"),
        )
    })?;
    if port == 0 {
        return Err(CodecError::malformed("connect target", "port is zero"));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParserLimits {
        ParserLimits {
            head_cap: MAX_HEAD_BYTES,
            body_cap: 1024 * 1024,
            preview: 64,
        }
    }

    fn drive(parser: &mut MessageParser, bytes: &[u8]) -> Vec<CompleteMessage> {
        parser.push(bytes);
        let mut out = Vec::new();
        while let Some(msg) = parser.poll_message().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn parses_simple_request() {
        let mut parser = MessageParser::request(limits());
        let msgs = drive(
            &mut parser,
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].head.method, "GET");
        assert_eq!(msgs[0].head.target, "/");
        assert_eq!(msgs[0].head.header("host"), Some("example.com"));
        assert_eq!(msgs[0].body_size, 0);
    }

    #[test]
    fn parses_fixed_length_response() {
        let mut parser = MessageParser::response(limits());
        let msgs = drive(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].head.status, 200);
        assert_eq!(msgs[0].body_size, 5);
        assert_eq!(msgs[0].body_preview, b"hello");
    }

    #[test]
    fn fragmentation_is_equivalent_to_whole_buffer() {
        let wire: &[u8] = b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\n0123456789GET /next HTTP/1.1\r\nHost: h\r\n\r\n";

        let mut whole = MessageParser::request(limits());
        let expected = drive(&mut whole, wire);
        assert_eq!(expected.len(), 2);

        // Every split point, including mid-head and mid-body.
        for split in 1..wire.len() {
            let mut parser = MessageParser::request(limits());
            let mut got = drive(&mut parser, &wire[..split]);
            got.extend(drive(&mut parser, &wire[split..]));
            assert_eq!(got.len(), expected.len(), "split at {split}");
            for (a, b) in got.iter().zip(expected.iter()) {
                assert_eq!(a.head.method, b.head.method);
                assert_eq!(a.head.target, b.head.target);
                assert_eq!(a.body_size, b.body_size);
                assert_eq!(a.body_preview, b.body_preview);
            }
        }
    }

    #[test]
    fn chunked_body_reassembles() {
        let mut parser = MessageParser::response(limits());
        let msgs = drive(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_size, 9);
        assert_eq!(msgs[0].body_preview, b"wikipedia");
    }

    #[test]
    fn chunked_with_content_length_is_smuggling() {
        let mut parser = MessageParser::request(limits());
        parser.push(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n",
        );
        assert!(matches!(
            parser.poll_message(),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut parser = MessageParser::request(limits());
        parser.push(
            b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n",
        );
        assert!(matches!(
            parser.poll_message(),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn repeated_agreeing_content_lengths_accepted() {
        let mut parser = MessageParser::request(limits());
        let msgs = drive(
            &mut parser,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok",
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_size, 2);
    }

    #[test]
    fn content_length_over_cap_aborts_without_buffering() {
        let mut parser = MessageParser::request(ParserLimits {
            body_cap: 100,
            ..limits()
        });
        parser.push(b"POST / HTTP/1.1\r\nContent-Length: 101\r\n\r\n");
        assert!(matches!(
            parser.poll_message(),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn chunk_size_overflow_rejected() {
        let mut parser = MessageParser::response(limits());
        parser.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffff\r\n",
        );
        assert!(matches!(
            parser.poll_message(),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn bodyless_statuses_complete_at_head() {
        for head in [
            "HTTP/1.1 204 No Content",
            "HTTP/1.1 304 Not Modified",
            "HTTP/1.1 100 Continue",
        ] {
            let mut parser = MessageParser::response(limits());
            let msgs =
                drive(&mut parser, format!("{head}\r\n\r\n").as_bytes());
            assert_eq!(msgs.len(), 1, "{head}");
            assert_eq!(msgs[0].body_size, 0);
        }
    }

    #[test]
    fn head_response_honors_hint() {
        let mut parser = MessageParser::response(limits());
        parser.set_no_body_response(true);
        let msgs = drive(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n",
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body_size, 0);
    }

    #[test]
    fn until_close_body_completes_on_finish() {
        let mut parser = MessageParser::response(limits());
        parser.push(b"HTTP/1.1 200 OK\r\n\r\nstreamed body");
        assert!(parser.poll_message().unwrap().is_none());
        let msg = parser.finish().unwrap().expect("body closed by peer");
        assert_eq!(msg.body_size, 13);
    }

    #[test]
    fn truncated_fixed_body_errors_on_finish() {
        let mut parser = MessageParser::response(limits());
        parser.push(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert!(parser.poll_message().unwrap().is_none());
        assert!(matches!(
            parser.finish(),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn preview_is_bounded_but_size_is_not() {
        let mut parser = MessageParser::response(ParserLimits {
            preview: 4,
            ..limits()
        });
        let msgs = drive(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789",
        );
        assert_eq!(msgs[0].body_preview, b"0123");
        assert_eq!(msgs[0].body_size, 10);
    }

    #[test]
    fn connect_targets() {
        assert_eq!(
            connect_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            connect_target("[2001:db8::1]:8443").unwrap(),
            ("2001:db8::1".to_string(), 8443)
        );
        assert!(connect_target("example.com").is_err());
        assert!(connect_target("example.com:https").is_err());
        assert!(connect_target("example.com:0").is_err());
        assert!(connect_target("exämple.com:443").is_err());
    }

    #[test]
    fn header_case_is_preserved_for_display() {
        let mut parser = MessageParser::request(limits());
        let msgs = drive(
            &mut parser,
            b"GET / HTTP/1.1\r\nX-CuStOm-HeAdEr: v\r\n\r\n",
        );
        assert_eq!(msgs[0].head.headers[0].name, "X-CuStOm-HeAdEr");
        assert_eq!(msgs[0].head.header("x-custom-header"), Some("v"));
    }
}
