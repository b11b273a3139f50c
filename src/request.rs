//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are appended to an internal buffer and the state machine advances
//! as far as the buffered data allows. Anything left after a request
//! completes stays buffered for the next pipelined request.

use crate::error::{
    HttpError, BAD_REQUEST, HTTP_VERSION_NOT_SUPPORTED, LENGTH_REQUIRED, NOT_IMPLEMENTED,
    PAYLOAD_TOO_LARGE, REQUEST_HEADER_FIELDS_TOO_LARGE, URI_TOO_LONG,
};
use crate::headers::{self, HeaderMap};
use crate::uri::{self, Uri};

pub const MAX_HEADER_VALUE_SIZE: usize = 8192;
pub const MAX_HEADERS: usize = 100;
/// Cap applied before a virtual host (and its location) is known.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Recognize a standard method token (already upper-cased). Unknown
    /// tokens are a 501 at the request line.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// The subset this server actually executes.
    pub fn is_implemented(self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Delete)
    }

    fn expects_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitHeaders,
    AwaitBody,
    AwaitChunkSize,
    AwaitChunkData,
    AwaitTrailers,
    Complete,
}

/// Evolving parse state of one request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// CGI routing results, filled in by the handler.
    pub script_name: String,
    pub path_info: String,

    state: ParseState,
    buf: Vec<u8>,
    chunked: bool,
    chunk_remaining: usize,
    content_length: usize,
    max_body_size: usize,
    header_count: usize,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            uri: Uri::default(),
            version: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            script_name: String::new(),
            path_info: String::new(),
            state: ParseState::AwaitHeaders,
            buf: Vec::new(),
            chunked: false,
            chunk_remaining: 0,
            content_length: 0,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            header_count: 0,
        }
    }

    /// Reset for the next pipelined request, keeping any buffered bytes
    /// and the configured body cap.
    pub fn reset(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let max_body_size = self.max_body_size;
        *self = Request::new();
        self.buf = buf;
        self.max_body_size = max_body_size;
    }

    pub fn set_max_body_size(&mut self, limit: usize) {
        self.max_body_size = limit;
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        headers::get(&self.headers, name)
    }

    /// Keep-alive decision: HTTP/1.1 defaults to keep-alive unless the
    /// client said `close`; HTTP/1.0 defaults to close unless the client
    /// said `keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self
            .header(headers::CONNECTION)
            .map(|v| v.to_ascii_lowercase());
        match self.version.as_str() {
            "HTTP/1.0" => connection.as_deref() == Some("keep-alive"),
            _ => connection.as_deref() != Some("close"),
        }
    }

    /// Append raw bytes without advancing the parser. Used while a
    /// response is still draining, so pipelined requests stay sequential.
    pub fn buffer_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append bytes and advance the state machine as far as possible.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.buf.extend_from_slice(data);
        self.advance()
    }

    /// Drive buffered bytes through the state machine (used after a
    /// keep-alive reset when pipelined data is already waiting).
    pub fn advance(&mut self) -> Result<(), HttpError> {
        loop {
            let before = self.state;
            match self.state {
                ParseState::AwaitHeaders => self.try_parse_headers()?,
                ParseState::AwaitBody => self.take_body_bytes(),
                ParseState::AwaitChunkSize => self.try_parse_chunk_size()?,
                ParseState::AwaitChunkData => self.try_take_chunk_data()?,
                ParseState::AwaitTrailers => self.try_parse_trailers()?,
                ParseState::Complete => return Ok(()),
            }
            if self.state == before && self.state != ParseState::Complete {
                // No progress; wait for more data.
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Headers

    fn try_parse_headers(&mut self) -> Result<(), HttpError> {
        let header_end = match find(b"\r\n\r\n", &self.buf) {
            Some(i) => i,
            None => return Ok(()),
        };
        let header_block = self.buf[..header_end].to_vec();
        self.buf.drain(..header_end + 4);

        let text = std::str::from_utf8(&header_block)
            .map_err(|_| HttpError::new(BAD_REQUEST, "header block is not valid ASCII"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| HttpError::new(BAD_REQUEST, "missing request line"))?;
        self.parse_request_line(request_line)?;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            self.parse_header_line(line)?;
        }
        // An absolute-form target overrides any Host field the client sent.
        if let Some(host) = self.uri.authority_host_header() {
            headers::add(&mut self.headers, headers::HOST, &host);
        }
        self.validate_headers()?;
        self.decide_body_state()
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpError> {
        let mut tokens = line.split_whitespace();
        let method_token = tokens
            .next()
            .ok_or_else(|| HttpError::new(BAD_REQUEST, "malformed request line"))?;
        let target = tokens
            .next()
            .ok_or_else(|| HttpError::new(BAD_REQUEST, "malformed request line"))?;
        let version = tokens
            .next()
            .ok_or_else(|| HttpError::new(BAD_REQUEST, "malformed request line"))?;
        if tokens.next().is_some() {
            return Err(HttpError::new(BAD_REQUEST, "extra tokens in request line"));
        }

        self.method = Method::from_token(&method_token.to_ascii_uppercase()).ok_or_else(|| {
            HttpError::new(NOT_IMPLEMENTED, format!("method not recognized: {}", method_token))
        })?;

        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(HttpError::from_status(HTTP_VERSION_NOT_SUPPORTED));
        }
        self.version = version.to_string();

        if !uri::validate_size(target) {
            return Err(HttpError::new(URI_TOO_LONG, "request target too long"));
        }
        if !uri::validate(target) {
            return Err(HttpError::new(BAD_REQUEST, "invalid request target"));
        }
        self.uri = Uri::parse(target);
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), HttpError> {
        // RFC 7230 section 3.2.4: obs-fold is deprecated and rejected.
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(HttpError::new(BAD_REQUEST, "obsolete line folding"));
        }
        let colon = line
            .find(':')
            .ok_or_else(|| HttpError::new(BAD_REQUEST, "header line without colon"))?;
        let name = &line[..colon];
        if name.is_empty() {
            return Err(HttpError::new(BAD_REQUEST, "empty header name"));
        }
        if name.ends_with(' ') || name.ends_with('\t') {
            return Err(HttpError::new(BAD_REQUEST, "whitespace before colon"));
        }
        if name.bytes().any(|c| !headers::is_token_char(c)) {
            return Err(HttpError::new(BAD_REQUEST, "invalid character in header name"));
        }

        let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
        if value.len() > MAX_HEADER_VALUE_SIZE {
            return Err(HttpError::new(
                REQUEST_HEADER_FIELDS_TOO_LARGE,
                "header value too large",
            ));
        }
        for c in value.bytes() {
            if (c < 0x20 && c != 0x09) || c == 0x7f {
                return Err(HttpError::new(BAD_REQUEST, "control character in header value"));
            }
        }

        if self.header_count >= MAX_HEADERS {
            return Err(HttpError::new(REQUEST_HEADER_FIELDS_TOO_LARGE, "too many headers"));
        }
        headers::add(&mut self.headers, name, value);
        self.header_count += 1;

        if name.eq_ignore_ascii_case(headers::TRANSFER_ENCODING)
            && value.to_ascii_lowercase().contains("chunked")
        {
            self.chunked = true;
        }
        Ok(())
    }

    fn validate_headers(&mut self) -> Result<(), HttpError> {
        if self.version == "HTTP/1.1" && !headers::has(&self.headers, headers::HOST) {
            return Err(HttpError::new(BAD_REQUEST, "HTTP/1.1 requires Host header"));
        }
        if let Some(value) = self.header(headers::CONTENT_LENGTH) {
            if value.is_empty() || value.bytes().any(|c| !c.is_ascii_digit()) {
                return Err(HttpError::new(BAD_REQUEST, "invalid Content-Length value"));
            }
            let length: usize = value
                .parse()
                .map_err(|_| HttpError::new(BAD_REQUEST, "invalid Content-Length value"))?;
            if length > self.max_body_size {
                return Err(HttpError::from_status(PAYLOAD_TOO_LARGE));
            }
            if self.chunked {
                return Err(HttpError::new(
                    BAD_REQUEST,
                    "Content-Length and chunked Transfer-Encoding cannot be combined",
                ));
            }
            self.content_length = length;
        }
        Ok(())
    }

    fn decide_body_state(&mut self) -> Result<(), HttpError> {
        if !self.method.expects_body() {
            // GET/HEAD/DELETE/OPTIONS/TRACE/CONNECT carry no body here.
            self.state = ParseState::Complete;
            return Ok(());
        }
        if self.chunked {
            self.state = ParseState::AwaitChunkSize;
            return Ok(());
        }
        if !headers::has(&self.headers, headers::CONTENT_LENGTH) {
            if !self.buf.is_empty() {
                return Err(HttpError::new(LENGTH_REQUIRED, "Content-Length header required"));
            }
            self.state = ParseState::Complete;
            return Ok(());
        }
        if self.content_length == 0 {
            self.state = ParseState::Complete;
            return Ok(());
        }
        self.state = ParseState::AwaitBody;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Body

    fn take_body_bytes(&mut self) {
        let needed = self.content_length - self.body.len();
        let take = needed.min(self.buf.len());
        self.body.extend(self.buf.drain(..take));
        if self.body.len() == self.content_length {
            self.state = ParseState::Complete;
        }
    }

    fn try_parse_chunk_size(&mut self) -> Result<(), HttpError> {
        let line_end = match find(b"\r\n", &self.buf) {
            Some(i) => i,
            None => return Ok(()),
        };
        let line = self.buf[..line_end].to_vec();
        self.buf.drain(..line_end + 2);
        let mut size_text = std::str::from_utf8(&line)
            .map_err(|_| HttpError::new(BAD_REQUEST, "invalid chunk size"))?;
        // Drop any chunk extension.
        if let Some(i) = size_text.find(';') {
            size_text = &size_text[..i];
        }
        let size_text = size_text.trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| HttpError::new(BAD_REQUEST, format!("invalid chunk size: {}", size_text)))?;
        if size == 0 {
            self.state = ParseState::AwaitTrailers;
        } else {
            if self.body.len() + size > self.max_body_size {
                return Err(HttpError::from_status(PAYLOAD_TOO_LARGE));
            }
            self.chunk_remaining = size;
            self.state = ParseState::AwaitChunkData;
        }
        Ok(())
    }

    fn try_take_chunk_data(&mut self) -> Result<(), HttpError> {
        // Wait for the chunk plus its trailing CRLF.
        if self.buf.len() < self.chunk_remaining + 2 {
            return Ok(());
        }
        self.body.extend(self.buf.drain(..self.chunk_remaining));
        let crlf: Vec<u8> = self.buf.drain(..2).collect();
        if crlf != b"\r\n" {
            return Err(HttpError::new(BAD_REQUEST, "chunk data not terminated by CRLF"));
        }
        self.chunk_remaining = 0;
        self.state = ParseState::AwaitChunkSize;
        Ok(())
    }

    fn try_parse_trailers(&mut self) -> Result<(), HttpError> {
        // Bare CRLF ends the message; otherwise trailer fields run up to a
        // blank line.
        if self.buf.starts_with(b"\r\n") {
            self.buf.drain(..2);
            self.state = ParseState::Complete;
            return Ok(());
        }
        let end = match find(b"\r\n\r\n", &self.buf) {
            Some(i) => i,
            None => return Ok(()),
        };
        let trailer_block = self.buf[..end].to_vec();
        self.buf.drain(..end + 4);
        let text = std::str::from_utf8(&trailer_block)
            .map_err(|_| HttpError::new(BAD_REQUEST, "trailer block is not valid ASCII"))?;
        for line in text.split("\r\n") {
            if !line.is_empty() {
                self.parse_header_line(line)?;
            }
        }
        self.state = ParseState::Complete;
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}
