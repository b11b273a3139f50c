//! HTTP/1.1 response construction and serialization.

use std::fmt;

use chrono::{TimeZone, Utc};

use crate::error::{reason_phrase, HttpError, OK};
use crate::headers::{self, HeaderMap};

/// RFC 1123 formatted date.
pub struct HttpDate(pub i64);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// An outbound message. `Date` and `Server` are present from construction;
/// `Content-Length` tracks the body.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    pub fn new() -> Response {
        let mut response = Response {
            status: OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        response.set_header(
            headers::DATE,
            &HttpDate(Utc::now().timestamp()).to_string(),
        );
        response.set_header(
            headers::SERVER,
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        );
        response
    }

    /// Default error response: status, `text/html`, minimal page.
    pub fn from_error(error: &HttpError) -> Response {
        let mut response = Response::new();
        response.set_status(error.status);
        response.set_header(headers::CONTENT_TYPE, "text/html");
        response.set_body(error.default_page().into_bytes());
        response
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        headers::add(&mut self.headers, &headers::normalize_name(name), value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        headers::get(&self.headers, name)
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.set_header(headers::CONTENT_LENGTH, &body.len().to_string());
        self.body = body;
    }

    pub fn set_html_body(&mut self, body: String) {
        self.set_header(headers::CONTENT_TYPE, "text/html");
        self.set_body(body.into_bytes());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize status line, header lines and body.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}
