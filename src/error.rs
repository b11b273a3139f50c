//! HTTP error type shared by the parser, the handler and the CGI layer.
//!
//! Request processing is a `Result<_, HttpError>` pipeline; a single catch
//! point in the connection turns the error into a response.

use std::fmt;

pub const OK: u16 = 200;
pub const CREATED: u16 = 201;
pub const ACCEPTED: u16 = 202;
pub const FOUND: u16 = 302;
pub const BAD_REQUEST: u16 = 400;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const METHOD_NOT_ALLOWED: u16 = 405;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const CONFLICT: u16 = 409;
pub const LENGTH_REQUIRED: u16 = 411;
pub const PAYLOAD_TOO_LARGE: u16 = 413;
pub const URI_TOO_LONG: u16 = 414;
pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
pub const REQUEST_HEADER_FIELDS_TOO_LARGE: u16 = 431;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const NOT_IMPLEMENTED: u16 = 501;
pub const GATEWAY_TIMEOUT: u16 = 504;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;

/// Standard reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown Status",
    }
}

/// A request-processing failure that maps to an HTTP status code.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> HttpError {
        HttpError {
            status,
            message: message.into(),
        }
    }

    /// Error carrying the standard reason phrase as its message.
    pub fn from_status(status: u16) -> HttpError {
        HttpError {
            status,
            message: reason_phrase(status).to_string(),
        }
    }

    /// Minimal HTML body used when no custom error page is configured.
    pub fn default_page(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>Error</title></head>\n<body>\n\
             <h1>{} - {}</h1>\n</body>\n</html>",
            self.status,
            reason_phrase(self.status)
        )
    }

    /// Whether this error must close the connection once the response has
    /// drained. All 5xx close; a handful of protocol-level 4xx close; other
    /// client errors respect the client's keep-alive preference.
    pub fn forces_close(&self) -> bool {
        if self.status >= 500 {
            return true;
        }
        matches!(
            self.status,
            BAD_REQUEST
                | REQUEST_TIMEOUT
                | LENGTH_REQUIRED
                | PAYLOAD_TOO_LARGE
                | URI_TOO_LONG
                | UNSUPPORTED_MEDIA_TYPE
        )
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, reason_phrase(self.status), self.message)
    }
}

impl std::error::Error for HttpError {}
