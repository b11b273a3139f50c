//! Request-target parsing: origin form (`/path?query`) and absolute form
//! (`scheme://authority/path?query`), path normalization and
//! percent-encoding.

use std::fmt;

use crate::error::{HttpError, BAD_REQUEST};

pub const MAX_URI_LENGTH: usize = 2048;
const HTTP_DEFAULT_PORT: u16 = 80;
const HTTPS_DEFAULT_PORT: u16 = 443;

/// A parsed request target.
#[derive(Debug, Clone, Default)]
pub struct Uri {
    /// Normalized path (dot segments and repeated slashes removed).
    pub path: String,
    /// Path exactly as it appeared on the request line, before
    /// normalization or decoding. The security filter inspects this.
    pub raw_path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    /// Authority host, absolute-form targets only.
    pub host: Option<String>,
    /// Authority port, absolute-form targets only.
    pub port: Option<u16>,
}

impl Uri {
    /// Parse a target that already passed [`validate`].
    pub fn parse(target: &str) -> Uri {
        let mut uri = Uri::default();
        let rest = match split_scheme(target) {
            Some((scheme, rest)) => {
                // Authority runs up to the first slash; path defaults to "/".
                let (authority, path_and_query) = match rest.find('/') {
                    Some(i) => (&rest[..i], &rest[i..]),
                    None => (rest, "/"),
                };
                let (host, port) = split_authority(authority, scheme);
                uri.host = Some(host);
                uri.port = Some(port);
                path_and_query
            }
            None => target,
        };
        match rest.find('?') {
            Some(i) => {
                uri.raw_path = rest[..i].to_string();
                uri.query = rest[i + 1..].to_string();
            }
            None => uri.raw_path = rest.to_string(),
        }
        uri.path = normalize_path(&uri.raw_path);
        uri
    }

    pub fn is_absolute(&self) -> bool {
        self.host.is_some()
    }

    /// Host header value synthesized from an absolute-form authority; the
    /// port is appended only when non-standard.
    pub fn authority_host_header(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        let port = self.port.unwrap_or(HTTP_DEFAULT_PORT);
        if port == HTTP_DEFAULT_PORT || port == HTTPS_DEFAULT_PORT {
            Some(host.clone())
        } else {
            Some(format!("{}:{}", host, port))
        }
    }

    /// Decoded query parameters, `+` translated to space.
    pub fn query_params(&self) -> Result<Vec<(String, String)>, HttpError> {
        let mut params = Vec::new();
        if self.query.is_empty() {
            return Ok(params);
        }
        for pair in self.query.split('&') {
            match pair.find('=') {
                Some(i) => params.push((
                    decode_form_component(&pair[..i])?,
                    decode_form_component(&pair[i + 1..])?,
                )),
                None => params.push((decode_form_component(pair)?, String::new())),
            }
        }
        Ok(params)
    }
}

fn split_scheme(target: &str) -> Option<(&str, &str)> {
    let i = target.find("://")?;
    let scheme = &target[..i];
    if scheme == "http" || scheme == "https" {
        Some((scheme, &target[i + 3..]))
    } else {
        None
    }
}

fn split_authority(authority: &str, scheme: &str) -> (String, u16) {
    let default_port = if scheme == "https" {
        HTTPS_DEFAULT_PORT
    } else {
        HTTP_DEFAULT_PORT
    };
    match authority.find(':') {
        Some(i) => {
            let host = authority[..i].to_string();
            let port = authority[i + 1..].parse().unwrap_or(default_port);
            (host, if port == 0 { default_port } else { port })
        }
        None => (authority.to_string(), default_port),
    }
}

/// Length check, separated so the caller can answer 414 instead of 400.
pub fn validate_size(target: &str) -> bool {
    !target.is_empty() && target.len() <= MAX_URI_LENGTH
}

/// Character-level validation: printable ASCII only, well-formed percent
/// triplets, no `%00`, no literals that must be encoded.
pub fn validate(target: &str) -> bool {
    let bytes = target.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c < 0x20 || c > 0x7e {
            return false;
        }
        if c == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            if bytes[i + 1] == b'0' && bytes[i + 2] == b'0' {
                return false;
            }
            i += 3;
            continue;
        }
        if matches!(
            c,
            b' ' | b'<' | b'>' | b'"' | b'{' | b'}' | b'|' | b'\\' | b'^' | b'[' | b']' | b'`'
        ) {
            return false;
        }
        i += 1;
    }
    true
}

/// Collapse repeated slashes, drop `.` segments and pop one segment per
/// `..`. The result always starts with `/` and carries no trailing slash
/// (except for the root itself).
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut normalized = String::from("/");
    normalized.push_str(&segments.join("/"));
    normalized
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

fn decode_bytes(s: &str, plus_is_space: bool) -> Result<Vec<u8>, HttpError> {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if bytes[i + 1] == b'0' && bytes[i + 2] == b'0' {
                return Err(HttpError::new(BAD_REQUEST, "encoded null byte"));
            }
            decoded.push(hex_to_digit(bytes[i + 1]) * 16 + hex_to_digit(bytes[i + 2]));
            i += 3;
        } else if plus_is_space && c == b'+' {
            decoded.push(b' ');
            i += 1;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    Ok(decoded)
}

/// Percent-decode a path component. `+` is left alone here; it only means
/// space inside form fields.
pub fn decode(s: &str) -> Result<String, HttpError> {
    String::from_utf8(decode_bytes(s, false)?)
        .map_err(|_| HttpError::new(BAD_REQUEST, "percent-encoded bytes are not valid UTF-8"))
}

/// Percent-decode a form field, translating `+` to space.
pub fn decode_form_component(s: &str) -> Result<String, HttpError> {
    String::from_utf8(decode_bytes(s, true)?)
        .map_err(|_| HttpError::new(BAD_REQUEST, "percent-encoded bytes are not valid UTF-8"))
}

/// Encode string to be an RFC 3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}
