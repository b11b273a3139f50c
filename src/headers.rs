//! Header storage per RFC 7230 section 3.2.2.
//!
//! Headers live in an ordered multimap so repeated fields keep their
//! relative positions when a response is serialized. Lookup is
//! case-insensitive; storage classifies each field name into one of three
//! buckets that decide what a repeated occurrence does.

/// Ordered header multimap.
pub type HeaderMap = Vec<(String, String)>;

pub const ALLOW: &str = "Allow";
pub const CONNECTION: &str = "Connection";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const DATE: &str = "Date";
pub const HOST: &str = "Host";
pub const LOCATION: &str = "Location";
pub const SERVER: &str = "Server";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";

/// Fields that must appear at most once; a later occurrence replaces the
/// earlier one.
fn is_single_value(name: &str) -> bool {
    [
        "content-length",
        "content-type",
        "date",
        "server",
        "location",
        "last-modified",
        "expires",
        "etag",
        "host",
        "authorization",
        "referer",
        "user-agent",
    ]
    .iter()
    .any(|n| name.eq_ignore_ascii_case(n))
}

/// Fields that repeat but must never be merged into one line.
fn is_special_multiple(name: &str) -> bool {
    name.eq_ignore_ascii_case("set-cookie") || name.eq_ignore_ascii_case("www-authenticate")
}

/// Fields whose repeated values are combined with ", ".
fn is_combinable(name: &str) -> bool {
    let known = [
        "accept",
        "accept-charset",
        "accept-encoding",
        "accept-language",
        "cache-control",
        "content-encoding",
        "content-language",
        "allow",
        "pragma",
        "warning",
    ];
    known.iter().any(|n| name.eq_ignore_ascii_case(n))
        || (name.len() > 2 && name[..2].eq_ignore_ascii_case("x-"))
}

/// Store a field, applying the duplicate policy for its name.
pub fn add(headers: &mut HeaderMap, name: &str, value: &str) {
    if is_special_multiple(name) {
        headers.push((name.to_string(), value.to_string()));
        return;
    }
    let existing = headers
        .iter()
        .position(|(n, _)| n.eq_ignore_ascii_case(name));
    if is_combinable(name) {
        match existing {
            Some(i) => {
                let combined = format!("{}, {}", headers[i].1, value);
                headers[i].1 = combined;
            }
            None => headers.push((name.to_string(), value.to_string())),
        }
    } else {
        // Single-value fields and anything unclassified: last one wins.
        match existing {
            Some(i) => headers[i].1 = value.to_string(),
            None => headers.push((name.to_string(), value.to_string())),
        }
    }
}

/// First value stored under `name`, case-insensitive.
pub fn get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn has(headers: &HeaderMap, name: &str) -> bool {
    get(headers, name).is_some()
}

/// Canonical display form of a field name, e.g. "content-type" ->
/// "Content-Type".
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut capitalize = true;
    for c in name.chars() {
        if c == '-' {
            normalized.push('-');
            capitalize = true;
        } else if capitalize {
            normalized.extend(c.to_uppercase());
            capitalize = false;
        } else {
            normalized.extend(c.to_lowercase());
        }
    }
    normalized
}

/// CGI meta-variable name for a request header, e.g. "User-Agent" ->
/// "HTTP_USER_AGENT".
pub fn cgi_env_name(name: &str) -> String {
    let mut env_name = String::from("HTTP_");
    for c in name.chars() {
        if c == '-' {
            env_name.push('_');
        } else {
            env_name.extend(c.to_uppercase());
        }
    }
    env_name
}

/// RFC 7230 tchar set for field names.
pub fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
