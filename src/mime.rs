//! Extension to MIME type lookup.

use std::collections::HashMap;

use once_cell::sync::Lazy;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "video/mp4               mp4",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
];

static MIME_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for line in DEFAULT_EXTENSIONS_MAP {
        add_mimetype_line(&mut map, line);
    }
    map
});

/// Add line from an extension map: a mimetype followed by its extensions.
fn add_mimetype_line(map: &mut HashMap<String, String>, line: &str) {
    let mut fields = line
        .split(|c| matches!(c, ' ' | '\t'))
        .filter(|field| !field.is_empty());
    let mimetype = match fields.next() {
        Some(mimetype) => mimetype,
        None => return, // empty line
    };
    if mimetype.starts_with('#') {
        return; // comment
    }
    for extension in fields {
        map.insert(extension.to_string(), mimetype.to_string());
    }
}

/// Content type for a path, from its last extension.
pub fn content_type(path: &str) -> &'static str {
    path.rsplit('.')
        .next()
        .and_then(|extension| MIME_MAP.get(extension))
        .map(|mimetype| mimetype.as_str())
        .unwrap_or(DEFAULT_MIME_TYPE)
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("/site/index.html", "text/html")]
    #[test_case("/a/b.PNG", "application/octet-stream" ; "extension lookup is case sensitive")]
    #[test_case("/a/b.png", "image/png")]
    #[test_case("/noextension", "application/octet-stream")]
    #[test_case("/archive.tar.gz", "application/octet-stream" ; "unknown last extension")]
    fn content_type_works(path: &str, expected: &str) {
        assert_eq!(content_type(path), expected);
    }
}
