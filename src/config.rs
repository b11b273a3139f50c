//! In-memory configuration tree: server blocks and their location blocks.
//!
//! Built by the parser in `config_parser`, finalized and validated here,
//! then read-only for the lifetime of the event loop.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, bail, Result};

use crate::request::Method;

pub const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 1024 * 1024;
const DEFAULT_SERVER_PORT: u16 = 8080;

/// A virtual host.
#[derive(Debug, Clone)]
pub struct ServerBlock {
    /// `(host, port)` bind tuples; never empty.
    pub listen: Vec<(String, u16)>,
    pub server_names: Vec<String>,
    pub is_default: bool,
    pub root: String,
    pub client_max_body_size: usize,
    pub client_max_body_size_set: bool,
    pub error_pages: HashMap<u16, String>,
    /// Stylesheet linked into server-generated HTML pages.
    pub default_stylesheet: String,
    pub locations: Vec<LocationBlock>,
}

impl Default for ServerBlock {
    fn default() -> ServerBlock {
        ServerBlock {
            listen: vec![("0.0.0.0".to_string(), DEFAULT_SERVER_PORT)],
            server_names: Vec::new(),
            is_default: false,
            root: String::new(),
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            client_max_body_size_set: false,
            error_pages: HashMap::new(),
            default_stylesheet: String::new(),
            locations: Vec::new(),
        }
    }
}

/// A route inside a virtual host.
#[derive(Debug, Clone)]
pub struct LocationBlock {
    pub path: String,
    pub exact_match: bool,
    pub allowed_methods: Vec<Method>,
    pub root: String,
    pub index: String,
    pub autoindex: bool,
    pub redirect: String,
    /// 301/302/303/307/308; the parser fills in 302 when only a URL was
    /// given.
    pub redirect_status: u16,
    pub client_max_body_size: usize,
    pub client_max_body_size_set: bool,
    pub upload_store: String,
    pub cgi_enabled: bool,
    /// Extension -> interpreter path; an empty interpreter means direct
    /// execution.
    pub cgi_handlers: HashMap<String, String>,
    pub error_pages: HashMap<u16, String>,
}

impl Default for LocationBlock {
    fn default() -> LocationBlock {
        LocationBlock {
            path: String::new(),
            exact_match: false,
            allowed_methods: vec![Method::Get],
            root: String::new(),
            index: String::new(),
            autoindex: false,
            redirect: String::new(),
            redirect_status: 0,
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            client_max_body_size_set: false,
            upload_store: String::new(),
            cgi_enabled: false,
            cgi_handlers: HashMap::new(),
            error_pages: HashMap::new(),
        }
    }
}

impl LocationBlock {
    pub fn allows_method(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }

    /// Comma-separated list of methods that are both allowed here and
    /// implemented by the server; at least "GET".
    pub fn allowed_methods_string(&self) -> String {
        let list: Vec<&str> = self
            .allowed_methods
            .iter()
            .filter(|m| m.is_implemented())
            .map(|m| m.as_str())
            .collect();
        if list.is_empty() {
            "GET".to_string()
        } else {
            list.join(", ")
        }
    }

    fn validate(&self) -> Result<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            bail!("location path must start with a slash (/)");
        }
        if self.allowed_methods.is_empty() {
            bail!("location must allow at least one HTTP method");
        }
        let mut seen = HashSet::new();
        for method in &self.allowed_methods {
            if !seen.insert(method.as_str()) {
                bail!("duplicate HTTP method in location: {}", method.as_str());
            }
        }
        if !self.redirect.is_empty() {
            if !self.index.is_empty() {
                bail!("'return' and 'index' directives are incompatible");
            }
            if self.autoindex {
                bail!("'return' and 'autoindex' directives are incompatible");
            }
            if !self.upload_store.is_empty() {
                bail!("'return' and 'upload_store' directives are incompatible");
            }
            if !self.root.is_empty() {
                bail!("'return' and 'root' directives are incompatible");
            }
        }
        if !self.cgi_handlers.is_empty() && !self.cgi_enabled {
            bail!("cgi_handler configured but CGI is not enabled");
        }
        Ok(())
    }
}

impl ServerBlock {
    /// Select the location for a request path: exact matches first, then
    /// the longest prefix ending on a `/` boundary.
    pub fn match_location(&self, path: &str) -> Option<usize> {
        for (i, location) in self.locations.iter().enumerate() {
            if location.exact_match && location.path == path {
                return Some(i);
            }
        }
        let mut longest = 0;
        let mut matched = None;
        for (i, location) in self.locations.iter().enumerate() {
            if location.exact_match {
                continue;
            }
            if prefix_matches(&location.path, path) && location.path.len() > longest {
                longest = location.path.len();
                matched = Some(i);
            }
        }
        matched
    }

    pub fn matches_server_name(&self, host: &str) -> bool {
        let normalized = normalize_server_name(host);
        self.server_names
            .iter()
            .any(|name| normalize_server_name(name) == normalized)
    }

    pub fn listens_on_port(&self, port: u16) -> bool {
        self.listen.iter().any(|(_, p)| *p == port)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            bail!("server block is missing listen directives");
        }
        if self.root.is_empty() {
            bail!("server block requires a root directive");
        }
        for location in &self.locations {
            location
                .validate()
                .map_err(|e| anyhow!("invalid location block '{}': {}", location.path, e))?;
            // Without a redirect or CGI, the location must resolve a root.
            if location.redirect.is_empty()
                && !location.cgi_enabled
                && location.root.is_empty()
                && self.root.is_empty()
            {
                bail!("location '{}' has no root and the server has none", location.path);
            }
        }
        for i in 0..self.locations.len() {
            for j in i + 1..self.locations.len() {
                let (a, b) = (&self.locations[i], &self.locations[j]);
                if a.path == b.path && a.exact_match == b.exact_match {
                    if a.exact_match {
                        bail!("duplicate exact match location: {}", a.path);
                    }
                    bail!("duplicate prefix location: {}", a.path);
                }
            }
        }
        Ok(())
    }
}

/// Prefix match with a `/` boundary: `/img` matches `/img` and
/// `/img/x.png` but not `/imgs`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len()
        || prefix.ends_with('/')
        || path.as_bytes()[prefix.len()] == b'/'
}

/// Case-fold and strip trailing dots for server-name comparison.
pub fn normalize_server_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .trim_end_matches('.')
        .to_string()
}

/// Finalize parsed blocks: apply body-size inheritance, then validate the
/// whole set.
pub fn finalize(blocks: &mut Vec<ServerBlock>) -> Result<()> {
    for server in blocks.iter_mut() {
        for location in server.locations.iter_mut() {
            if !location.client_max_body_size_set {
                location.client_max_body_size = server.client_max_body_size;
            }
        }
    }
    validate(blocks)
}

fn validate(blocks: &[ServerBlock]) -> Result<()> {
    if blocks.is_empty() {
        bail!("no server blocks defined");
    }
    for server in blocks {
        server.validate()?;
    }

    // (name, port) must be unique across all blocks.
    let mut name_ports = HashSet::new();
    for server in blocks {
        for name in &server.server_names {
            let normalized = normalize_server_name(name);
            for (_, port) in &server.listen {
                if !name_ports.insert((normalized.clone(), *port)) {
                    bail!("duplicate server name + port combination: {} on port {}", name, port);
                }
            }
        }
    }

    // At most one default server per bind tuple.
    let mut defaults = HashSet::new();
    for server in blocks {
        if !server.is_default {
            continue;
        }
        for tuple in &server.listen {
            if !defaults.insert(tuple.clone()) {
                bail!("multiple default servers for {}:{}", tuple.0, tuple.1);
            }
        }
    }
    Ok(())
}

/// Built-in configuration used when no file is given: an example vhost on
/// 8080 and a browsable default server on 4242.
pub fn default_config() -> Vec<ServerBlock> {
    let mut example = ServerBlock::default();
    example.server_names.push("example.com".to_string());
    example.listen = vec![("0.0.0.0".to_string(), 8080)];
    example.root = "www".to_string();
    example.locations.push(LocationBlock {
        path: "/".to_string(),
        index: "index.html".to_string(),
        ..LocationBlock::default()
    });

    let mut fallback = ServerBlock::default();
    fallback.is_default = true;
    fallback.listen = vec![("0.0.0.0".to_string(), 4242)];
    fallback.root = "www".to_string();
    fallback.locations.push(LocationBlock {
        path: "/".to_string(),
        index: "index.html".to_string(),
        autoindex: true,
        allowed_methods: vec![Method::Get, Method::Post],
        ..LocationBlock::default()
    });

    vec![example, fallback]
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn block_with_locations(paths: &[(&str, bool)]) -> ServerBlock {
        let mut server = ServerBlock::default();
        server.root = "/srv".to_string();
        for (path, exact) in paths {
            server.locations.push(LocationBlock {
                path: path.to_string(),
                exact_match: *exact,
                ..LocationBlock::default()
            });
        }
        server
    }

    #[test]
    fn exact_match_beats_prefix() {
        let server = block_with_locations(&[("/", false), ("/admin", false), ("/admin", true)]);
        assert_eq!(server.match_location("/admin"), Some(2));
        assert_eq!(server.match_location("/admin/panel"), Some(1));
    }

    #[test]
    fn longest_prefix_wins() {
        let server = block_with_locations(&[("/", false), ("/img", false), ("/img/big", false)]);
        assert_eq!(server.match_location("/img/big/x.png"), Some(2));
        assert_eq!(server.match_location("/img/small.png"), Some(1));
        assert_eq!(server.match_location("/other"), Some(0));
    }

    #[test]
    fn prefix_requires_segment_boundary() {
        let server = block_with_locations(&[("/img", false)]);
        assert_eq!(server.match_location("/imgs"), None);
        assert_eq!(server.match_location("/img"), Some(0));
        assert_eq!(server.match_location("/img/x"), Some(0));
    }

    #[test_case("Example.COM", "example.com")]
    #[test_case("host.", "host")]
    #[test_case("trailing..", "trailing")]
    fn normalize_server_name_works(input: &str, expected: &str) {
        assert_eq!(normalize_server_name(input), expected);
    }

    #[test]
    fn matches_server_name_is_case_insensitive() {
        let mut server = ServerBlock::default();
        server.server_names.push("Example.com".to_string());
        assert!(server.matches_server_name("EXAMPLE.COM."));
        assert!(!server.matches_server_name("other.com"));
    }

    #[test]
    fn body_size_inheritance() {
        let mut server = ServerBlock::default();
        server.root = "/srv".to_string();
        server.client_max_body_size = 42;
        server.locations.push(LocationBlock {
            path: "/a".to_string(),
            ..LocationBlock::default()
        });
        server.locations.push(LocationBlock {
            path: "/b".to_string(),
            client_max_body_size: 7,
            client_max_body_size_set: true,
            ..LocationBlock::default()
        });
        let mut blocks = vec![server];
        finalize(&mut blocks).unwrap();
        assert_eq!(blocks[0].locations[0].client_max_body_size, 42);
        assert_eq!(blocks[0].locations[1].client_max_body_size, 7);
    }

    #[test]
    fn duplicate_name_port_is_rejected() {
        let mut a = ServerBlock::default();
        a.root = "/srv".to_string();
        a.server_names.push("site.test".to_string());
        let mut b = ServerBlock::default();
        b.root = "/srv".to_string();
        b.server_names.push("SITE.test.".to_string());
        let mut blocks = vec![a, b];
        assert!(finalize(&mut blocks).is_err());
    }

    #[test]
    fn duplicate_default_server_is_rejected() {
        let mut a = ServerBlock::default();
        a.root = "/srv".to_string();
        a.is_default = true;
        let mut blocks = vec![a.clone(), a];
        assert!(finalize(&mut blocks).is_err());
    }

    #[test]
    fn redirect_excludes_other_directives() {
        let location = LocationBlock {
            path: "/old".to_string(),
            redirect: "/new".to_string(),
            redirect_status: 301,
            index: "index.html".to_string(),
            ..LocationBlock::default()
        };
        assert!(location.validate().is_err());
    }

    #[test]
    fn allowed_methods_string_lists_implemented_only() {
        let location = LocationBlock {
            path: "/".to_string(),
            allowed_methods: vec![Method::Get, Method::Put, Method::Delete],
            ..LocationBlock::default()
        };
        assert_eq!(location.allowed_methods_string(), "GET, DELETE");
    }

    #[test]
    fn default_config_is_valid() {
        let mut blocks = default_config();
        assert!(finalize(&mut blocks).is_ok());
    }
}
