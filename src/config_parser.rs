//! Configuration file tokenizer and parser (nginx-subset grammar).
//!
//! Grammar: one or more `server { ... }` blocks holding directives and
//! `location [=] <path> { ... }` sub-blocks. Errors carry
//! `file:line:col` positions.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use crate::config::{self, LocationBlock, ServerBlock};
use crate::request::Method;

const MAX_TOKEN_LENGTH: usize = 4096;
const MAX_BODY_SIZE_BYTES: usize = 1024 * 1024 * 1024; // 1 GiB cap

const REDIRECT_STATUS_CODES: &[u16] = &[301, 302, 303, 307, 308];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Identifier,
    OpenBrace,
    CloseBrace,
    Semicolon,
    Equals,
    Str,
    Number,
    EndOfFile,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    value: String,
    line: usize,
    column: usize,
}

/// Load, parse and finalize a configuration file.
pub fn load(filename: &str) -> Result<Vec<ServerBlock>> {
    let source = std::fs::read_to_string(filename)
        .map_err(|e| anyhow!("failed to open configuration file {}: {}", filename, e))?;
    parse_str(&source, filename)
}

/// Parse and finalize configuration text.
pub fn parse_str(source: &str, filename: &str) -> Result<Vec<ServerBlock>> {
    let tokens = tokenize(source, filename)?;
    let mut blocks = Parser::new(tokens, filename).parse()?;
    config::finalize(&mut blocks)?;
    Ok(blocks)
}

// ----------------------------------------------------------------------------
// Tokenizer

struct Tokenizer<'a> {
    filename: &'a str,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

fn tokenize(source: &str, filename: &str) -> Result<Vec<Token>> {
    let mut tokenizer = Tokenizer {
        filename,
        line: 1,
        column: 0,
        tokens: Vec::new(),
    };
    tokenizer.run(source)?;
    Ok(tokenizer.tokens)
}

impl<'a> Tokenizer<'a> {
    fn run(&mut self, source: &str) -> Result<()> {
        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            self.column += 1;
            match c {
                '\n' => {
                    self.line += 1;
                    self.column = 0;
                }
                '#' => {
                    // Comment to end of line.
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                    self.line += 1;
                    self.column = 0;
                }
                '"' => self.read_string(&mut chars)?,
                '{' => self.push(TokenKind::OpenBrace, "{".to_string()),
                '}' => self.push(TokenKind::CloseBrace, "}".to_string()),
                ';' => self.push(TokenKind::Semicolon, ";".to_string()),
                '=' => self.push(TokenKind::Equals, "=".to_string()),
                c if c.is_whitespace() => {}
                c if c.is_ascii_digit() => self.read_number(c, &mut chars)?,
                c if is_identifier_start(c) => self.read_identifier(c, &mut chars)?,
                c => return Err(self.error(format!("unexpected character '{}'", c))),
            }
        }
        self.push(TokenKind::EndOfFile, String::new());
        Ok(())
    }

    fn read_string(
        &mut self,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) -> Result<()> {
        let mut value = String::new();
        let mut escaped = false;
        for c in chars.by_ref() {
            self.column += 1;
            if c == '\n' {
                return Err(self.error("unterminated string literal".to_string()));
            }
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                if value.len() > MAX_TOKEN_LENGTH {
                    return Err(self.error("string token exceeds maximum length".to_string()));
                }
                self.push(TokenKind::Str, value);
                return Ok(());
            } else {
                value.push(c);
                if value.len() > MAX_TOKEN_LENGTH {
                    return Err(self.error("string token exceeds maximum length".to_string()));
                }
            }
        }
        Err(self.error("unterminated string literal at end of file".to_string()))
    }

    fn read_number(
        &mut self,
        first: char,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) -> Result<()> {
        let mut value = String::new();
        value.push(first);
        while let Some(&c) = chars.peek() {
            // Dots and colons keep IP addresses and host:port forms as one
            // token; a trailing size unit ends the number.
            if c.is_ascii_digit() || c == '.' || c == ':' {
                value.push(c);
                chars.next();
                self.column += 1;
            } else if matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G') {
                value.push(c);
                chars.next();
                self.column += 1;
                break;
            } else {
                break;
            }
            if value.len() > MAX_TOKEN_LENGTH {
                return Err(self.error("number token exceeds maximum length".to_string()));
            }
        }
        self.push(TokenKind::Number, value);
        Ok(())
    }

    fn read_identifier(
        &mut self,
        first: char,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) -> Result<()> {
        let mut value = String::new();
        value.push(first);
        while let Some(&c) = chars.peek() {
            if is_identifier_part(c) {
                value.push(c);
                chars.next();
                self.column += 1;
                if value.len() > MAX_TOKEN_LENGTH {
                    return Err(self.error("identifier token exceeds maximum length".to_string()));
                }
            } else {
                break;
            }
        }
        self.push(TokenKind::Identifier, value);
        Ok(())
    }

    fn push(&mut self, kind: TokenKind, value: String) {
        let column = self.column.saturating_sub(value.len());
        self.tokens.push(Token {
            kind,
            value,
            line: self.line,
            column,
        });
    }

    fn error(&self, message: String) -> anyhow::Error {
        anyhow!("{}:{}:{}: {}", self.filename, self.line, self.column, message)
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '/' | '.')
}

fn is_identifier_part(c: char) -> bool {
    // URL-ish characters are allowed so redirect targets stay one token.
    c.is_ascii_alphanumeric()
        || matches!(c, '_' | '-' | '.' | '/' | ':' | '?' | '&' | '=' | '%' | '*')
}

// ----------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    filename: &'a str,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, filename: &'a str) -> Parser<'a> {
        Parser {
            tokens,
            pos: 0,
            filename,
        }
    }

    fn parse(mut self) -> Result<Vec<ServerBlock>> {
        if self.tokens.len() <= 1 {
            bail!("{}: empty configuration file", self.filename);
        }
        let mut blocks = Vec::new();
        while !self.check(TokenKind::EndOfFile) {
            if self.match_ident("server") {
                blocks.push(self.parse_server_block()?);
            } else {
                return Err(self.error("expected 'server' block", self.current()));
            }
        }
        Ok(blocks)
    }

    fn parse_server_block(&mut self) -> Result<ServerBlock> {
        let mut server = ServerBlock::default();
        let mut listen_set = false;
        self.expect(TokenKind::OpenBrace, "expected '{' after 'server'")?;
        while !self.check(TokenKind::CloseBrace) {
            if self.match_ident("location") {
                let location = self.parse_location_block()?;
                server.locations.push(location);
            } else {
                self.parse_server_directive(&mut server, &mut listen_set)?;
            }
        }
        self.expect(TokenKind::CloseBrace, "expected '}' to close server block")?;
        Ok(server)
    }

    fn parse_location_block(&mut self) -> Result<LocationBlock> {
        let mut location = LocationBlock::default();
        if self.check(TokenKind::Equals) {
            self.pos += 1;
            location.exact_match = true;
        }
        let path_token = self.consume("expected location path")?;
        if path_token.kind != TokenKind::Identifier && path_token.kind != TokenKind::Str {
            return Err(self.error("expected location path", &path_token));
        }
        if !path_token.value.starts_with('/') {
            return Err(self.error("location path must start with a slash (/)", &path_token));
        }
        location.path = path_token.value.clone();

        self.expect(TokenKind::OpenBrace, "expected '{' after location path")?;
        while !self.check(TokenKind::CloseBrace) {
            self.parse_location_directive(&mut location)?;
        }
        self.expect(TokenKind::CloseBrace, "expected '}' to close location block")?;
        Ok(location)
    }

    /// Read `name value... ;` and return the name token plus values.
    fn read_directive(&mut self) -> Result<(Token, Vec<String>)> {
        let directive = self.consume("expected directive")?;
        if directive.kind != TokenKind::Identifier {
            return Err(self.error("expected directive name", &directive));
        }
        let mut values = Vec::new();
        while !self.check(TokenKind::Semicolon) {
            let value = self.consume("unexpected end of directive")?;
            match value.kind {
                TokenKind::Identifier | TokenKind::Str | TokenKind::Number => {
                    values.push(value.value)
                }
                _ => return Err(self.error("expected directive value", &value)),
            }
        }
        self.expect(TokenKind::Semicolon, "expected ';' after directive")?;
        Ok((directive, values))
    }

    fn parse_server_directive(
        &mut self,
        server: &mut ServerBlock,
        listen_set: &mut bool,
    ) -> Result<()> {
        let (directive, values) = self.read_directive()?;
        match directive.value.as_str() {
            "listen" => {
                if values.is_empty() {
                    return Err(self.error("listen requires at least one value", &directive));
                }
                // The implicit default bind goes away once listen appears.
                if !*listen_set {
                    server.listen.clear();
                    *listen_set = true;
                }
                for value in &values {
                    let tuple = self.parse_host_port(value, &directive)?;
                    server.listen.push(tuple);
                }
            }
            "server_name" => {
                if values.is_empty() || values.iter().any(|v| v.is_empty()) {
                    return Err(
                        self.error("server_name requires non-empty values", &directive)
                    );
                }
                server.server_names = values;
            }
            "root" => {
                let value = self.single_value(&values, "root", &directive)?;
                server.root = value;
            }
            "client_max_body_size" => {
                let value = self.single_value(&values, "client_max_body_size", &directive)?;
                server.client_max_body_size = self.parse_size(&value, &directive)?;
                server.client_max_body_size_set = true;
            }
            "error_page" => self.parse_error_page(&mut server.error_pages, &values, &directive)?,
            "default_server" | "default" => server.is_default = true,
            "default_stylesheet" => {
                let value = self.single_value(&values, "default_stylesheet", &directive)?;
                server.default_stylesheet = value;
            }
            name => {
                return Err(
                    self.error(&format!("unknown server directive: {}", name), &directive)
                )
            }
        }
        Ok(())
    }

    fn parse_location_directive(&mut self, location: &mut LocationBlock) -> Result<()> {
        let (directive, values) = self.read_directive()?;
        match directive.value.as_str() {
            "methods" | "limit_except" => {
                if values.is_empty() {
                    return Err(self.error("methods requires at least one value", &directive));
                }
                location.allowed_methods.clear();
                for value in &values {
                    let token = value.to_ascii_uppercase();
                    let method = Method::from_token(&token).ok_or_else(|| {
                        self.error(&format!("invalid HTTP method: {}", value), &directive)
                    })?;
                    if !method.is_implemented() {
                        log::warn!(
                            "method {} is configured but not implemented by the server",
                            token
                        );
                    }
                    location.allowed_methods.push(method);
                }
            }
            "root" => {
                location.root = self.single_value(&values, "root", &directive)?;
            }
            "index" => {
                location.index = self.single_value(&values, "index", &directive)?;
            }
            "autoindex" => {
                let value = self
                    .single_value(&values, "autoindex", &directive)?
                    .to_ascii_lowercase();
                location.autoindex = matches!(value.as_str(), "on" | "true" | "1");
            }
            "return" | "redirect" => match values.len() {
                1 => {
                    location.redirect_status = 302;
                    location.redirect = values[0].clone();
                }
                2 => {
                    let status: u16 = values[0].parse().map_err(|_| {
                        self.error(&format!("invalid status code: {}", values[0]), &directive)
                    })?;
                    if !REDIRECT_STATUS_CODES.contains(&status) {
                        return Err(self.error(
                            &format!(
                                "invalid redirect status code: {} (must be 301, 302, 303, 307, or 308)",
                                status
                            ),
                            &directive,
                        ));
                    }
                    location.redirect_status = status;
                    location.redirect = values[1].clone();
                }
                _ => {
                    return Err(
                        self.error("return/redirect requires one or two values", &directive)
                    )
                }
            },
            "client_max_body_size" => {
                let value = self.single_value(&values, "client_max_body_size", &directive)?;
                location.client_max_body_size = self.parse_size(&value, &directive)?;
                location.client_max_body_size_set = true;
            }
            "upload_store" => {
                location.upload_store = self.single_value(&values, "upload_store", &directive)?;
            }
            "error_page" => {
                self.parse_error_page(&mut location.error_pages, &values, &directive)?
            }
            "cgi_handler" => {
                if values.len() != 2 || values[0].is_empty() || values[1].is_empty() {
                    return Err(self.error(
                        "cgi_handler requires exactly two values: extension and handler",
                        &directive,
                    ));
                }
                if !values[0].starts_with('.') {
                    return Err(self.error("extension must start with a dot (.)", &directive));
                }
                location.cgi_enabled = true;
                location
                    .cgi_handlers
                    .insert(values[0].clone(), values[1].clone());
            }
            name => {
                return Err(
                    self.error(&format!("unknown location directive: {}", name), &directive)
                )
            }
        }
        Ok(())
    }

    /// `host:port`, bare host, or bare port.
    fn parse_host_port(&self, value: &str, token: &Token) -> Result<(String, u16)> {
        if let Some(i) = value.find(':') {
            let host = value[..i].to_string();
            let port = parse_port(&value[i + 1..])
                .ok_or_else(|| self.error(&format!("invalid port number: {}", &value[i + 1..]), token))?;
            return Ok((host, port));
        }
        if is_hostname(value) {
            return Ok((value.to_string(), 80));
        }
        match parse_port(value) {
            Some(port) => Ok(("0.0.0.0".to_string(), port)),
            None => Err(self.error(&format!("invalid port number: {}", value), token)),
        }
    }

    /// `<N>[kmg]`, capped at 1 GiB.
    fn parse_size(&self, value: &str, token: &Token) -> Result<usize> {
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() || digits.len() > 7 {
            return Err(self.error("client_max_body_size value out of range", token));
        }
        let number: usize = digits.parse().unwrap();
        let rest = &value[digits.len()..];
        let size = match rest {
            "" => number,
            "k" | "K" => number * 1024,
            "m" | "M" => number * 1024 * 1024,
            "g" | "G" => number * 1024 * 1024 * 1024,
            _ => return Err(self.error(&format!("invalid size unit: {}", rest), token)),
        };
        if size > MAX_BODY_SIZE_BYTES {
            return Err(self.error("client_max_body_size exceeds maximum allowed size (1GB)", token));
        }
        Ok(size)
    }

    /// `error_page <code ...> <path>`.
    fn parse_error_page(
        &self,
        error_pages: &mut HashMap<u16, String>,
        values: &[String],
        token: &Token,
    ) -> Result<()> {
        if values.len() < 2 {
            return Err(self.error("error_page requires at least two values", token));
        }
        let page_path = values.last().unwrap();
        if page_path.is_empty() {
            return Err(self.error("error_page path cannot be empty", token));
        }
        for status_text in &values[..values.len() - 1] {
            let status: u16 = status_text
                .parse()
                .map_err(|_| self.error(&format!("invalid HTTP status code: {}", status_text), token))?;
            if !(100..=599).contains(&status) {
                return Err(
                    self.error(&format!("invalid HTTP status code: {}", status_text), token)
                );
            }
            error_pages.insert(status, page_path.clone());
        }
        Ok(())
    }

    fn single_value(&self, values: &[String], name: &str, token: &Token) -> Result<String> {
        if values.len() != 1 {
            return Err(self.error(&format!("{} requires exactly one value", name), token));
        }
        if values[0].is_empty() {
            return Err(self.error(&format!("{} value cannot be empty", name), token));
        }
        Ok(values[0].clone())
    }

    // ------------------------------------------------------------------
    // Token helpers

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| self.tokens.last().unwrap())
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn match_ident(&mut self, value: &str) -> bool {
        if self.check(TokenKind::Identifier) && self.current().value == value {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<()> {
        if self.check(kind) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(message, self.current()))
        }
    }

    fn consume(&mut self, message: &str) -> Result<Token> {
        if self.pos >= self.tokens.len() || self.check(TokenKind::EndOfFile) {
            return Err(self.error(message, self.tokens.last().unwrap()));
        }
        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        Ok(token)
    }

    fn error(&self, message: &str, token: &Token) -> anyhow::Error {
        anyhow!(
            "{}:{}:{}: {}",
            self.filename,
            token.line,
            token.column,
            message
        )
    }
}

fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || text.bytes().any(|c| !c.is_ascii_digit()) {
        return None;
    }
    let port: u32 = text.parse().ok()?;
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

fn is_hostname(text: &str) -> bool {
    if text == "localhost" || text == "*" {
        return true;
    }
    // A hostname needs a dot and hostname characters only; anything else
    // is tried as a bare port.
    text.contains('.')
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[cfg(test)]
mod test {
    use super::*;

    const BASIC: &str = r#"
        server {
            listen 127.0.0.1:8080;
            server_name example.com www.example.com;
            root /srv/www;
            client_max_body_size 2m;
            error_page 404 /errors/404.html;

            location / {
                methods GET POST;
                index index.html;
                autoindex on;
            }

            location = /exact {
                index exact.html;
            }

            location /old {
                return 301 /new;
            }

            location /cgi-bin {
                methods GET POST;
                cgi_handler .py /usr/bin/python3;
                cgi_handler .sh /bin/sh;
            }

            location /upload {
                methods POST;
                upload_store /srv/uploads;
                client_max_body_size 10m;
            }
        }
    "#;

    #[test]
    fn parses_full_server_block() {
        let blocks = parse_str(BASIC, "test.conf").unwrap();
        assert_eq!(blocks.len(), 1);
        let server = &blocks[0];
        assert_eq!(server.listen, vec![("127.0.0.1".to_string(), 8080)]);
        assert_eq!(server.server_names.len(), 2);
        assert_eq!(server.root, "/srv/www");
        assert_eq!(server.client_max_body_size, 2 * 1024 * 1024);
        assert_eq!(server.error_pages.get(&404).unwrap(), "/errors/404.html");
        assert_eq!(server.locations.len(), 5);

        let root = &server.locations[0];
        assert!(root.autoindex);
        assert_eq!(root.allowed_methods, vec![Method::Get, Method::Post]);

        let exact = &server.locations[1];
        assert!(exact.exact_match);

        let redirect = &server.locations[2];
        assert_eq!(redirect.redirect, "/new");
        assert_eq!(redirect.redirect_status, 301);

        let cgi = &server.locations[3];
        assert!(cgi.cgi_enabled);
        assert_eq!(cgi.cgi_handlers.get(".py").unwrap(), "/usr/bin/python3");

        let upload = &server.locations[4];
        assert_eq!(upload.upload_store, "/srv/uploads");
        assert_eq!(upload.client_max_body_size, 10 * 1024 * 1024);
    }

    #[test]
    fn body_size_inherits_when_unset() {
        let blocks = parse_str(BASIC, "test.conf").unwrap();
        // "/" has no own client_max_body_size: inherits the server's 2m.
        assert_eq!(blocks[0].locations[0].client_max_body_size, 2 * 1024 * 1024);
    }

    #[test]
    fn listen_accepts_bare_port_and_host() {
        let source = "server { listen 9000; root /srv; location / { } }";
        let blocks = parse_str(source, "t.conf").unwrap();
        assert_eq!(blocks[0].listen, vec![("0.0.0.0".to_string(), 9000)]);

        let source = "server { listen localhost; root /srv; location / { } }";
        let blocks = parse_str(source, "t.conf").unwrap();
        assert_eq!(blocks[0].listen, vec![("localhost".to_string(), 80)]);
    }

    #[test]
    fn comments_and_strings_are_handled() {
        let source = "# leading comment\nserver {\n listen 8081; # trailing\n root \"/srv/my site\";\n location / { } }";
        let blocks = parse_str(source, "t.conf").unwrap();
        assert_eq!(blocks[0].root, "/srv/my site");
    }

    #[test]
    fn default_redirect_status_is_302() {
        let source = "server { listen 8081; root /srv; location /go { return /target; } }";
        let blocks = parse_str(source, "t.conf").unwrap();
        assert_eq!(blocks[0].locations[0].redirect_status, 302);
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse_str("server { bogus_directive on; }", "bad.conf").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("bad.conf:"), "got: {}", message);
        assert!(message.contains("unknown server directive"));
    }

    #[test]
    fn invalid_redirect_status_is_rejected() {
        let source = "server { listen 8081; root /srv; location /go { return 404 /x; } }";
        assert!(parse_str(source, "t.conf").is_err());
    }

    #[test]
    fn size_over_one_gigabyte_is_rejected() {
        let source = "server { listen 8081; root /srv; client_max_body_size 2g; location / { } }";
        assert!(parse_str(source, "t.conf").is_err());
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(parse_str("", "t.conf").is_err());
        assert!(parse_str("# only a comment\n", "t.conf").is_err());
    }

    #[test]
    fn location_path_must_start_with_slash() {
        let source = "server { listen 8081; root /srv; location foo { } }";
        assert!(parse_str(source, "t.conf").is_err());
    }

    #[test]
    fn cgi_handler_requires_dotted_extension() {
        let source =
            "server { listen 8081; root /srv; location / { cgi_handler py /usr/bin/python3; } }";
        assert!(parse_str(source, "t.conf").is_err());
    }
}
