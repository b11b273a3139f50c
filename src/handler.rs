//! Request dispatch: location selection, redirects, the method gate, the
//! security filter, path resolution, static GET, uploads, DELETE, CGI
//! routing and error responses.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use chrono::Utc;
use nix::unistd::{access, AccessFlags};

use crate::cgi::CgiState;
use crate::config::{LocationBlock, ServerBlock};
use crate::error::{
    HttpError, ACCEPTED, BAD_REQUEST, CONFLICT, CREATED, FORBIDDEN, FOUND,
    INTERNAL_SERVER_ERROR, METHOD_NOT_ALLOWED, NOT_FOUND, NOT_IMPLEMENTED, OK,
    PAYLOAD_TOO_LARGE,
};
use crate::headers;
use crate::mime;
use crate::poller::Poller;
use crate::request::{find, Method, Request};
use crate::response::Response;
use crate::uri::{self, UrlEncoded};

/// Header marking a response as "CGI still running"; the connection stays
/// in its handling state until the orchestrator delivers the real one.
pub const CGI_PROCESSING_HEADER: &str = "X-CGI-Processing";

/// Connection-side state the handler needs to launch CGI.
pub struct CgiContext<'a> {
    pub cgi: &'a mut CgiState,
    pub poller: &'a mut Poller,
    pub server_port: u16,
    pub peer: IpAddr,
    pub now: i64,
}

/// Entry point: dispatch a parsed request against its virtual host.
/// Errors are translated to responses here; the connection only decides
/// persistence.
pub fn handle_request(
    request: &Request,
    server: &ServerBlock,
    ctx: &mut CgiContext<'_>,
) -> Response {
    let location_idx = match server.match_location(&request.uri.path) {
        Some(i) => i,
        None => {
            let error = HttpError::new(NOT_FOUND, "no matching location block");
            return error_response(&error, server, None);
        }
    };
    let location = &server.locations[location_idx];

    if !location.redirect.is_empty() {
        return redirect_response(location);
    }

    match dispatch(request, server, location, ctx) {
        Ok(response) => response,
        Err(error) => error_response(&error, server, Some(location)),
    }
}

fn dispatch(
    request: &Request,
    server: &ServerBlock,
    location: &LocationBlock,
    ctx: &mut CgiContext<'_>,
) -> Result<Response, HttpError> {
    // TRACE is refused outright (XST); other unimplemented standard
    // methods are a 405 with Allow.
    if request.method == Method::Trace {
        return Err(HttpError::new(NOT_IMPLEMENTED, "TRACE method not implemented"));
    }
    if !request.method.is_implemented() || !location.allows_method(request.method) {
        return Err(HttpError::new(METHOD_NOT_ALLOWED, "method not allowed for this resource"));
    }

    if location.cgi_enabled {
        if let Some((script_name, path_info, script_path)) =
            extract_cgi_components(&request.uri.path, server, location)?
        {
            return start_cgi(request, script_name, path_info, script_path, location, ctx);
        }
    }

    validate_file_access(&request.uri.raw_path, false)?;
    let decoded = uri::decode(&request.uri.path)?;
    validate_file_access(&decoded, false)?;

    let target = resolve_path(&decoded, server, location)?;
    match request.method {
        Method::Get => handle_get(request, &target, server, location),
        Method::Post => handle_post(request, server, location),
        Method::Delete => handle_delete(&target),
        _ => Err(HttpError::new(METHOD_NOT_ALLOWED, "method not allowed for this resource")),
    }
}

// ----------------------------------------------------------------------------
// Security filter

/// Reject traversal attempts and sensitive resources before any
/// filesystem access.
fn validate_file_access(path: &str, cgi_script: bool) -> Result<(), HttpError> {
    if is_traversal_attempt(path) {
        log::warn!("directory traversal attempt: {}", path);
        return Err(HttpError::new(FORBIDDEN, "directory traversal not allowed"));
    }
    if is_sensitive_resource(path, cgi_script) {
        log::warn!("access attempt to sensitive resource: {}", path);
        return Err(HttpError::new(FORBIDDEN, "access denied to sensitive resource"));
    }
    Ok(())
}

fn is_traversal_attempt(path: &str) -> bool {
    path.contains("../") || path.contains("..\\") || path == ".."
}

fn is_sensitive_resource(path: &str, cgi_script: bool) -> bool {
    // Hidden final segment.
    let last_segment = path.rsplit('/').next().unwrap_or("");
    if last_segment.starts_with('.') {
        return true;
    }

    const SENSITIVE_PATTERNS: &[&str] = &[
        "/.git",
        "/.svn",
        "/.env",
        "/.htaccess",
        "/.htpasswd",
        "/.DS_Store",
        "/Makefile",
        "/config",
        "/README.md",
    ];
    if SENSITIVE_PATTERNS.iter().any(|p| path.contains(p)) {
        return true;
    }

    if cgi_script {
        // Scripts may only carry a known CGI extension.
        const ALLOWED_CGI_EXTENSIONS: &[&str] = &[".cgi", ".php", ".py", ".pl", ".sh", ".rb"];
        let extension = match path.rfind('.') {
            Some(i) => &path[i..],
            None => return true,
        };
        !ALLOWED_CGI_EXTENSIONS.contains(&extension)
    } else {
        // Source, build artifacts and scripts never leave as static files.
        const BLOCKED_EXTENSIONS: &[&str] = &[
            ".conf", ".cpp", ".hpp", ".c", ".h", ".py", ".js", ".go", ".o", ".a", ".so",
            ".cgi", ".php", ".pl", ".sh", ".rb",
        ];
        BLOCKED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }
}

// ----------------------------------------------------------------------------
// Path resolution

fn effective_root<'a>(
    server: &'a ServerBlock,
    location: &'a LocationBlock,
) -> Result<&'a str, HttpError> {
    if !location.root.is_empty() {
        return Ok(&location.root);
    }
    if !server.root.is_empty() {
        return Ok(&server.root);
    }
    Err(HttpError::new(INTERNAL_SERVER_ERROR, "no root directory configured for this path"))
}

/// Map a decoded request path onto the filesystem: the matched location
/// prefix is stripped and the remainder appended to the location's root
/// (or the server's).
fn resolve_path(
    decoded_path: &str,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<String, HttpError> {
    let root = effective_root(server, location)?.trim_end_matches('/');

    if location.exact_match {
        return Ok(format!("{}/{}", root, location.index));
    }

    let remainder = decoded_path
        .strip_prefix(location.path.trim_end_matches('/'))
        .unwrap_or(decoded_path);
    if remainder.is_empty() {
        return Ok(root.to_string());
    }
    if remainder.starts_with('/') {
        Ok(format!("{}{}", root, remainder))
    } else {
        Ok(format!("{}/{}", root, remainder))
    }
}

// ----------------------------------------------------------------------------
// GET

fn handle_get(
    request: &Request,
    target: &str,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Response, HttpError> {
    let metadata = stat(target)?;
    if metadata.is_dir() {
        handle_directory(request, target, server, location)
    } else if metadata.is_file() {
        serve_file(target)
    } else {
        Err(HttpError::new(FORBIDDEN, "not a regular file"))
    }
}

fn stat(target: &str) -> Result<fs::Metadata, HttpError> {
    fs::metadata(target).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            HttpError::new(NOT_FOUND, format!("resource not found: {}", target))
        }
        std::io::ErrorKind::PermissionDenied => {
            HttpError::new(FORBIDDEN, "permission denied")
        }
        _ => HttpError::new(INTERNAL_SERVER_ERROR, e.to_string()),
    })
}

fn serve_file(target: &str) -> Result<Response, HttpError> {
    let content = fs::read(target).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => HttpError::new(NOT_FOUND, "file not found"),
        std::io::ErrorKind::PermissionDenied => HttpError::new(FORBIDDEN, "permission denied"),
        _ => HttpError::new(INTERNAL_SERVER_ERROR, e.to_string()),
    })?;
    let mut response = Response::new();
    response.set_header(headers::CONTENT_TYPE, mime::content_type(target));
    response.set_body(content);
    Ok(response)
}

fn handle_directory(
    request: &Request,
    target: &str,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Response, HttpError> {
    if !location.index.is_empty() {
        let index_path = format!("{}/{}", target.trim_end_matches('/'), location.index);
        if Path::new(&index_path).is_file() {
            return serve_file(&index_path);
        }
    }
    if location.autoindex {
        return directory_listing(&request.uri.path, target, server);
    }
    Err(HttpError::new(FORBIDDEN, "directory listing not allowed"))
}

/// Sorted listing body: directories first with a trailing slash, hidden
/// entries omitted.
struct Listing<'a> {
    url_path: &'a str,
    directories: Vec<String>,
    files: Vec<String>,
}

impl<'a> fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.directories.is_empty() && self.files.is_empty() {
            return write!(f, "<li><em>Directory is empty</em></li>");
        }
        let base = self.url_path.trim_end_matches('/');
        for name in self.directories.iter().chain(self.files.iter()) {
            write!(
                f,
                "<li><a href=\"{}/{}\">{}</a></li>",
                base,
                UrlEncoded(name.trim_end_matches('/')),
                name
            )?;
        }
        Ok(())
    }
}

fn directory_listing(
    url_path: &str,
    target: &str,
    server: &ServerBlock,
) -> Result<Response, HttpError> {
    let entries = fs::read_dir(target)
        .map_err(|_| HttpError::new(INTERNAL_SERVER_ERROR, "failed to open directory"))?;

    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) if metadata.is_dir() => directories.push(format!("{}/", name)),
            Ok(_) => files.push(name),
            Err(_) => continue,
        }
    }
    directories.sort();
    files.sort();

    let parent = parent_path(url_path);
    let listing = Listing {
        url_path,
        directories,
        files,
    };
    let mut response = Response::new();
    response.set_html_body(format!(
        "<html><head><title>Directory listing for {path}</title>\
         <meta charset=\"UTF-8\">{css}</head>\
         <body><h1>Directory listing for {path}</h1><hr><ul>{listing}</ul>\
         <form action=\"{parent}\" method=\"get\">\
         <button type=\"submit\">Back to Parent Directory</button></form>\
         <hr></body></html>",
        path = url_path,
        css = stylesheet_link(server),
        listing = listing,
        parent = parent,
    ));
    Ok(response)
}

fn parent_path(url_path: &str) -> String {
    if url_path == "/" {
        return "/".to_string();
    }
    match url_path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => url_path[..i].to_string(),
    }
}

// ----------------------------------------------------------------------------
// POST

fn handle_post(
    request: &Request,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Response, HttpError> {
    if let Some(length) = request.header(headers::CONTENT_LENGTH) {
        if let Ok(length) = length.parse::<usize>() {
            if length > location.client_max_body_size {
                return Err(HttpError::new(
                    PAYLOAD_TOO_LARGE,
                    "content length exceeds maximum allowed size",
                ));
            }
        }
    }

    let content_type = request.header(headers::CONTENT_TYPE).unwrap_or("");
    if content_type.starts_with("multipart/form-data") {
        handle_multipart_upload(request, server, location)
    } else {
        // urlencoded, unknown or absent content types all take the lenient
        // form path.
        handle_form_submission(request, server, location)
    }
}

fn extract_boundary(content_type: &str) -> Option<&str> {
    let boundary = &content_type[content_type.find("boundary=")? + "boundary=".len()..];
    let boundary = boundary.trim_matches('"');
    if boundary.is_empty() {
        None
    } else {
        Some(boundary)
    }
}

fn handle_multipart_upload(
    request: &Request,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Response, HttpError> {
    let content_type = request.header(headers::CONTENT_TYPE).unwrap_or("");
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| HttpError::new(BAD_REQUEST, "invalid multipart/form-data request"))?;

    let upload_dir = &location.upload_store;
    if upload_dir.is_empty() {
        return Err(HttpError::new(FORBIDDEN, "file uploads are not configured on this server"));
    }

    let delimiter = format!("--{}", boundary).into_bytes();
    let body = &request.body;
    let mut uploaded = false;
    let mut pos = 0;
    while let Some(start) = find(&delimiter, &body[pos..]).map(|i| pos + i) {
        let part_start = start + delimiter.len();
        let end = match find(&delimiter, &body[part_start..]) {
            Some(i) => part_start + i,
            None => break,
        };
        let part = &body[part_start..end];
        pos = end;

        let header_end = match find(b"\r\n\r\n", part) {
            Some(i) => i,
            None => continue,
        };
        let part_headers = String::from_utf8_lossy(&part[..header_end]).into_owned();
        // The CRLF before the next delimiter belongs to the framing.
        let mut content = &part[header_end + 4..];
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }
        if store_file_part(&part_headers, content, upload_dir)? {
            uploaded = true;
        }
    }

    if !uploaded {
        return Err(HttpError::new(BAD_REQUEST, "no file found in the request"));
    }
    let mut response = Response::new();
    response.set_status(CREATED);
    response.set_html_body(format!(
        "<html><head><title>Uploaded successfully</title>{}</head>\
         <body><h1>File uploaded successfully</h1>\
         <p>Your file has been uploaded to the server.</p>\
         <button onclick=\"history.back()\">Go Back</button></body></html>",
        stylesheet_link(server)
    ));
    Ok(response)
}

/// Write one multipart file part into the upload store. Parts without a
/// usable filename are skipped.
fn store_file_part(
    part_headers: &str,
    content: &[u8],
    upload_dir: &str,
) -> Result<bool, HttpError> {
    let filename = match part_headers.find("filename=\"") {
        Some(i) => {
            let rest = &part_headers[i + "filename=\"".len()..];
            match rest.find('"') {
                Some(end) => &rest[..end],
                None => return Ok(false),
            }
        }
        None => return Ok(false),
    };
    if filename.is_empty() {
        return Ok(false);
    }

    ensure_upload_dir(upload_dir)?;
    let file_path = format!("{}/{}", upload_dir.trim_end_matches('/'), filename);
    if Path::new(&file_path).exists() {
        log::warn!("upload conflict, file already exists: {}", filename);
        return Err(HttpError::new(CONFLICT, format!("file already exists: {}", filename)));
    }
    fs::write(&file_path, content)
        .map_err(|e| HttpError::new(INTERNAL_SERVER_ERROR, format!("failed to create file: {}", e)))?;
    log::info!("file uploaded: {}", filename);
    Ok(true)
}

fn ensure_upload_dir(upload_dir: &str) -> Result<(), HttpError> {
    if Path::new(upload_dir).is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(upload_dir)
        .map_err(|e| {
            log::error!("failed to create upload directory {}: {}", upload_dir, e);
            HttpError::new(INTERNAL_SERVER_ERROR, "failed to create upload directory")
        })
}

fn handle_form_submission(
    request: &Request,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Response, HttpError> {
    let body = String::from_utf8_lossy(&request.body);
    let mut fields = Vec::new();
    for pair in body.split('&').filter(|p| !p.is_empty()) {
        match pair.find('=') {
            Some(i) => fields.push((
                uri::decode_form_component(&pair[..i])?,
                uri::decode_form_component(&pair[i + 1..])?,
            )),
            None => fields.push((uri::decode_form_component(pair)?, String::new())),
        }
    }

    let upload_dir = &location.upload_store;
    let stored = if upload_dir.is_empty() {
        false
    } else {
        persist_form_fields(&fields, upload_dir)
    };

    let mut items = String::new();
    for (key, value) in &fields {
        items.push_str(&format!("<li><strong>{}:</strong> {}</li>", key, value));
    }
    let warning = if !upload_dir.is_empty() && !stored {
        "<p class=\"error\">Warning: Data was received but could not be stored.</p>"
    } else {
        ""
    };

    let mut response = Response::new();
    response.set_status(if stored { CREATED } else { OK });
    response.set_html_body(format!(
        "<html><head><title>Form Submitted</title>{}</head>\
         <body><h1>Form data received successfully</h1>{}\
         <p>The following data was submitted:</p><ul>{}</ul>\
         <button onclick=\"history.back()\">Go Back</button></body></html>",
        stylesheet_link(server),
        warning,
        items
    ));
    Ok(response)
}

fn persist_form_fields(fields: &[(String, String)], upload_dir: &str) -> bool {
    if ensure_upload_dir(upload_dir).is_err() {
        return false;
    }
    let file_path = format!(
        "{}/form_submission_{}.txt",
        upload_dir.trim_end_matches('/'),
        Utc::now().timestamp()
    );
    let mut contents = String::new();
    for (key, value) in fields {
        contents.push_str(&format!("{}: {}\n", key, value));
    }
    match fs::write(&file_path, contents) {
        Ok(()) => true,
        Err(e) => {
            log::error!("failed to persist form data to {}: {}", file_path, e);
            false
        }
    }
}

// ----------------------------------------------------------------------------
// DELETE

fn handle_delete(target: &str) -> Result<Response, HttpError> {
    let metadata = stat(target)?;
    if !metadata.is_file() {
        return Err(HttpError::new(FORBIDDEN, "cannot delete directories"));
    }
    fs::remove_file(target)
        .map_err(|e| HttpError::new(INTERNAL_SERVER_ERROR, format!("failed to delete file: {}", e)))?;
    log::info!("file deleted: {}", target);
    let mut response = Response::new();
    response.set_status(OK);
    response.set_body(b"File deleted successfully".to_vec());
    Ok(response)
}

// ----------------------------------------------------------------------------
// CGI routing

/// Walk the path segment by segment; the first segment with a CGI
/// extension that resolves to an existing regular file is the script and
/// the rest is PATH_INFO.
fn extract_cgi_components(
    path: &str,
    server: &ServerBlock,
    location: &LocationBlock,
) -> Result<Option<(String, String, String)>, HttpError> {
    let mut search_from = 0;
    loop {
        let next_slash = path[search_from..].find('/').map(|i| search_from + i);
        let candidate = match next_slash {
            Some(0) => {
                search_from = 1;
                continue;
            }
            Some(i) => &path[..i],
            None => path,
        };

        if let Some(extension) = candidate.rfind('.').map(|i| &candidate[i..]) {
            if extension == ".cgi" || location.cgi_handlers.contains_key(extension) {
                let decoded = uri::decode(candidate)?;
                let script_path = resolve_path(&decoded, server, location)?;
                if Path::new(&script_path).is_file() {
                    let path_info = match next_slash {
                        Some(i) => path[i..].to_string(),
                        None => String::new(),
                    };
                    return Ok(Some((candidate.to_string(), path_info, script_path)));
                }
            }
        }

        match next_slash {
            Some(i) => search_from = i + 1,
            None => return Ok(None),
        }
    }
}

fn start_cgi(
    request: &Request,
    script_name: String,
    path_info: String,
    script_path: String,
    location: &LocationBlock,
    ctx: &mut CgiContext<'_>,
) -> Result<Response, HttpError> {
    validate_file_access(&script_name, true)?;

    // Directly-executed scripts must carry the execute bit.
    if script_path.ends_with(".cgi") && access(script_path.as_str(), AccessFlags::X_OK).is_err() {
        return Err(HttpError::new(FORBIDDEN, "CGI script is not executable"));
    }

    let mut cgi_request = request.clone();
    cgi_request.script_name = script_name;
    cgi_request.path_info = path_info;
    ctx.cgi.start(
        cgi_request,
        &script_path,
        location,
        ctx.server_port,
        ctx.peer,
        ctx.now,
        ctx.poller,
    )?;

    let mut response = Response::new();
    response.set_status(ACCEPTED);
    response.set_header(CGI_PROCESSING_HEADER, "true");
    Ok(response)
}

// ----------------------------------------------------------------------------
// Redirects and errors

fn redirect_response(location: &LocationBlock) -> Response {
    let status = if location.redirect_status == 0 {
        FOUND
    } else {
        location.redirect_status
    };
    let mut response = Response::new();
    response.set_status(status);
    response.set_header(headers::LOCATION, &location.redirect);
    response.set_html_body(format!(
        "<html><body>Redirected to <a href=\"{url}\">{url}</a></body></html>",
        url = location.redirect
    ));
    response
}

fn stylesheet_link(server: &ServerBlock) -> String {
    if server.default_stylesheet.is_empty() {
        String::new()
    } else {
        format!(
            "<link rel=\"stylesheet\" href=\"{}\">",
            server.default_stylesheet
        )
    }
}

/// Build the response for an `HttpError`: a configured error page when one
/// loads, the default page otherwise. 405 always carries `Allow`.
pub fn error_response(
    error: &HttpError,
    server: &ServerBlock,
    location: Option<&LocationBlock>,
) -> Response {
    let mut response = custom_error_page(error.status, server, location)
        .unwrap_or_else(|| Response::from_error(error));

    if error.status == METHOD_NOT_ALLOWED {
        let allow = match location {
            Some(location) => location.allowed_methods_string(),
            None => "GET, POST, DELETE".to_string(),
        };
        response.set_header(headers::ALLOW, &allow);
    }
    response
}

fn custom_error_page(
    status: u16,
    server: &ServerBlock,
    location: Option<&LocationBlock>,
) -> Option<Response> {
    if let Some(location) = location {
        if let Some(page) = location.error_pages.get(&status) {
            let root = effective_root(server, location).ok()?;
            if let Some(response) = load_error_page(status, &join_page_path(root, page)) {
                return Some(response);
            }
        }
    }
    if let Some(page) = server.error_pages.get(&status) {
        return load_error_page(status, &join_page_path(&server.root, page));
    }
    None
}

fn join_page_path(root: &str, page: &str) -> String {
    if page.starts_with('/') {
        format!("{}{}", root.trim_end_matches('/'), page)
    } else {
        format!("{}/{}", root.trim_end_matches('/'), page)
    }
}

fn load_error_page(status: u16, path: &str) -> Option<Response> {
    let bytes = fs::read(path).ok()?;
    let mut response = Response::new();
    response.set_status(status);
    response.set_header(headers::CONTENT_TYPE, "text/html");
    response.set_body(bytes);
    Some(response)
}
