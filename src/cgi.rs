//! Non-blocking CGI/1.1 orchestration.
//!
//! A CGI run forks the script with its stdin/stdout wired to pipes, feeds
//! the request body in as the pipe drains, accumulates the script's
//! output, and synthesizes an HTTP response once the child exits. All pipe
//! I/O goes through the event poller; a wall-clock deadline bounds the
//! child's lifetime.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, execve, fork, pipe, read, write, ForkResult, Pid};

use crate::config::LocationBlock;
use crate::error::{HttpError, INTERNAL_SERVER_ERROR};
use crate::headers::{self, HeaderMap};
use crate::poller::{self, Poller};
use crate::request::{self, Request};
use crate::response::Response;

pub const CGI_TIMEOUT_SECS: i64 = 5;
const CGI_BUFFER_SIZE: usize = 8192;

/// Per-connection CGI lifecycle state. Owned inline by the connection; the
/// server's dispatcher routes pipe events here.
#[derive(Debug, Default)]
pub struct CgiState {
    pub active: bool,
    pid: Option<Pid>,
    /// Read end of the child's stdout; -1 once closed.
    stdout_fd: RawFd,
    /// Write end of the child's stdin; -1 once closed.
    stdin_fd: RawFd,
    started_at: i64,
    output: Vec<u8>,
    /// Snapshot of the originating request (body still to stream in).
    request: Option<Request>,
    body_sent: usize,
    /// Set once the child's stdout reached EOF.
    saw_eof: bool,
}

/// What a completed (or failed) CGI run produced.
pub enum CgiOutcome {
    Response(Response),
    Failed(HttpError),
}

impl CgiState {
    pub fn new() -> CgiState {
        CgiState {
            stdout_fd: -1,
            stdin_fd: -1,
            ..CgiState::default()
        }
    }

    pub fn owns_fd(&self, fd: RawFd) -> bool {
        self.active && (fd == self.stdout_fd || fd == self.stdin_fd)
    }

    pub fn is_stdout(&self, fd: RawFd) -> bool {
        self.active && fd == self.stdout_fd && fd != -1
    }

    pub fn is_stdin(&self, fd: RawFd) -> bool {
        self.active && fd == self.stdin_fd && fd != -1
    }

    /// True once the child closed its stdout; completion can be probed
    /// right away instead of waiting for the next loop iteration.
    pub fn saw_eof(&self) -> bool {
        self.saw_eof
    }

    /// Spawn the script and register its pipe ends with the poller.
    pub fn start(
        &mut self,
        request: Request,
        script_path: &str,
        location: &LocationBlock,
        server_port: u16,
        peer: IpAddr,
        now: i64,
        poller: &mut Poller,
    ) -> Result<(), HttpError> {
        if self.active {
            return Err(HttpError::new(
                INTERNAL_SERVER_ERROR,
                "CGI already in progress on this connection",
            ));
        }
        let interpreter = resolve_interpreter(script_path, location)?;
        let env = build_env(&request, script_path, server_port, peer);

        log::info!("starting CGI: {}", script_path);
        let (pid, stdout_fd, stdin_fd) =
            spawn_child(&interpreter, script_path, &env, request.body.is_empty())?;

        poller
            .watch(stdout_fd, poller::read_interest())
            .map_err(|e| HttpError::new(INTERNAL_SERVER_ERROR, e.to_string()))?;
        if stdin_fd != -1 {
            if let Err(e) = poller.watch(stdin_fd, poller::write_interest()) {
                log::warn!("failed to watch CGI stdin: {}", e);
            }
        }

        self.active = true;
        self.pid = Some(pid);
        self.stdout_fd = stdout_fd;
        self.stdin_fd = stdin_fd;
        self.started_at = now;
        self.output.clear();
        self.body_sent = 0;
        self.saw_eof = false;
        self.request = Some(request);
        Ok(())
    }

    /// Stdout readable: pull up to 8 KiB; EOF marks the stream finished.
    /// An error is would-block; the next event or the reaper will decide.
    pub fn on_stdout_ready(&mut self) {
        let mut buf = [0u8; CGI_BUFFER_SIZE];
        match read(self.stdout_fd, &mut buf) {
            Ok(0) => self.saw_eof = true,
            Ok(n) => self.output.extend_from_slice(&buf[..n]),
            Err(_) => {}
        }
    }

    /// Stdin writable: push the next slice of the request body; close the
    /// pipe once everything is written.
    pub fn on_stdin_ready(&mut self, poller: &mut Poller) {
        let body_done = {
            let body = match &self.request {
                Some(request) => &request.body,
                None => return,
            };
            if self.body_sent < body.len() {
                match write(self.stdin_fd, &body[self.body_sent..]) {
                    Ok(0) => true, // pipe closed under us
                    Ok(n) => {
                        self.body_sent += n;
                        self.body_sent >= body.len()
                    }
                    Err(_) => false, // would-block
                }
            } else {
                true
            }
        };
        if body_done {
            self.close_stdin(poller);
        }
    }

    /// Reap the child if it finished and turn its output into a response.
    pub fn try_complete(&mut self, poller: &mut Poller) -> Option<CgiOutcome> {
        let pid = self.pid?;
        let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(status) => status,
            Err(e) => {
                log::error!("waitpid failed for CGI pid {}: {}", pid, e);
                self.release_fds(poller);
                self.reset();
                return Some(CgiOutcome::Failed(HttpError::new(
                    INTERNAL_SERVER_ERROR,
                    "failed to wait for CGI process",
                )));
            }
        };

        // Drain whatever the child left in the pipe before closing it.
        self.drain_stdout();
        self.release_fds(poller);

        let outcome = match status {
            WaitStatus::Exited(_, 0) => CgiOutcome::Response(parse_output(&self.output)),
            WaitStatus::Exited(_, code) => {
                log::error!("CGI process exited with status {}", code);
                CgiOutcome::Failed(HttpError::new(
                    INTERNAL_SERVER_ERROR,
                    "CGI script execution failed",
                ))
            }
            _ => {
                log::error!("CGI process terminated abnormally");
                CgiOutcome::Failed(HttpError::new(
                    INTERNAL_SERVER_ERROR,
                    "CGI script execution failed",
                ))
            }
        };
        self.reset();
        Some(outcome)
    }

    /// Enforce the wall-clock deadline. Returns true when the child was
    /// killed; the caller answers 504.
    pub fn check_timeout(&mut self, now: i64, poller: &mut Poller) -> bool {
        if !self.active || now - self.started_at < CGI_TIMEOUT_SECS {
            return false;
        }
        log::warn!("CGI execution timed out after {}s", CGI_TIMEOUT_SECS);
        self.kill_child();
        self.release_fds(poller);
        self.reset();
        true
    }

    /// Cancel an in-flight run (connection teardown).
    pub fn abort(&mut self, poller: &mut Poller) {
        if !self.active {
            return;
        }
        log::warn!("cleaning up active CGI process on connection close");
        self.kill_child();
        self.release_fds(poller);
        self.reset();
    }

    fn kill_child(&mut self) {
        if let Some(pid) = self.pid {
            kill(pid, Signal::SIGKILL).ok();
            waitpid(pid, None).ok();
        }
    }

    fn drain_stdout(&mut self) {
        if self.stdout_fd == -1 {
            return;
        }
        let mut buf = [0u8; CGI_BUFFER_SIZE];
        while let Ok(n) = read(self.stdout_fd, &mut buf) {
            if n == 0 {
                break;
            }
            self.output.extend_from_slice(&buf[..n]);
        }
    }

    pub fn close_stdin(&mut self, poller: &mut Poller) {
        if self.stdin_fd != -1 {
            poller.unwatch(self.stdin_fd).ok();
            close(self.stdin_fd).ok();
            self.stdin_fd = -1;
        }
    }

    fn release_fds(&mut self, poller: &mut Poller) {
        if self.stdout_fd != -1 {
            poller.unwatch(self.stdout_fd).ok();
            close(self.stdout_fd).ok();
            self.stdout_fd = -1;
        }
        self.close_stdin(poller);
    }

    fn reset(&mut self) {
        self.active = false;
        self.pid = None;
        self.started_at = 0;
        self.output.clear();
        self.request = None;
        self.body_sent = 0;
        self.saw_eof = false;
    }
}

/// `.cgi` scripts run directly; anything else needs a configured handler.
pub fn resolve_interpreter(
    script_path: &str,
    location: &LocationBlock,
) -> Result<String, HttpError> {
    let extension = match script_path.rfind('.') {
        Some(i) => &script_path[i..],
        None => {
            return Err(HttpError::new(
                INTERNAL_SERVER_ERROR,
                "CGI script has no extension",
            ))
        }
    };
    if extension == ".cgi" {
        return Ok(String::new());
    }
    location
        .cgi_handlers
        .get(extension)
        .cloned()
        .ok_or_else(|| {
            HttpError::new(
                INTERNAL_SERVER_ERROR,
                format!("no CGI handler configured for extension: {}", extension),
            )
        })
}

/// RFC 3875 meta-variables plus `HTTP_*` copies of the request headers.
pub fn build_env(
    request: &Request,
    script_path: &str,
    server_port: u16,
    peer: IpAddr,
) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert(
        "SERVER_SOFTWARE".into(),
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
    );
    env.insert("SERVER_PROTOCOL".into(), request.version.clone());
    env.insert(
        "SERVER_NAME".into(),
        request.header(headers::HOST).unwrap_or("").to_string(),
    );
    env.insert("SERVER_PORT".into(), server_port.to_string());

    env.insert("REQUEST_METHOD".into(), request.method.as_str().into());
    let request_uri = if request.uri.query.is_empty() {
        request.uri.path.clone()
    } else {
        format!("{}?{}", request.uri.path, request.uri.query)
    };
    env.insert("REQUEST_URI".into(), request_uri);
    env.insert("QUERY_STRING".into(), request.uri.query.clone());
    if let Some(content_type) = request.header(headers::CONTENT_TYPE) {
        env.insert("CONTENT_TYPE".into(), content_type.to_string());
    }
    if let Some(content_length) = request.header(headers::CONTENT_LENGTH) {
        env.insert("CONTENT_LENGTH".into(), content_length.to_string());
    }

    let script_name = if request.script_name.is_empty() {
        request.uri.path.clone()
    } else {
        request.script_name.clone()
    };
    env.insert("SCRIPT_NAME".into(), script_name);
    env.insert("SCRIPT_FILENAME".into(), absolute_path(script_path));
    env.insert("PATH_INFO".into(), request.path_info.clone());
    env.insert("PATH_TRANSLATED".into(), String::new());

    env.insert("REMOTE_ADDR".into(), peer.to_string());
    env.insert("REMOTE_HOST".into(), peer.to_string());

    // Same-named request headers were already combined with ", " by the
    // storage policy; combine again here for the special-multiple ones.
    for (name, value) in &request.headers {
        let env_name = headers::cgi_env_name(name);
        match env.get_mut(&env_name) {
            Some(existing) if env_name.starts_with("HTTP_") => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                env.insert(env_name, value.clone());
            }
        }
    }

    env.into_iter().collect()
}

fn absolute_path(path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    match std::env::current_dir() {
        Ok(cwd) => format!("{}/{}", cwd.display(), path),
        Err(_) => path.to_string(),
    }
}

fn script_directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

fn script_filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Fork the child with both pipe ends close-on-exec, returning
/// `(pid, stdout read end, stdin write end)`. The stdin end comes back -1
/// when there is no body to stream.
fn spawn_child(
    interpreter: &str,
    script_path: &str,
    env: &[(String, String)],
    body_is_empty: bool,
) -> Result<(Pid, RawFd, RawFd), HttpError> {
    let absolute_script = absolute_path(script_path);

    let (stdin_read, stdin_write) =
        pipe().map_err(|_| HttpError::new(INTERNAL_SERVER_ERROR, "failed to create CGI pipes"))?;
    let (stdout_read, stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(_) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            return Err(HttpError::new(INTERNAL_SERVER_ERROR, "failed to create CGI pipes"));
        }
    };
    for &fd in &[stdin_read, stdin_write, stdout_read, stdout_write] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).ok();
    }

    let fork_result = unsafe { fork() };
    let child = match fork_result {
        Ok(ForkResult::Child) => {
            exec_child(interpreter, &absolute_script, env, stdin_read, stdout_write);
            // exec_child never returns.
            unreachable!();
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(_) => {
            for &fd in &[stdin_read, stdin_write, stdout_read, stdout_write] {
                close(fd).ok();
            }
            return Err(HttpError::new(INTERNAL_SERVER_ERROR, "failed to fork CGI process"));
        }
    };

    close(stdin_read).ok();
    close(stdout_write).ok();
    for &fd in &[stdout_read, stdin_write] {
        fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).ok();
    }
    let stdin_fd = if body_is_empty {
        close(stdin_write).ok();
        -1
    } else {
        stdin_write
    };
    Ok((child, stdout_read, stdin_fd))
}

/// Child side of the fork: wire the pipes to fds 0/1, move into the
/// script's directory and exec. Exits 1 on any failure.
fn exec_child(
    interpreter: &str,
    absolute_script: &str,
    env: &[(String, String)],
    stdin_read: RawFd,
    stdout_write: RawFd,
) {
    if dup2(stdin_read, libc::STDIN_FILENO).is_err()
        || dup2(stdout_write, libc::STDOUT_FILENO).is_err()
    {
        std::process::exit(1);
    }
    for &fd in &[stdin_read, stdout_write] {
        close(fd).ok();
    }
    if chdir(Path::new(script_directory(absolute_script))).is_err() {
        std::process::exit(1);
    }

    let env_cstrings: Vec<CString> = env
        .iter()
        .filter_map(|(name, value)| CString::new(format!("{}={}", name, value)).ok())
        .collect();
    let env_refs: Vec<&CStr> = env_cstrings.iter().map(|c| c.as_c_str()).collect();

    if interpreter.is_empty() {
        if let Ok(path) = CString::new(absolute_script) {
            let args = [path.as_c_str()];
            execve(path.as_c_str(), &args, &env_refs).ok();
        }
    } else if let (Ok(interp), Ok(script)) = (
        CString::new(interpreter),
        CString::new(script_filename(absolute_script)),
    ) {
        let args = [interp.as_c_str(), script.as_c_str()];
        execve(interp.as_c_str(), &args, &env_refs).ok();
    }
    // execve only returns on failure.
    std::process::exit(1);
}

/// Parse accumulated script output into a response: header block split on
/// the first blank line, `Status:` pseudo-header, `text/html` default.
pub fn parse_output(output: &[u8]) -> Response {
    let mut response = Response::new();

    let (header_block, body) = match request::find(b"\r\n\r\n", output) {
        Some(i) => (&output[..i], &output[i + 4..]),
        None => match request::find(b"\n\n", output) {
            Some(i) => (&output[..i], &output[i + 2..]),
            None => {
                // No separator: the whole output is the body.
                response.set_header(headers::CONTENT_TYPE, "text/html");
                response.set_body(output.to_vec());
                return response;
            }
        },
    };

    let mut cgi_headers = HeaderMap::new();
    let text = String::from_utf8_lossy(header_block);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let colon = match line.find(':') {
            Some(i) => i,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim_start_matches(|c| c == ' ' || c == '\t');
        headers::add(&mut cgi_headers, name, value);
    }

    for (name, value) in &cgi_headers {
        if name.eq_ignore_ascii_case("status") {
            let digits: String = value
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(code) = digits.parse::<u16>() {
                if (100..=599).contains(&code) {
                    response.set_status(code);
                }
            }
        } else {
            response.set_header(name, value);
        }
    }

    if response.header(headers::CONTENT_TYPE).is_none() {
        response.set_header(headers::CONTENT_TYPE, "text/html");
    }
    response.set_body(body.to_vec());
    response
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::Ipv4Addr;

    use test_case::test_case;

    use crate::request::Request;

    fn request_from(raw: &[u8]) -> Request {
        let mut request = Request::new();
        request.feed(raw).unwrap();
        assert!(request.is_complete());
        request
    }

    fn env_lookup<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn build_env_sets_rfc3875_variables() {
        let mut request = request_from(
            b"GET /cgi/env.cgi/extra/bits?q=1 HTTP/1.1\r\nHost: x\r\nUser-Agent: ua\r\n\r\n",
        );
        request.script_name = "/cgi/env.cgi".to_string();
        request.path_info = "/extra/bits".to_string();
        let env = build_env(
            &request,
            "/srv/cgi/env.cgi",
            8080,
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
        );

        assert_eq!(env_lookup(&env, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env_lookup(&env, "SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env_lookup(&env, "SERVER_NAME"), Some("x"));
        assert_eq!(env_lookup(&env, "SERVER_PORT"), Some("8080"));
        assert_eq!(env_lookup(&env, "REQUEST_METHOD"), Some("GET"));
        assert_eq!(
            env_lookup(&env, "REQUEST_URI"),
            Some("/cgi/env.cgi/extra/bits?q=1")
        );
        assert_eq!(env_lookup(&env, "QUERY_STRING"), Some("q=1"));
        assert_eq!(env_lookup(&env, "SCRIPT_NAME"), Some("/cgi/env.cgi"));
        assert_eq!(env_lookup(&env, "SCRIPT_FILENAME"), Some("/srv/cgi/env.cgi"));
        assert_eq!(env_lookup(&env, "PATH_INFO"), Some("/extra/bits"));
        assert_eq!(env_lookup(&env, "PATH_TRANSLATED"), Some(""));
        assert_eq!(env_lookup(&env, "REMOTE_ADDR"), Some("10.1.2.3"));
        assert_eq!(env_lookup(&env, "HTTP_USER_AGENT"), Some("ua"));
        // Body-less GET: no CONTENT_* entries.
        assert_eq!(env_lookup(&env, "CONTENT_LENGTH"), None);
    }

    #[test]
    fn build_env_has_no_duplicate_names() {
        let request = request_from(
            b"GET / HTTP/1.1\r\nHost: x\r\nAccept: a\r\nAccept: b\r\n\r\n",
        );
        let env = build_env(&request, "/s.cgi", 80, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut names: Vec<&str> = env.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        let len = names.len();
        names.dedup();
        assert_eq!(names.len(), len);
        assert_eq!(env_lookup(&env, "HTTP_ACCEPT"), Some("a, b"));
    }

    #[test]
    fn content_headers_are_exported_for_posts() {
        let request = request_from(
            b"POST /f.py HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
        );
        let env = build_env(&request, "/f.py", 80, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(env_lookup(&env, "CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env_lookup(&env, "CONTENT_LENGTH"), Some("2"));
    }

    #[test_case("/srv/cgi/run.cgi", "" ; "direct execution")]
    fn resolve_interpreter_direct(script: &str, expected: &str) {
        let location = LocationBlock::default();
        assert_eq!(resolve_interpreter(script, &location).unwrap(), expected);
    }

    #[test]
    fn resolve_interpreter_uses_handler_map() {
        let mut location = LocationBlock::default();
        location
            .cgi_handlers
            .insert(".py".to_string(), "/usr/bin/python3".to_string());
        assert_eq!(
            resolve_interpreter("/srv/app.py", &location).unwrap(),
            "/usr/bin/python3"
        );
        let err = resolve_interpreter("/srv/app.rb", &location).unwrap_err();
        assert_eq!(err.status, 500);
    }

    #[test]
    fn parse_output_with_status_header() {
        let output = b"Status: 202 Ok\r\nContent-Type: text/plain\r\n\r\nPI=/extra/bits";
        let response = parse_output(output);
        assert_eq!(response.status(), 202);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body(), b"PI=/extra/bits");
    }

    #[test]
    fn parse_output_unix_line_endings() {
        let response = parse_output(b"Content-Type: text/plain\n\nhello");
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body(), b"hello");
    }

    #[test]
    fn parse_output_without_separator_is_all_body() {
        let response = parse_output(b"just some bytes");
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"just some bytes");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn parse_output_defaults_content_type() {
        let response = parse_output(b"X-From-Script: yes\r\n\r\nbody");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
        assert_eq!(response.header("X-From-Script"), Some("yes"));
    }

    #[test_case("Status: 999", 200 ; "out of range is clamped to default")]
    #[test_case("Status: 404 Not Found", 404 ; "leading integer wins")]
    #[test_case("Status: nonsense", 200 ; "unparsable keeps default")]
    fn parse_output_status_edge_cases(status_line: &str, expected: u16) {
        let output = format!("{}\r\n\r\nbody", status_line);
        assert_eq!(parse_output(output.as_bytes()).status(), expected);
    }

    #[test]
    fn script_path_helpers_work() {
        assert_eq!(script_directory("/srv/cgi/run.cgi"), "/srv/cgi");
        assert_eq!(script_directory("/run.cgi"), "/");
        assert_eq!(script_directory("run.cgi"), ".");
        assert_eq!(script_filename("/srv/cgi/run.cgi"), "run.cgi");
        assert_eq!(script_filename("run.cgi"), "run.cgi");
    }
}
