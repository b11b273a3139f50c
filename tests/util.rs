use std::collections::HashMap;
use std::fs::create_dir_all;
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A webserv instance running against a temp directory and a generated
/// configuration file.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Spawn webserv with a configuration produced by `make_config`,
    /// which receives the document root and the chosen port.
    pub fn with_config<F>(make_config: F) -> Self
    where
        F: FnOnce(&Path, u16) -> String,
    {
        let root = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before we
        // start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let config = make_config(root.path(), port);
        let config_path = root.path().join("webserv.conf");
        std::fs::write(&config_path, config).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .args(&["-c", config_path.to_str().expect("path is not valid UTF-8")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to webserv");

        Self {
            _child: child,
            port,
            root,
        }
    }

    /// A single-vhost server with sensible defaults for most tests.
    pub fn basic() -> Self {
        Self::with_config(|root, port| {
            format!(
                "server {{\n\
                 \tlisten 127.0.0.1:{port};\n\
                 \troot {root};\n\
                 \tlocation / {{\n\
                 \t\tmethods GET POST DELETE;\n\
                 \t\tindex index.html;\n\
                 \t}}\n\
                 \tlocation /uploads {{\n\
                 \t\tmethods GET POST DELETE;\n\
                 \t\troot {root}/uploads;\n\
                 \t\tupload_store {root}/uploads;\n\
                 \t}}\n\
                 }}\n",
                port = port,
                root = root.display(),
            )
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        create_dir_all(&path).expect("failed to create directory");
        path
    }

    pub fn create_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("failed to create file");
        path
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw bytes and parse a single response off the stream.
    pub fn request(&self, raw: &str) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw.as_bytes()).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn get(&self, path: &str, extra_headers: &[(&str, &str)]) -> Response {
        let mut raw = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
        for (name, value) in extra_headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        self.request(&raw)
    }
}

/// HTTP response read from webserv.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn status(&self) -> u16 {
        self.response_line
            .split(' ')
            .nth(1)
            .expect("invalid response line")
            .parse()
            .expect("invalid status code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(self.body.as_deref().unwrap_or(b"")).into_owned()
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
