use std::io::Write;
use std::os::unix::fs::PermissionsExt;

mod util;

use util::{Response, Server};

#[test]
fn get_static_file() {
    let server = Server::basic();
    server.create_file("index.html", "hi");
    let response = server.get("/index.html", &[]);
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.body_string(), "hi");
    assert!(response.header("Date").is_some());
    assert!(response.header("Server").is_some());
}

#[test]
fn get_root_serves_index() {
    let server = Server::basic();
    server.create_file("index.html", "front page");
    let response = server.get("/", &[]);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "front page");
}

#[test]
fn get_missing_file_is_404() {
    let server = Server::basic();
    let response = server.get("/not-there.html", &[]);
    assert_eq!(response.status(), 404);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert!(response.body_string().contains("404"));
}

#[test]
fn traversal_is_rejected() {
    let server = Server::basic();
    let response = server.get("/../../etc/passwd", &[]);
    assert_eq!(response.status(), 403);
}

#[test]
fn unknown_method_is_501() {
    let server = Server::basic();
    let response = server.request("BREW / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(response.status(), 501);
}

#[test]
fn missing_host_is_400() {
    let server = Server::basic();
    let response = server.request("GET / HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 400);
    assert_eq!(response.header("Connection"), Some("close"));
}

#[test]
fn method_not_allowed_carries_allow() {
    let server = Server::with_config(|root, port| {
        format!(
            "server {{ listen 127.0.0.1:{}; root {}; location / {{ methods GET; }} }}",
            port,
            root.display()
        )
    });
    let response = server.request(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    );
    assert_eq!(response.status(), 405);
    assert_eq!(response.header("Allow"), Some("GET"));
}

#[test]
fn multipart_upload_then_conflict() {
    let server = Server::basic();
    let body = "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nHELLO\r\n--B--\r\n";
    let raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: localhost\r\n\
         Content-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let response = server.request(&raw);
    assert_eq!(response.status(), 201);
    let uploaded = server.root().join("uploads/a.txt");
    assert_eq!(std::fs::read(&uploaded).unwrap(), b"HELLO");

    // Repeating the exact request conflicts with the existing file.
    let response = server.request(&raw);
    assert_eq!(response.status(), 409);
}

#[test]
fn delete_then_404() {
    let server = Server::basic();
    server.create_dir("uploads");
    server.create_file("uploads/a.txt", "HELLO");

    let raw = "DELETE /uploads/a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let response = server.request(raw);
    assert_eq!(response.status(), 200);
    assert!(!server.root().join("uploads/a.txt").exists());

    let response = server.request(raw);
    assert_eq!(response.status(), 404);
}

#[test]
fn urlencoded_form_is_echoed() {
    let server = Server::basic();
    let body = "name=alice&greeting=hello+there";
    let raw = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\n\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = server.request(&raw);
    assert_eq!(response.status(), 200);
    let html = response.body_string();
    assert!(html.contains("alice"));
    assert!(html.contains("hello there"));
}

#[test]
fn chunked_post_split_across_writes() {
    let server = Server::basic();
    let mut stream = server.stream();
    stream
        .write_all(
            b"POST / HTTP/1.1\r\nHost: localhost\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Transfer-Encoding: chunked\r\n\r\n4\r\nk=ab\r\n0\r\n",
        )
        .unwrap();
    // The final CRLF of the chunked trailer arrives in a second write.
    std::thread::sleep(std::time::Duration::from_millis(50));
    stream.write_all(b"\r\n").unwrap();
    let response = Response::from_reader(&mut stream).unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.body_string().contains("ab"));
}

#[test]
fn pipelined_requests_are_served_in_order() {
    let server = Server::basic();
    server.create_file("a.html", "first");
    server.create_file("b.html", "second");
    let mut stream = server.stream();
    stream
        .write_all(
            b"GET /a.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /b.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();
    let first = Response::from_reader(&mut stream).unwrap();
    let second = Response::from_reader(&mut stream).unwrap();
    assert_eq!(first.body_string(), "first");
    assert_eq!(second.body_string(), "second");
}

#[test]
fn keep_alive_caps_at_one_hundred_requests() {
    let server = Server::basic();
    server.create_file("index.html", "hi");
    let mut stream = server.stream();
    for i in 1..=100 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let response = Response::from_reader(&mut stream).unwrap();
        assert_eq!(response.status(), 200);
        if i < 100 {
            assert_eq!(response.header("Connection"), Some("keep-alive"), "request {}", i);
        } else {
            assert_eq!(response.header("Connection"), Some("close"));
        }
    }
}

#[test]
fn redirect_location() {
    let server = Server::with_config(|root, port| {
        format!(
            "server {{ listen 127.0.0.1:{}; root {}; \
             location / {{ }} \
             location /old {{ return 301 http://example.com/new; }} }}",
            port,
            root.display()
        )
    });
    let response = server.get("/old/page", &[]);
    assert_eq!(response.status(), 301);
    assert_eq!(response.header("Location"), Some("http://example.com/new"));
    assert!(response.body_string().contains("example.com/new"));
}

#[test]
fn autoindex_directory_listing() {
    let server = Server::with_config(|root, port| {
        format!(
            "server {{ listen 127.0.0.1:{}; root {}; \
             location / {{ autoindex on; }} }}",
            port,
            root.display()
        )
    });
    server.create_file("visible.txt", "x");
    server.create_dir("subdir");
    server.create_file(".hidden", "secret");
    let response = server.get("/", &[]);
    assert_eq!(response.status(), 200);
    let html = response.body_string();
    assert!(html.contains("visible.txt"));
    assert!(html.contains("subdir/"));
    assert!(!html.contains(".hidden"));
}

#[test]
fn custom_error_page_is_served() {
    let server = Server::with_config(|root, port| {
        format!(
            "server {{ listen 127.0.0.1:{}; root {}; \
             error_page 404 /custom404.html; \
             location / {{ }} }}",
            port,
            root.display()
        )
    });
    server.create_file("custom404.html", "it is gone, friend");
    let response = server.get("/missing", &[]);
    assert_eq!(response.status(), 404);
    assert_eq!(response.body_string(), "it is gone, friend");
}

#[test]
fn virtual_host_selection() {
    let server = Server::with_config(|root, port| {
        let site_a = root.join("a");
        let site_b = root.join("b");
        std::fs::create_dir_all(&site_a).unwrap();
        std::fs::create_dir_all(&site_b).unwrap();
        std::fs::write(site_a.join("index.html"), "site a").unwrap();
        std::fs::write(site_b.join("index.html"), "site b").unwrap();
        format!(
            "server {{ listen 127.0.0.1:{port}; server_name a.test; default_server; \
             root {a}; location / {{ index index.html; }} }}\n\
             server {{ listen 127.0.0.1:{port}; server_name b.test; \
             root {b}; location / {{ index index.html; }} }}",
            port = port,
            a = site_a.display(),
            b = site_b.display(),
        )
    });

    let response = server.request(&format!(
        "GET / HTTP/1.1\r\nHost: b.test:{}\r\n\r\n",
        server.port()
    ));
    assert_eq!(response.body_string(), "site b");

    // Unknown host falls back to the port's default server.
    let response = server.request("GET / HTTP/1.1\r\nHost: unknown.test\r\n\r\n");
    assert_eq!(response.body_string(), "site a");
}

#[test]
fn cgi_script_with_path_info() {
    let server = Server::with_config(|root, port| {
        let cgi_dir = root.join("cgi");
        std::fs::create_dir_all(&cgi_dir).unwrap();
        let script = cgi_dir.join("env.cgi");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'Status: 202 Ok\\r\\nContent-Type: text/plain\\r\\n\\r\\n'\n\
             printf 'PI=%s UA=%s' \"$PATH_INFO\" \"$HTTP_USER_AGENT\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        format!(
            "server {{ listen 127.0.0.1:{port}; root {root}; \
             location / {{ }} \
             location /cgi {{ methods GET POST; root {root}/cgi; cgi_handler .sh /bin/sh; }} }}",
            port = port,
            root = root.display()
        )
    });

    let response = server.get("/cgi/env.cgi/extra/bits?q=1", &[("User-Agent", "ua")]);
    assert_eq!(response.status(), 202);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body_string(), "PI=/extra/bits UA=ua");
}

#[test]
fn cgi_post_body_reaches_script() {
    let server = Server::with_config(|root, port| {
        let cgi_dir = root.join("cgi");
        std::fs::create_dir_all(&cgi_dir).unwrap();
        let script = cgi_dir.join("echo.cgi");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        format!(
            "server {{ listen 127.0.0.1:{port}; root {root}; \
             location / {{ }} \
             location /cgi {{ methods GET POST; root {root}/cgi; cgi_handler .sh /bin/sh; }} }}",
            port = port,
            root = root.display()
        )
    });

    let body = "payload through a pipe";
    let response = server.request(&format!(
        "POST /cgi/echo.cgi HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    ));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), body);
}

#[test]
fn cgi_timeout_is_504() {
    let server = Server::with_config(|root, port| {
        let cgi_dir = root.join("cgi");
        std::fs::create_dir_all(&cgi_dir).unwrap();
        let script = cgi_dir.join("slow.cgi");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        format!(
            "server {{ listen 127.0.0.1:{port}; root {root}; \
             location / {{ }} \
             location /cgi {{ root {root}/cgi; cgi_handler .sh /bin/sh; }} }}",
            port = port,
            root = root.display()
        )
    });

    let mut stream = server.stream();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(10)))
        .unwrap();
    stream
        .write_all(b"GET /cgi/slow.cgi HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = Response::from_reader(&mut stream).unwrap();
    assert_eq!(response.status(), 504);
}

#[test]
fn payload_over_limit_is_413() {
    let server = Server::with_config(|root, port| {
        format!(
            "server {{ listen 127.0.0.1:{}; root {}; client_max_body_size 1k; \
             location / {{ methods GET POST; }} }}",
            port,
            root.display()
        )
    });
    let response = server.request(&format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        10 * 1024
    ));
    assert_eq!(response.status(), 413);
    assert_eq!(response.header("Connection"), Some("close"));
}

#[test]
fn bad_config_fails_startup() {
    use std::process::Command;
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bad.conf");
    std::fs::write(&config_path, "server { nonsense; }").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_webserv"))
        .args(&["-c", config_path.to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn help_exits_zero() {
    use std::process::Command;
    let output = Command::new(env!("CARGO_BIN_EXE_webserv"))
        .arg("-h")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("usage"));
}
