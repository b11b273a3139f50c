//! Per-client connection: receive, parse, handle, send, keep-alive.
//!
//! A connection owns its request parser and its CGI state. The server
//! dispatches readiness events here; everything else (vhost selection,
//! response sequencing, idle detection, teardown) happens inside.

use std::net::IpAddr;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::socket::{recv, send, MsgFlags};
use nix::unistd::close;

use crate::cgi::{CgiOutcome, CgiState};
use crate::config::ServerBlock;
use crate::error::{HttpError, GATEWAY_TIMEOUT, REQUEST_TIMEOUT};
use crate::handler::{self, CgiContext, CGI_PROCESSING_HEADER};
use crate::headers;
use crate::poller::{self, Poller};
use crate::request::Request;
use crate::response::Response;

const RECV_BUFFER_SIZE: usize = 32768;
const MAX_REQUESTS_PER_CONNECTION: usize = 100;
const IDLE_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ReceiveRequest,
    CgiProcessing,
    SendResponse,
    Done,
}

pub struct Connection {
    fd: RawFd,
    peer: IpAddr,
    /// Listening port this client arrived on.
    port: u16,
    last_active: i64,
    should_close: bool,
    request_count: usize,
    state: ConnState,
    send_buf: Vec<u8>,
    sent: usize,
    request: Request,
    /// Index of the selected virtual host in the config vector.
    server_idx: usize,
    pub cgi: CgiState,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        peer: IpAddr,
        port: u16,
        default_server_idx: usize,
        body_cap: usize,
        now: i64,
        poller: &mut Poller,
    ) -> Connection {
        let mut request = Request::new();
        request.set_max_body_size(body_cap);
        if let Err(e) = poller.watch(fd, poller::read_interest()) {
            log::warn!("failed to watch client fd {}: {}", fd, e);
        }
        Connection {
            fd,
            peer,
            port,
            last_active: now,
            should_close: false,
            request_count: 0,
            state: ConnState::ReceiveRequest,
            send_buf: Vec::new(),
            sent: 0,
            request,
            server_idx: default_server_idx,
            cgi: CgiState::new(),
        }
    }

    /// Ready to be torn down: marked for close with nothing left to send.
    pub fn finished(&self) -> bool {
        self.state == ConnState::Done
            || (self.should_close && self.sent >= self.send_buf.len())
    }

    // ------------------------------------------------------------------
    // Socket events

    pub fn on_readable(&mut self, blocks: &[ServerBlock], poller: &mut Poller, now: i64) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let received = match recv(self.fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                // Peer closed; drain anything pending, then go away.
                self.should_close = true;
                if self.send_buf.len() == self.sent {
                    self.state = ConnState::Done;
                }
                return;
            }
            Ok(received) => received,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return,
            Err(e) => {
                log::warn!("recv failed on fd {}: {}", self.fd, e);
                self.should_close = true;
                self.state = ConnState::Done;
                return;
            }
        };
        self.last_active = now;

        if self.state != ConnState::ReceiveRequest {
            // A response is still in flight; buffer the bytes so pipelined
            // requests are processed strictly in sequence.
            self.request.buffer_bytes(&buf[..received]);
            return;
        }

        match self.request.feed(&buf[..received]) {
            Ok(()) => {
                if self.request.is_complete() {
                    self.process_request(blocks, poller, now);
                }
            }
            Err(error) => self.enqueue_error(&error, blocks, poller),
        }
    }

    pub fn on_writable(&mut self, blocks: &[ServerBlock], poller: &mut Poller, now: i64) {
        if self.sent >= self.send_buf.len() {
            return;
        }
        let sent = match send(self.fd, &self.send_buf[self.sent..], MsgFlags::empty()) {
            Ok(sent) => sent,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return,
            Err(e) => {
                log::warn!("send failed on fd {}: {}", self.fd, e);
                self.should_close = true;
                self.state = ConnState::Done;
                return;
            }
        };
        self.sent += sent;
        self.last_active = now;
        if self.sent < self.send_buf.len() {
            return;
        }

        // Response fully drained.
        self.send_buf.clear();
        self.sent = 0;
        if self.should_close {
            self.state = ConnState::Done;
            return;
        }

        // Keep-alive: recycle for the next request and try any bytes that
        // were pipelined behind the previous one.
        self.state = ConnState::ReceiveRequest;
        self.request.reset();
        self.request
            .set_max_body_size(blocks[self.server_idx].client_max_body_size);
        self.update_interest(poller);
        match self.request.advance() {
            Ok(()) => {
                if self.request.is_complete() {
                    self.process_request(blocks, poller, now);
                }
            }
            Err(error) => self.enqueue_error(&error, blocks, poller),
        }
    }

    pub fn on_error(&mut self) {
        log::debug!("error event on connection fd {}", self.fd);
        self.should_close = true;
        self.state = ConnState::Done;
    }

    // ------------------------------------------------------------------
    // Request lifecycle

    fn process_request(&mut self, blocks: &[ServerBlock], poller: &mut Poller, now: i64) {
        self.select_server_block(blocks);
        let server = &blocks[self.server_idx];
        log::info!(
            "{} {} ({})",
            self.request.method.as_str(),
            self.request.uri.path,
            self.peer
        );

        let response = {
            let mut ctx = CgiContext {
                cgi: &mut self.cgi,
                poller,
                server_port: self.port,
                peer: self.peer,
                now,
            };
            handler::handle_request(&self.request, server, &mut ctx)
        };

        if response.header(CGI_PROCESSING_HEADER) == Some("true") {
            self.state = ConnState::CgiProcessing;
            self.update_interest(poller);
            return;
        }
        let keep_alive = self.request.is_keep_alive();
        self.enqueue_response(response, keep_alive, poller);
    }

    /// Lazy virtual-host selection from the Host header; the listening
    /// port's default server stays when nothing matches.
    fn select_server_block(&mut self, blocks: &[ServerBlock]) {
        let host_header = match self.request.header(headers::HOST) {
            Some(host) => host.to_string(),
            None => return,
        };
        let (host, port) = match host_header.rfind(':') {
            Some(i) => match host_header[i + 1..].parse::<u16>() {
                Ok(port) => (host_header[..i].to_string(), port),
                Err(_) => (host_header.clone(), self.port),
            },
            None => (host_header.clone(), self.port),
        };
        if host.is_empty() {
            return;
        }
        if let Some(idx) = blocks
            .iter()
            .position(|b| b.listens_on_port(port) && b.matches_server_name(&host))
        {
            self.server_idx = idx;
        }
    }

    /// Queue a response, settling connection persistence: explicit close
    /// statuses and the per-connection request cap override keep-alive.
    fn enqueue_response(&mut self, mut response: Response, keep_alive: bool, poller: &mut Poller) {
        let forces_close = HttpError::from_status(response.status()).forces_close();
        self.request_count += 1;
        let keep = keep_alive
            && !forces_close
            && !self.should_close
            && self.request_count < MAX_REQUESTS_PER_CONNECTION;

        response.set_header(headers::CONNECTION, if keep { "keep-alive" } else { "close" });
        self.should_close = !keep;
        self.send_buf = response.build();
        self.sent = 0;
        self.state = ConnState::SendResponse;
        self.update_interest(poller);
    }

    fn enqueue_error(&mut self, error: &HttpError, blocks: &[ServerBlock], poller: &mut Poller) {
        log::warn!("HTTP error on fd {}: {}", self.fd, error);
        let response = handler::error_response(error, &blocks[self.server_idx], None);
        let keep_alive = !error.forces_close() && self.request.is_keep_alive();
        // The parser state (and anything buffered behind the failed
        // request) is unreliable now; start the next request clean.
        self.request = Request::new();
        self.request
            .set_max_body_size(blocks[self.server_idx].client_max_body_size);
        self.enqueue_response(response, keep_alive, poller);
    }

    // ------------------------------------------------------------------
    // CGI plumbing

    pub fn on_cgi_event(
        &mut self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        hup: bool,
        blocks: &[ServerBlock],
        poller: &mut Poller,
        now: i64,
    ) {
        if self.cgi.is_stdout(fd) && (readable || hup) {
            self.cgi.on_stdout_ready();
            if self.cgi.saw_eof() {
                self.update_cgi(blocks, poller, now);
            }
        } else if self.cgi.is_stdin(fd) {
            if hup {
                // Child closed its stdin; stop feeding the body.
                self.cgi.close_stdin(poller);
            } else if writable {
                self.cgi.on_stdin_ready(poller);
            }
        }
    }

    /// Probe an in-flight CGI run for completion or deadline expiry.
    pub fn update_cgi(&mut self, blocks: &[ServerBlock], poller: &mut Poller, now: i64) {
        if !self.cgi.active {
            return;
        }
        if let Some(outcome) = self.cgi.try_complete(poller) {
            let keep_alive = self.request.is_keep_alive();
            match outcome {
                CgiOutcome::Response(response) => {
                    self.enqueue_response(response, keep_alive, poller)
                }
                CgiOutcome::Failed(error) => self.enqueue_error(&error, blocks, poller),
            }
            return;
        }
        if self.cgi.check_timeout(now, poller) {
            let error = HttpError::new(GATEWAY_TIMEOUT, "CGI script timeout");
            self.enqueue_error(&error, blocks, poller);
        }
    }

    // ------------------------------------------------------------------
    // Idle detection and teardown

    /// Enqueue a 408 once the idle window lapses; the response drains
    /// before the socket closes.
    pub fn check_idle(&mut self, now: i64, blocks: &[ServerBlock], poller: &mut Poller) {
        if self.state == ConnState::Done || self.should_close {
            return;
        }
        if now - self.last_active <= IDLE_TIMEOUT_SECS {
            return;
        }
        log::warn!(
            "connection fd {} idle for {}s, timing out",
            self.fd,
            now - self.last_active
        );
        if self.state == ConnState::SendResponse {
            // A stalled send has no room for a 408; just drop the peer.
            self.should_close = true;
            self.state = ConnState::Done;
            return;
        }
        self.cgi.abort(poller);
        let error = HttpError::new(REQUEST_TIMEOUT, "request timeout");
        self.enqueue_error(&error, blocks, poller);
    }

    /// Close the socket and cancel any in-flight CGI child.
    pub fn teardown(&mut self, poller: &mut Poller) {
        self.cgi.abort(poller);
        if self.fd != -1 {
            poller.unwatch(self.fd).ok();
            close(self.fd).ok();
            self.fd = -1;
        }
        self.state = ConnState::Done;
    }

    fn update_interest(&self, poller: &mut Poller) {
        let interest: PollFlags = match self.state {
            ConnState::ReceiveRequest | ConnState::CgiProcessing => poller::read_interest(),
            ConnState::SendResponse => poller::read_interest() | poller::write_interest(),
            ConnState::Done => return,
        };
        if let Err(e) = poller.update(self.fd, interest) {
            log::warn!("failed to update interest for fd {}: {}", self.fd, e);
        }
    }
}
