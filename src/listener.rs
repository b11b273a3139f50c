//! Non-blocking IPv4 TCP listening socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::str::FromStr;

use anyhow::{Context, Result};
use nix::sys::socket::{
    accept4, bind, getpeername, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr,
    SockAddr, SockFlag, SockProtocol, SockType,
};
use nix::unistd::close;

const LISTEN_BACKLOG: usize = 128;

/// A bound, listening socket. Accepted clients come back non-blocking and
/// close-on-exec.
#[derive(Debug)]
pub struct Listener {
    fd: RawFd,
    port: u16,
}

impl Listener {
    pub fn bind(host: &str, port: u16) -> Result<Listener> {
        let addr = resolve_bind_addr(host)
            .with_context(|| format!("malformed listen address {}", host))?;

        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )
        .context("failed to create listening socket")?;

        let result = setsockopt(fd, sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")
            .and_then(|_| {
                bind(
                    fd,
                    &SockAddr::Inet(InetAddr::from_std(&SocketAddrV4::new(addr, port).into())),
                )
                .with_context(|| format!("failed to bind port {}", port))
            })
            .and_then(|_| {
                listen(fd, LISTEN_BACKLOG).context("failed to listen on socket")
            });
        if let Err(e) = result {
            close(fd).ok();
            return Err(e);
        }

        log::info!("listening on {}:{}", addr, port);
        Ok(Listener { fd, port })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one client, or None when no connection is pending. Failures
    /// are logged and treated as "none available" so the loop keeps
    /// serving existing connections.
    pub fn accept(&self) -> Option<(RawFd, IpAddr)> {
        let fd = match accept4(self.fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => fd,
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => return None,
            Err(e) => {
                log::warn!("accept() failed: {}", e);
                return None;
            }
        };
        // `accept4` doesn't expose the peer address, so request it separately.
        let peer = match getpeername(fd) {
            Ok(SockAddr::Inet(addr)) => addr.ip().to_std(),
            Ok(_) => {
                log::warn!("getpeername returned unexpected address type");
                close(fd).ok();
                return None;
            }
            Err(e) => {
                log::warn!("getpeername() failed: {}", e);
                close(fd).ok();
                return None;
            }
        };
        Some((fd, peer))
    }

    pub fn close(&mut self) {
        if self.fd != -1 {
            close(self.fd).ok();
            self.fd = -1;
        }
    }
}

fn resolve_bind_addr(host: &str) -> Result<Ipv4Addr> {
    match host {
        "" | "*" | "0.0.0.0" => Ok(Ipv4Addr::UNSPECIFIED),
        "localhost" => Ok(Ipv4Addr::LOCALHOST),
        other => Ipv4Addr::from_str(other).map_err(Into::into),
    }
}
