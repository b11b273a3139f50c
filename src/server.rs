//! The server: listening sockets, the connection map and the event loop
//! body that demultiplexes readiness events.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::ServerBlock;
use crate::conn::Connection;
use crate::listener::Listener;
use crate::poller::{self, Event, Poller};

pub struct Server {
    blocks: Vec<ServerBlock>,
    /// One listening socket per port.
    listeners: HashMap<u16, Listener>,
    /// Default virtual host per port (index into `blocks`).
    default_blocks: HashMap<u16, usize>,
    connections: HashMap<RawFd, Connection>,
    poller: Poller,
}

impl Server {
    pub fn new(blocks: Vec<ServerBlock>) -> Result<Server> {
        let mut poller = Poller::new();
        let listeners = setup_listeners(&blocks, &mut poller)?;
        let ports: Vec<u16> = listeners.keys().copied().collect();
        let default_blocks = compute_default_blocks(&blocks, &ports);
        Ok(Server {
            blocks,
            listeners,
            default_blocks,
            connections: HashMap::new(),
            poller,
        })
    }

    /// One iteration of the event loop: sweep, poll, dispatch, then give
    /// in-flight CGI runs a chance to complete or time out.
    pub fn poll_iteration(&mut self) {
        self.sweep_connections();

        let events = match self.poller.poll_once() {
            Ok(events) => events,
            Err(e) => {
                log::error!("poll failed: {}", e);
                return;
            }
        };
        let now = Utc::now().timestamp();

        for event in events {
            if self.listeners.values().any(|l| l.fd() == event.fd) {
                self.accept_connection(event.fd, now);
            } else if self.connections.contains_key(&event.fd) {
                self.dispatch_client_event(&event, now);
            } else {
                self.dispatch_cgi_event(&event, now);
            }
        }

        self.update_cgi_connections(now);
    }

    /// Close every connection and listener (used on shutdown).
    pub fn shutdown(&mut self) {
        let Server {
            connections,
            poller,
            listeners,
            ..
        } = self;
        for (_, mut conn) in connections.drain() {
            conn.teardown(poller);
        }
        for listener in listeners.values_mut() {
            listener.close();
        }
    }

    fn accept_connection(&mut self, listener_fd: RawFd, now: i64) {
        let listener = match self.listeners.values().find(|l| l.fd() == listener_fd) {
            Some(listener) => listener,
            None => return,
        };
        let port = listener.port();
        let (fd, peer) = match listener.accept() {
            Some(client) => client,
            None => return,
        };
        let default_idx = *self.default_blocks.get(&port).unwrap_or(&0);
        let body_cap = self.blocks[default_idx].client_max_body_size;
        log::debug!("accepted connection from {} on port {} (fd {})", peer, port, fd);
        let conn = Connection::new(fd, peer, port, default_idx, body_cap, now, &mut self.poller);
        self.connections.insert(fd, conn);
    }

    fn dispatch_client_event(&mut self, event: &Event, now: i64) {
        let Server {
            connections,
            poller,
            blocks,
            ..
        } = self;
        let conn = match connections.get_mut(&event.fd) {
            Some(conn) => conn,
            None => return,
        };
        if event.error {
            conn.on_error();
        } else {
            if event.readable || event.hup {
                conn.on_readable(blocks, poller, now);
            }
            if event.writable {
                conn.on_writable(blocks, poller, now);
            }
        }
        if conn.finished() {
            if let Some(mut conn) = connections.remove(&event.fd) {
                conn.teardown(poller);
            }
        }
    }

    /// Events on fds we don't own directly belong to some connection's
    /// CGI pipes.
    fn dispatch_cgi_event(&mut self, event: &Event, now: i64) {
        let Server {
            connections,
            poller,
            blocks,
            ..
        } = self;
        for conn in connections.values_mut() {
            if conn.cgi.owns_fd(event.fd) {
                conn.on_cgi_event(
                    event.fd,
                    event.readable,
                    event.writable,
                    event.hup || event.error,
                    blocks,
                    poller,
                    now,
                );
                return;
            }
        }
        log::debug!("event on unknown fd {}", event.fd);
    }

    fn update_cgi_connections(&mut self, now: i64) {
        let Server {
            connections,
            poller,
            blocks,
            ..
        } = self;
        for conn in connections.values_mut() {
            conn.update_cgi(blocks, poller, now);
        }
    }

    /// Idle-timeout pass plus removal of connections marked for close.
    fn sweep_connections(&mut self) {
        let now = Utc::now().timestamp();
        let Server {
            connections,
            poller,
            blocks,
            ..
        } = self;
        for conn in connections.values_mut() {
            conn.check_idle(now, blocks, poller);
        }
        let finished: Vec<RawFd> = connections
            .iter()
            .filter(|(_, conn)| conn.finished())
            .map(|(&fd, _)| fd)
            .collect();
        for fd in finished {
            if let Some(mut conn) = connections.remove(&fd) {
                log::debug!("closing connection fd {}", fd);
                conn.teardown(poller);
            }
        }
    }
}

/// Bind one listener per unique configured port.
fn setup_listeners(
    blocks: &[ServerBlock],
    poller: &mut Poller,
) -> Result<HashMap<u16, Listener>> {
    let mut listeners = HashMap::new();
    for block in blocks {
        for (host, port) in &block.listen {
            if listeners.contains_key(port) {
                continue;
            }
            let listener = Listener::bind(host, *port)
                .with_context(|| format!("failed to set up listener on {}:{}", host, port))?;
            poller
                .watch(listener.fd(), poller::read_interest())
                .context("failed to watch listening socket")?;
            listeners.insert(*port, listener);
        }
    }
    if listeners.is_empty() {
        anyhow::bail!("no listeners configured");
    }
    Ok(listeners)
}

/// For each port: the block flagged `default_server`, else the first
/// block listening there.
fn compute_default_blocks(blocks: &[ServerBlock], ports: &[u16]) -> HashMap<u16, usize> {
    let mut defaults = HashMap::new();
    for &port in ports {
        let mut default_idx = None;
        for (i, block) in blocks.iter().enumerate() {
            if !block.listens_on_port(port) {
                continue;
            }
            if block.is_default {
                default_idx = Some(i);
                break;
            }
            if default_idx.is_none() {
                default_idx = Some(i);
            }
        }
        if let Some(idx) = default_idx {
            defaults.insert(port, idx);
        }
    }
    defaults
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::LocationBlock;

    fn block_on_port(port: u16, is_default: bool) -> ServerBlock {
        let mut block = ServerBlock::default();
        block.listen = vec![("127.0.0.1".to_string(), port)];
        block.is_default = is_default;
        block.root = "/srv".to_string();
        block.locations.push(LocationBlock {
            path: "/".to_string(),
            ..LocationBlock::default()
        });
        block
    }

    #[test]
    fn default_block_prefers_flagged_server() {
        let blocks = vec![
            block_on_port(9090, false),
            block_on_port(9090, true),
            block_on_port(9091, false),
        ];
        let defaults = compute_default_blocks(&blocks, &[9090, 9091]);
        assert_eq!(defaults[&9090], 1);
        assert_eq!(defaults[&9091], 2);
    }

    #[test]
    fn first_block_is_default_when_none_flagged() {
        let blocks = vec![block_on_port(9090, false), block_on_port(9090, false)];
        let defaults = compute_default_blocks(&blocks, &[9090]);
        assert_eq!(defaults[&9090], 0);
    }

    #[test]
    fn listeners_are_deduplicated_per_port() {
        // Port 0 binds an ephemeral port; both blocks share the same
        // configured port so only one listener is created.
        let blocks = vec![block_on_port(0, false), block_on_port(0, false)];
        let mut poller = Poller::new();
        let listeners = setup_listeners(&blocks, &mut poller).unwrap();
        assert_eq!(listeners.len(), 1);
    }
}
