//! Connection lifecycle and capacity management.
//!
//! The registry owns every live session and every listening endpoint:
//! - accepting new sessions and rejecting them once the table is full
//! - handing out stable per-tick snapshots for fair command dispatch
//! - idle timeout detection by role
//! - sweeping sessions marked for disconnect, then draining their last
//!   output over a bounded number of sweeps without ever blocking
//!
//! Listeners are non-blocking std sockets so their handles can be passed
//! to a replacement process image on reboot.

use crate::config::IdleTimeouts;
use crate::connection::{ConnState, Connection, ConnectionId};
use crate::error::{Result, ServerError};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, TcpListener};
use std::time::Instant;

const FULL_MESSAGE: &[u8] = b"The game is full. Please try again later.\r\n";
/// Sweeps a closing session gets to drain its output before it is dropped.
pub const CLOSE_GRACE_TICKS: u32 = 20;

pub struct Listener {
    pub port: u16,
    pub socket: TcpListener,
}

/// A session removed by `sweep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    pub id: ConnectionId,
    pub entity: Option<String>,
    pub address: String,
}

/// A swept session whose output has not fully drained yet.
struct Closing {
    connection: Connection,
    sweeps_left: u32,
}

pub struct ConnectionRegistry {
    listeners: Vec<Listener>,
    connections: HashMap<ConnectionId, Connection>,
    closing: Vec<Closing>,
    next_id: u64,
    max_connections: usize,
    negotiate_telnet: bool,
    /// Traffic of sessions that are already gone
    closed_in: u64,
    closed_out: u64,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, negotiate_telnet: bool) -> Self {
        Self {
            listeners: Vec::new(),
            connections: HashMap::new(),
            closing: Vec::new(),
            next_id: 1,
            max_connections,
            negotiate_telnet,
            closed_in: 0,
            closed_out: 0,
        }
    }

    /// Binds a listening endpoint and returns its port.
    pub fn add_listener(&mut self, addr: &str) -> Result<u16> {
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = TcpListener::bind(addr).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        let port = socket.local_addr().map_err(bind_error)?.port();
        info!("Listening on {} (port {})", addr, port);
        self.listeners.push(Listener { port, socket });
        Ok(port)
    }

    /// Takes over a listening socket that is already bound.
    pub fn adopt_listener(&mut self, socket: TcpListener) -> io::Result<u16> {
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        info!("Resumed listening on port {}", port);
        self.listeners.push(Listener { port, socket });
        Ok(port)
    }

    pub fn listener_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    pub fn take_listeners(&mut self) -> Vec<Listener> {
        std::mem::take(&mut self.listeners)
    }

    /// Accepts every pending connection on every listener.
    pub fn accept_pending(&mut self) -> Vec<ConnectionId> {
        let mut accepted = Vec::new();
        let mut incoming = Vec::new();
        for listener in &self.listeners {
            loop {
                match listener.socket.accept() {
                    Ok(pair) => incoming.push(pair),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Accept failed on port {}: {}", listener.port, e);
                        break;
                    }
                }
            }
        }

        for (stream, peer) in incoming {
            if self.connections.len() >= self.max_connections {
                warn!(
                    "Rejecting {}: connection table full ({})",
                    peer, self.max_connections
                );
                reject(stream);
                continue;
            }
            let adopted = stream
                .set_nonblocking(true)
                .and_then(|_| tokio::net::TcpStream::from_std(stream));
            match adopted {
                Ok(stream) => {
                    let id = self.allocate_id();
                    info!("Connection {} accepted from {}", id, peer);
                    let connection =
                        Connection::new(id, stream, peer.ip().to_string(), self.negotiate_telnet);
                    self.connections.insert(id, connection);
                    accepted.push(id);
                }
                Err(e) => warn!("Could not register connection from {}: {}", peer, e),
            }
        }
        accepted
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Registers an already built connection, e.g. one resumed after reboot.
    pub fn insert(&mut self, connection: Connection) {
        self.next_id = self.next_id.max(connection.id.0 + 1);
        self.connections.insert(connection.id, connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Finds the live session bound to the named player.
    pub fn by_entity(&self, name: &str) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| {
                !c.is_disconnecting()
                    && c.entity
                        .as_deref()
                        .map_or(false, |entity| entity.eq_ignore_ascii_case(name))
            })
            .map(|c| c.id)
    }

    pub fn mark_disconnecting(&mut self, id: ConnectionId) -> bool {
        self.connections
            .get_mut(&id)
            .map_or(false, Connection::mark_disconnecting)
    }

    /// Every connection id in random order, safe to walk while mutating.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.shuffle(&mut rand::thread_rng());
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn read_all(&mut self) -> usize {
        self.connections
            .values_mut()
            .filter(|c| !c.is_disconnecting())
            .map(Connection::read_available)
            .sum()
    }

    pub fn flush_all(&mut self) -> usize {
        self.connections.values_mut().map(Connection::flush).sum()
    }

    /// Marks sessions that exceeded their role's idle limit.
    pub fn check_idle(&mut self, now: Instant, idle: &IdleTimeouts) -> Vec<ConnectionId> {
        let mut timed_out = Vec::new();
        for connection in self.connections.values_mut() {
            if connection.is_disconnecting() {
                continue;
            }
            let Some(limit) = idle.limit_for(connection.role) else {
                continue;
            };
            if connection.is_idle(now, limit) {
                info!(
                    "Connection {} idle for more than {}s",
                    connection.id,
                    limit.as_secs()
                );
                connection.write("\nIdle timeout.\n");
                connection.mark_disconnecting();
                timed_out.push(connection.id);
            }
        }
        timed_out
    }

    /// Removes every session marked for disconnect. Sessions with output
    /// still queued keep draining on later sweeps, for at most
    /// `CLOSE_GRACE_TICKS` sweeps.
    pub fn sweep(&mut self) -> Vec<Closed> {
        self.drain_closing();

        let doomed: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnState::Disconnecting)
            .map(|c| c.id)
            .collect();

        let mut closed = Vec::with_capacity(doomed.len());
        for id in doomed {
            let Some(mut connection) = self.connections.remove(&id) else {
                continue;
            };
            closed.push(Closed {
                id,
                entity: connection.entity.clone(),
                address: connection.address.clone(),
            });
            connection.flush();
            if connection.pending_output() == 0 {
                self.retire(connection);
            } else {
                debug!(
                    "Connection {} closing with {} bytes queued",
                    id,
                    connection.pending_output()
                );
                self.closing.push(Closing {
                    connection,
                    sweeps_left: CLOSE_GRACE_TICKS,
                });
            }
        }
        closed
    }

    fn drain_closing(&mut self) {
        for mut closing in std::mem::take(&mut self.closing) {
            closing.connection.flush();
            closing.sweeps_left = closing.sweeps_left.saturating_sub(1);
            if closing.connection.pending_output() == 0 || closing.sweeps_left == 0 {
                self.retire(closing.connection);
            } else {
                self.closing.push(closing);
            }
        }
    }

    fn retire(&mut self, connection: Connection) {
        let id = connection.id;
        let address = connection.address.clone();
        let (bytes_in, bytes_out) = connection.close();
        self.closed_in += bytes_in;
        self.closed_out += bytes_out;
        debug!("Connection {} from {} closed", id, address);
    }

    /// Closes every session still draining, dropping what it has not sent.
    pub fn close_all(&mut self) {
        for closing in std::mem::take(&mut self.closing) {
            self.retire(closing.connection);
        }
    }

    /// Sessions swept but still draining output.
    pub fn closing_len(&self) -> usize {
        self.closing.len()
    }

    /// Removes every session, e.g. to hand them across a reboot.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.close_all();
        let mut connections: Vec<Connection> =
            self.connections.drain().map(|(_, c)| c).collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    /// Total bytes read and written, including closed sessions.
    pub fn traffic(&self) -> (u64, u64) {
        let (live_in, live_out) = self
            .connections
            .values()
            .chain(self.closing.iter().map(|c| &c.connection))
            .fold((0, 0), |(i, o), c| (i + c.bytes_in, o + c.bytes_out));
        (self.closed_in + live_in, self.closed_out + live_out)
    }

    /// Carries traffic totals over from a previous process image.
    pub fn restore_traffic(&mut self, bytes_in: u64, bytes_out: u64) {
        self.closed_in = bytes_in;
        self.closed_out = bytes_out;
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Accept-then-close for sessions beyond capacity. The notice is a single
/// non-blocking write into a fresh socket buffer.
fn reject(mut stream: std::net::TcpStream) {
    if stream.set_nonblocking(true).is_ok() {
        let _ = stream.write(FULL_MESSAGE);
    }
    let _ = stream.shutdown(Shutdown::Both);
}
