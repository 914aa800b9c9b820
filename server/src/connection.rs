//! A single client session.
//!
//! Sockets are never awaited directly. The main loop awaits its tick timer,
//! the reactor records socket readiness while it sleeps, and each tick the
//! connection drains whatever is available with non-blocking calls. Output
//! is buffered and flushed once per tick.

use crate::telnet::{escape, TelnetParser};
use crate::world::Role;
use log::{debug, warn};
use shared::Capabilities;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Longest input line kept; anything past it is dropped.
const MAX_LINE: usize = 1024;
/// Output buffered for a client that is not reading before the session is dropped.
pub const MAX_OUTPUT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for a DNS worker before showing the login prompt
    LookingUpHost,
    Authenticating,
    Playing,
    ViewingFile,
    Disconnecting,
}

#[derive(Debug)]
struct Pager {
    lines: Vec<String>,
    position: usize,
    page_length: usize,
    resume: ConnState,
}

pub struct Connection {
    pub id: ConnectionId,
    stream: Option<TcpStream>,
    pub address: String,
    pub hostname: String,
    pub state: ConnState,
    pub role: Role,
    pub capabilities: Capabilities,
    telnet: Option<TelnetParser>,
    pub last_activity: Instant,
    /// Name of the bound player, if logged in
    pub entity: Option<String>,
    input: Vec<u8>,
    commands: VecDeque<String>,
    output: Vec<u8>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pager: Option<Pager>,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, address: String, negotiate_telnet: bool) -> Self {
        let mut connection = Self {
            id,
            stream: Some(stream),
            hostname: address.clone(),
            address,
            state: ConnState::LookingUpHost,
            role: Role::Guest,
            capabilities: Capabilities::default(),
            telnet: None,
            last_activity: Instant::now(),
            entity: None,
            input: Vec::new(),
            commands: VecDeque::new(),
            output: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            pager: None,
        };
        if negotiate_telnet {
            let mut parser = TelnetParser::new();
            let offer = parser.offer();
            connection.output.extend_from_slice(&offer);
            connection.telnet = Some(parser);
        }
        connection
    }

    /// Rebuilds a session from a socket inherited across a reboot.
    pub fn adopt(
        id: ConnectionId,
        stream: std::net::TcpStream,
        address: String,
        hostname: String,
        capabilities: Capabilities,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        Ok(Self {
            id,
            stream: Some(stream),
            address,
            hostname,
            state: ConnState::Authenticating,
            role: Role::Guest,
            capabilities,
            // Options were already negotiated by the previous image
            telnet: Some(TelnetParser::new()),
            last_activity: Instant::now(),
            entity: None,
            input: Vec::new(),
            commands: VecDeque::new(),
            output: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            pager: None,
        })
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnState::Disconnecting
    }

    /// Returns true only the first time it is called.
    pub fn mark_disconnecting(&mut self) -> bool {
        if self.is_disconnecting() {
            return false;
        }
        debug!("Connection {} marked for disconnect", self.id);
        self.state = ConnState::Disconnecting;
        self.pager = None;
        true
    }

    pub fn is_idle(&self, now: Instant, limit: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > limit
    }

    /// Drains readable bytes into the command queue. A closed or failed
    /// socket marks the connection for disconnect.
    pub fn read_available(&mut self) -> usize {
        let Some(stream) = self.stream.as_ref() else {
            return 0;
        };
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        let mut closed = false;
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Read error on connection {}: {}", self.id, e);
                    closed = true;
                    break;
                }
            }
        }

        if !received.is_empty() {
            self.bytes_in += received.len() as u64;
            self.last_activity = Instant::now();
            self.absorb(&received);
        }
        if closed {
            debug!("Connection {} closed by peer", self.id);
            self.mark_disconnecting();
        }
        received.len()
    }

    fn absorb(&mut self, bytes: &[u8]) {
        let data = match self.telnet.as_mut() {
            Some(parser) => {
                let parsed = parser.feed(bytes, &mut self.capabilities);
                self.output.extend_from_slice(&parsed.replies);
                parsed.data
            }
            None => bytes.to_vec(),
        };

        for byte in data {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.input).trim().to_string();
                    self.input.clear();
                    self.commands.push_back(line);
                }
                b'\r' | 0 => {}
                b => {
                    if self.input.len() < MAX_LINE {
                        self.input.push(b);
                    }
                }
            }
        }
    }

    pub fn pop_command(&mut self) -> Option<String> {
        self.commands.pop_front()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Queues text, turning bare newlines into CRLF.
    pub fn write(&mut self, text: &str) {
        self.queue(text.as_bytes());
    }

    /// Queues raw bytes produced elsewhere, e.g. by a worker.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.telnet.is_some() {
            self.queue(&escape(bytes));
        } else {
            self.queue(bytes);
        }
    }

    fn queue(&mut self, bytes: &[u8]) {
        if self.stream.is_none() {
            return;
        }
        let mut previous = 0u8;
        for &byte in bytes {
            if byte == b'\n' && previous != b'\r' {
                self.output.push(b'\r');
            }
            self.output.push(byte);
            previous = byte;
        }
        if self.output.len() > MAX_OUTPUT {
            warn!(
                "Connection {} has {} bytes unread, dropping it",
                self.id,
                self.output.len()
            );
            self.output.clear();
            self.mark_disconnecting();
        }
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Writes as much buffered output as the socket accepts right now.
    pub fn flush(&mut self) -> usize {
        let Some(stream) = self.stream.as_ref() else {
            return 0;
        };
        let mut written = 0;
        while written < self.output.len() {
            match stream.try_write(&self.output[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Write error on connection {}: {}", self.id, e);
                    self.output.clear();
                    self.mark_disconnecting();
                    return written;
                }
            }
        }
        self.output.drain(..written);
        self.bytes_out += written as u64;
        written
    }

    /// Takes the socket out of the reactor after one last non-blocking
    /// write. Whatever the socket does not accept is dropped.
    fn release(&mut self) -> io::Result<std::net::TcpStream> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket already released"))?;
        let mut stream = stream.into_std()?;
        let mut written = 0;
        while written < self.output.len() {
            match stream.write(&self.output[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.output.drain(..written);
        self.bytes_out += written as u64;
        if !self.output.is_empty() {
            warn!(
                "Connection {} released with {} bytes unsent",
                self.id,
                self.output.len()
            );
            self.output.clear();
        }
        Ok(stream)
    }

    /// Shuts the socket down and returns the session's traffic totals.
    pub fn close(mut self) -> (u64, u64) {
        match self.release() {
            Ok(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Err(e) => debug!("Closing connection {}: {}", self.id, e),
        }
        (self.bytes_in, self.bytes_out)
    }

    /// Releases the socket for a handoff.
    pub fn into_std(mut self) -> io::Result<std::net::TcpStream> {
        self.release()
    }

    /// Switches to paged viewing of `text`, showing the first page.
    pub fn page_text(&mut self, text: &str, page_length: usize) {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        if lines.len() <= page_length {
            self.write(text);
            if !text.ends_with('\n') {
                self.write("\n");
            }
            return;
        }
        let resume = match self.state {
            ConnState::ViewingFile => self.pager.as_ref().map_or(ConnState::Playing, |p| p.resume),
            other => other,
        };
        self.pager = Some(Pager {
            lines,
            position: 0,
            page_length: page_length.max(1),
            resume,
        });
        self.state = ConnState::ViewingFile;
        self.show_page();
    }

    /// Handles one input line while viewing a paged file.
    pub fn pager_input(&mut self, line: &str) {
        if line.eq_ignore_ascii_case("q") {
            self.leave_pager();
            return;
        }
        self.show_page();
    }

    fn show_page(&mut self) {
        let Some(pager) = self.pager.as_mut() else {
            return;
        };
        let end = (pager.position + pager.page_length).min(pager.lines.len());
        let page = pager.lines[pager.position..end].join("\n");
        pager.position = end;
        let finished = end >= pager.lines.len();

        self.write(&page);
        self.write("\n");
        if finished {
            self.leave_pager();
        } else {
            self.write("[Hit Return, Q to Quit]\n");
        }
    }

    fn leave_pager(&mut self) {
        if let Some(pager) = self.pager.take() {
            if !self.is_disconnecting() {
                self.state = pager.resume;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::net::TcpListener;

    /// Returns the server side as a `Connection` and the raw client socket.
    async fn pair(telnet: bool) -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(ConnectionId(1), stream, peer.ip().to_string(), telnet);
        (connection, client)
    }

    async fn read_until_command(connection: &mut Connection) -> Option<String> {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            connection.read_available();
            if let Some(command) = connection.pop_command() {
                return Some(command);
            }
        }
        None
    }

    #[tokio::test]
    async fn test_lines_become_commands() {
        let (mut connection, mut client) = pair(false).await;
        client.write_all(b"look\r\nwho\n").unwrap();

        assert_eq!(read_until_command(&mut connection).await.as_deref(), Some("look"));
        assert_eq!(read_until_command(&mut connection).await.as_deref(), Some("who"));
        assert_eq!(connection.bytes_in, 10);
    }

    #[tokio::test]
    async fn test_peer_close_marks_disconnecting() {
        let (mut connection, client) = pair(false).await;
        drop(client);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            connection.read_available();
            if connection.is_disconnecting() {
                break;
            }
        }
        assert!(connection.is_disconnecting());
    }

    #[tokio::test]
    async fn test_write_converts_newlines() {
        let (mut connection, _client) = pair(false).await;
        connection.write("one\ntwo\r\n");
        assert_eq!(connection.output, b"one\r\ntwo\r\n");
    }

    #[tokio::test]
    async fn test_telnet_offer_queued_and_stripped() {
        let (mut connection, mut client) = pair(true).await;
        assert_eq!(connection.pending_output(), 6);

        client
            .write_all(&[255, 251, 31, 255, 250, 31, 0, 100, 0, 40, 255, 240, b'h', b'i', b'\n'])
            .unwrap();
        assert_eq!(read_until_command(&mut connection).await.as_deref(), Some("hi"));
        assert_eq!(connection.capabilities.width, 100);
        assert_eq!(connection.capabilities.height, 40);
    }

    #[tokio::test]
    async fn test_mark_disconnecting_is_idempotent() {
        let (mut connection, _client) = pair(false).await;
        assert!(connection.mark_disconnecting());
        assert!(!connection.mark_disconnecting());
        assert_eq!(connection.state, ConnState::Disconnecting);
    }

    #[tokio::test]
    async fn test_close_delivers_last_message() {
        let (mut connection, mut client) = pair(false).await;
        connection.write("Goodbye.\n");
        connection.mark_disconnecting();
        let (_, bytes_out) = connection.close();
        assert_eq!(bytes_out, 10);

        let mut received = String::new();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.read_to_string(&mut received).unwrap();
        assert_eq!(received, "Goodbye.\r\n");
    }

    #[tokio::test]
    async fn test_unread_output_is_capped() {
        let (mut connection, _client) = pair(false).await;
        let chunk = "x".repeat(64 * 1024);
        for _ in 0..(MAX_OUTPUT / chunk.len()) {
            connection.write(&chunk);
        }
        assert!(!connection.is_disconnecting());
        assert_eq!(connection.pending_output(), MAX_OUTPUT);

        connection.write("one more line\n");
        assert!(connection.is_disconnecting());
        assert_eq!(connection.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_idle_check() {
        let (mut connection, _client) = pair(false).await;
        let now = Instant::now();
        connection.last_activity = now - Duration::from_secs(301);
        assert!(connection.is_idle(now, Duration::from_secs(300)));
        assert!(!connection.is_idle(now, Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_pager_walks_pages_and_restores_state() {
        let (mut connection, _client) = pair(false).await;
        connection.state = ConnState::Playing;
        let text: String = (1..=5).map(|n| format!("line {}\n", n)).collect();

        connection.page_text(&text, 2);
        assert_eq!(connection.state, ConnState::ViewingFile);
        connection.pager_input("");
        assert_eq!(connection.state, ConnState::ViewingFile);
        connection.pager_input("");
        assert_eq!(connection.state, ConnState::Playing);

        let shown = String::from_utf8(connection.output.clone()).unwrap();
        assert!(shown.contains("line 1"));
        assert!(shown.contains("line 5"));
    }

    #[tokio::test]
    async fn test_pager_quit() {
        let (mut connection, _client) = pair(false).await;
        connection.state = ConnState::Playing;
        let text: String = (1..=10).map(|n| format!("line {}\n", n)).collect();
        connection.page_text(&text, 3);
        connection.pager_input("q");
        assert_eq!(connection.state, ConnState::Playing);
        let shown = String::from_utf8(connection.output.clone()).unwrap();
        assert!(!shown.contains("line 4"));
    }
}
