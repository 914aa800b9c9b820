//! Short-lived helper processes.
//!
//! Each worker writes its result to a pipe and exits. A small task per
//! worker forwards pipe chunks and finally the exit status over a channel;
//! the main loop drains that channel once per tick without ever blocking.
//! DNS results are held until the process has exited. Listing and
//! maintenance output is streamed to the requesting player as it arrives.

use crate::connection::{ConnState, ConnectionId};
use crate::connections::ConnectionRegistry;
use crate::dns::DnsCache;
use crate::error::{Result, ServerError};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Reverse lookup of a client address; correlation is the address
    DnsLookup,
    /// Bulk listing; correlation is the requesting player's name
    Listing,
    /// Offline maintenance job; correlation is the requesting player's name
    Maintenance,
}

impl WorkerKind {
    fn prefix(self) -> &'static str {
        match self {
            WorkerKind::DnsLookup => "",
            WorkerKind::Listing => "List> ",
            WorkerKind::Maintenance => "Audit> ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

#[derive(Debug)]
pub enum WorkerEvent {
    Output {
        id: WorkerId,
        bytes: Vec<u8>,
    },
    Exited {
        id: WorkerId,
        success: bool,
        code: Option<i32>,
        read_failed: bool,
    },
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub kind: WorkerKind,
    pub correlation: String,
    pub started: Instant,
    /// DNS output, or a partial line of streamed output
    buffer: Vec<u8>,
}

/// What one reap cycle accomplished.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub reaped: usize,
    /// (address, hostname) pairs that landed in the DNS cache
    pub resolved: Vec<(String, String)>,
    /// Connections released from waiting on a DNS lookup
    pub released: Vec<ConnectionId>,
}

pub struct WorkerSupervisor {
    records: BTreeMap<WorkerId, WorkerRecord>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            records: BTreeMap::new(),
            next_id: 1,
            events_tx,
            events_rx,
        }
    }
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `command` as a worker and returns immediately.
    pub fn launch(&mut self, kind: WorkerKind, correlation: &str, command: Command) -> Result<WorkerId> {
        let mut command = tokio::process::Command::from(command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command
            .spawn()
            .map_err(|e| ServerError::Worker(format!("cannot launch {:?} worker: {}", kind, e)))?;

        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let pid = child.id();
        let stdout = child.stdout.take();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let mut read_failed = stdout.is_none();
            if let Some(mut stdout) = stdout {
                let mut buf = [0u8; 4096];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let bytes = buf[..n].to_vec();
                            if events.send(WorkerEvent::Output { id, bytes }).is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            read_failed = true;
                            break;
                        }
                    }
                }
            }
            let (success, code) = match child.wait().await {
                Ok(status) => (status.success(), status.code()),
                Err(_) => (false, None),
            };
            let _ = events.send(WorkerEvent::Exited {
                id,
                success,
                code,
                read_failed,
            });
        });

        debug!("Launched {:?} worker {:?} (pid {:?}) for {}", kind, id, pid, correlation);
        self.records.insert(
            id,
            WorkerRecord {
                id,
                pid,
                kind,
                correlation: correlation.to_string(),
                started: Instant::now(),
                buffer: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Consumes everything workers produced since the last call.
    pub fn reap_ready(
        &mut self,
        connections: &mut ConnectionRegistry,
        dns: &mut DnsCache,
        now: u64,
    ) -> ReapReport {
        let mut report = ReapReport::default();
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                WorkerEvent::Output { id, bytes } => self.absorb(id, &bytes, connections),
                WorkerEvent::Exited {
                    id,
                    success,
                    code,
                    read_failed,
                } => {
                    let Some(record) = self.records.remove(&id) else {
                        warn!("Exit reported for unknown worker {:?}", id);
                        continue;
                    };
                    report.reaped += 1;
                    if !success || read_failed {
                        warn!(
                            "{:?} worker for {} (pid {:?}) failed: exit {:?}{}",
                            record.kind,
                            record.correlation,
                            record.pid,
                            code,
                            if read_failed { ", pipe read failed" } else { "" }
                        );
                    }
                    let failed = !success || read_failed;
                    match record.kind {
                        WorkerKind::DnsLookup => {
                            complete_lookup(record, failed, connections, dns, now, &mut report)
                        }
                        _ => complete_stream(record, connections),
                    }
                }
            }
        }
        report
    }

    fn absorb(&mut self, id: WorkerId, bytes: &[u8], connections: &mut ConnectionRegistry) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        record.buffer.extend_from_slice(bytes);
        if record.kind == WorkerKind::DnsLookup {
            return;
        }

        let Some(end) = record.buffer.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete: Vec<u8> = record.buffer.drain(..=end).collect();
        deliver(record.kind, &record.correlation, &complete, connections);
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn complete_lookup(
    record: WorkerRecord,
    failed: bool,
    connections: &mut ConnectionRegistry,
    dns: &mut DnsCache,
    now: u64,
    report: &mut ReapReport,
) {
    let address = record.correlation;
    let answer = String::from_utf8_lossy(&record.buffer)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .unwrap_or_default();
    let hostname = if failed || answer.is_empty() {
        address.clone()
    } else {
        answer
    };

    info!("Resolved {} as {}", address, hostname);
    dns.insert(&address, &hostname, now);

    for connection in connections.iter_mut() {
        if connection.address == address && connection.state == ConnState::LookingUpHost {
            connection.hostname = hostname.clone();
            connection.state = ConnState::Authenticating;
            report.released.push(connection.id);
        }
    }
    report.resolved.push((address, hostname));
}

fn complete_stream(mut record: WorkerRecord, connections: &mut ConnectionRegistry) {
    if !record.buffer.is_empty() {
        record.buffer.push(b'\n');
        let rest = std::mem::take(&mut record.buffer);
        deliver(record.kind, &record.correlation, &rest, connections);
    }
    debug!(
        "{:?} worker for {} finished after {:?}",
        record.kind,
        record.correlation,
        record.started.elapsed()
    );
}

/// Streams complete lines to the requesting player, or drops them if the
/// player is gone.
fn deliver(kind: WorkerKind, correlation: &str, lines: &[u8], connections: &mut ConnectionRegistry) {
    let Some(connection) = connections
        .by_entity(correlation)
        .and_then(|id| connections.get_mut(id))
    else {
        debug!("Discarding {:?} output for departed {}", kind, correlation);
        return;
    };
    for line in lines.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let mut framed = kind.prefix().as_bytes().to_vec();
        framed.extend_from_slice(line);
        framed.push(b'\n');
        connection.write_bytes(&framed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn dns_cache() -> DnsCache {
        DnsCache::new(
            std::env::temp_dir().join("unused-worker-dns.bin"),
            Duration::from_secs(3600),
        )
    }

    async fn reap_all(
        workers: &mut WorkerSupervisor,
        connections: &mut ConnectionRegistry,
        dns: &mut DnsCache,
    ) -> ReapReport {
        let mut total = ReapReport::default();
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let report = workers.reap_ready(connections, dns, 1_000);
            total.reaped += report.reaped;
            total.resolved.extend(report.resolved);
            total.released.extend(report.released);
            if workers.is_empty() {
                break;
            }
        }
        total
    }

    #[tokio::test]
    async fn test_dns_success_populates_cache() {
        let mut workers = WorkerSupervisor::new();
        let mut connections = ConnectionRegistry::new(4, false);
        let mut dns = dns_cache();

        workers
            .launch(WorkerKind::DnsLookup, "10.1.2.3", shell("printf 'gate.example\\n'"))
            .unwrap();
        assert_eq!(workers.len(), 1);

        let report = reap_all(&mut workers, &mut connections, &mut dns).await;
        assert_eq!(report.reaped, 1);
        assert_eq!(dns.lookup("10.1.2.3", 1_000), Some("gate.example"));
    }

    #[tokio::test]
    async fn test_silent_failure_falls_back_to_address() {
        let mut workers = WorkerSupervisor::new();
        let mut connections = ConnectionRegistry::new(4, false);
        let mut dns = dns_cache();

        workers
            .launch(WorkerKind::DnsLookup, "10.9.9.9", shell("exit 3"))
            .unwrap();
        let report = reap_all(&mut workers, &mut connections, &mut dns).await;

        assert_eq!(report.reaped, 1);
        assert_eq!(
            report.resolved,
            vec![("10.9.9.9".to_string(), "10.9.9.9".to_string())]
        );
        assert_eq!(dns.lookup("10.9.9.9", 1_000), Some("10.9.9.9"));
    }

    #[tokio::test]
    async fn test_partial_output_then_crash_falls_back() {
        let mut workers = WorkerSupervisor::new();
        let mut connections = ConnectionRegistry::new(4, false);
        let mut dns = dns_cache();

        workers
            .launch(WorkerKind::DnsLookup, "10.0.0.7", shell("printf 'half'; kill -9 $$"))
            .unwrap();
        reap_all(&mut workers, &mut connections, &mut dns).await;
        assert_eq!(dns.lookup("10.0.0.7", 1_000), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_listing_without_requester_is_drained() {
        let mut workers = WorkerSupervisor::new();
        let mut connections = ConnectionRegistry::new(4, false);
        let mut dns = dns_cache();

        workers
            .launch(WorkerKind::Listing, "Nobody", shell("printf 'a\\nb\\nc\\n'"))
            .unwrap();
        let report = reap_all(&mut workers, &mut connections, &mut dns).await;
        assert_eq!(report.reaped, 1);
        assert!(workers.is_empty());
        assert!(dns.is_empty());
    }

    #[tokio::test]
    async fn test_listing_streams_to_requester() {
        let mut workers = WorkerSupervisor::new();
        let mut connections = ConnectionRegistry::new(4, false);
        let mut dns = dns_cache();

        let port = connections.add_listener("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut id = None;
        for _ in 0..50 {
            if let Some(accepted) = connections.accept_pending().first() {
                id = Some(*accepted);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let id = id.unwrap();
        connections.get_mut(id).unwrap().entity = Some("Ann".to_string());

        workers
            .launch(WorkerKind::Listing, "Ann", shell("printf 'room one\\nroom two'"))
            .unwrap();
        reap_all(&mut workers, &mut connections, &mut dns).await;

        let pending = connections.get(id).unwrap().pending_output();
        let expected = "List> room one\r\nList> room two\r\n".len();
        assert_eq!(pending, expected);
    }
}
