//! Integration tests for the runtime core
//!
//! These tests drive a real server over loopback TCP, ticking it by hand
//! so every step of a session is deterministic.

use server::config::ServerConfig;
use server::server::{Exit, Server};
use server::store::Collaborators;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::time::sleep;

fn scratch() -> TempDir {
    tempdir().unwrap()
}

fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: dir.to_path_buf(),
        tick_length_ms: 10,
        resolve_hostnames: false,
        negotiate_telnet: false,
        admins: vec!["Zed".to_string()],
        ..ServerConfig::default()
    }
}

fn start(config: ServerConfig) -> Server {
    let collaborators = Collaborators::file_backed(&config.data_dir, config.start_room.clone());
    Server::bind(config, collaborators).unwrap()
}

fn connect(server: &Server) -> TcpStream {
    let port = server.port().unwrap();
    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(5)))
        .unwrap();
    client
}

/// Reads whatever the server has sent so far. Returns false once the
/// server has closed the socket.
fn drain(client: &mut TcpStream, seen: &mut String) -> bool {
    let mut buf = [0u8; 4096];
    loop {
        match client.read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return true
            }
            Err(_) => return false,
        }
    }
}

/// Ticks the server until `client` has received `needle`.
async fn expect(server: &mut Server, client: &mut TcpStream, needle: &str) -> String {
    let mut seen = String::new();
    for _ in 0..200 {
        server.tick();
        sleep(Duration::from_millis(5)).await;
        drain(client, &mut seen);
        if seen.contains(needle) {
            return seen;
        }
    }
    panic!("never received {:?}, got {:?}", needle, seen);
}

async fn pump(server: &mut Server, ticks: usize) {
    for _ in 0..ticks {
        server.tick();
        sleep(Duration::from_millis(5)).await;
    }
}

async fn login(server: &mut Server, client: &mut TcpStream, name: &str) {
    expect(server, client, "By what name").await;
    client.write_all(format!("{}\r\n", name).as_bytes()).unwrap();
    expect(server, client, &format!("Welcome, {}.", name)).await;
}

/// SESSION LIFECYCLE TESTS
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn login_look_who_quit() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);

        expect(&mut server, &mut client, "By what name").await;
        client.write_all(b"aNN\r\n").unwrap();
        expect(&mut server, &mut client, "Welcome, Ann.").await;
        assert_eq!(server.players_online(), vec!["Ann".to_string()]);

        client.write_all(b"look\n").unwrap();
        expect(&mut server, &mut client, "The Void").await;

        client.write_all(b"who\n").unwrap();
        expect(&mut server, &mut client, "1 total.").await;

        client.write_all(b"quit\n").unwrap();
        expect(&mut server, &mut client, "Goodbye.").await;
        pump(&mut server, 3).await;

        assert!(server.players_online().is_empty());
        assert!(server.connections().is_empty());
        assert!(dir.path().join("players").join("Ann.bin").exists());
    }

    #[tokio::test]
    async fn returning_player_keeps_identity() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));

        let mut first = connect(&server);
        login(&mut server, &mut first, "Briar").await;
        let id = server.player("Briar").unwrap().borrow().id;
        first.write_all(b"quit\n").unwrap();
        expect(&mut server, &mut first, "Goodbye.").await;
        pump(&mut server, 3).await;

        let mut second = connect(&server);
        login(&mut server, &mut second, "Briar").await;
        assert_eq!(server.player("Briar").unwrap().borrow().id, id);
    }

    #[tokio::test]
    async fn invalid_names_are_refused() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);

        expect(&mut server, &mut client, "By what name").await;
        client.write_all(b"X1\n").unwrap();
        expect(&mut server, &mut client, "Names must be 3 to 16 letters.").await;
        assert!(server.players_online().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_privileged_commands_are_reported() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);
        login(&mut server, &mut client, "Ann").await;

        client.write_all(b"dance\n").unwrap();
        expect(&mut server, &mut client, "Unknown command: dance").await;

        // Operator commands are invisible to ordinary players
        client.write_all(b"shutdown\n").unwrap();
        expect(&mut server, &mut client, "Unknown command: shutdown").await;
        assert_eq!(server.players_online(), vec!["Ann".to_string()]);
    }

    #[tokio::test]
    async fn peer_disconnect_logs_player_out() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);
        login(&mut server, &mut client, "Ann").await;

        drop(client);
        for _ in 0..100 {
            pump(&mut server, 1).await;
            if server.players_online().is_empty() {
                break;
            }
        }
        assert!(server.players_online().is_empty());
        assert!(dir.path().join("players").join("Ann.bin").exists());
    }
}

/// CONNECTION MANAGEMENT TESTS
mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn idle_guest_is_disconnected() {
        let dir = scratch();
        let mut config = test_config(dir.path());
        config.idle.guest_secs = 0;
        let mut server = start(config);
        let mut client = connect(&server);

        expect(&mut server, &mut client, "Idle timeout.").await;
        pump(&mut server, 2).await;
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn full_table_rejects_newcomers() {
        let dir = scratch();
        let mut config = test_config(dir.path());
        config.max_connections = 1;
        let mut server = start(config);

        let mut first = connect(&server);
        expect(&mut server, &mut first, "By what name").await;

        let mut second = connect(&server);
        expect(&mut server, &mut second, "The game is full").await;
        assert_eq!(server.connections().len(), 1);
    }

    #[tokio::test]
    async fn one_command_per_tick() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);
        login(&mut server, &mut client, "Ann").await;

        client.write_all(b"dance\nsing\n").unwrap();
        let seen = expect(&mut server, &mut client, "Unknown command: dance").await;
        assert!(!seen.contains("Unknown command: sing"));
        expect(&mut server, &mut client, "Unknown command: sing").await;
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn admin_shutdown_ends_run() {
        let dir = scratch();
        let mut server = start(test_config(dir.path()));
        let mut client = connect(&server);
        login(&mut server, &mut client, "Zed").await;

        client.write_all(b"shutdown\n").unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .expect("run did not finish")
            .unwrap();
        assert!(matches!(exit, Exit::Shutdown));
        assert!(server.connections().is_empty());
        assert_eq!(server.connections().closing_len(), 0);

        let mut seen = String::new();
        drain(&mut client, &mut seen);
        assert!(seen.contains("shutting down"));
        assert!(dir.path().join("players").join("Zed.bin").exists());
        assert!(dir.path().join("ids.bin").exists());
    }

    #[tokio::test]
    async fn reboot_preserves_bound_sessions() {
        let dir = scratch();
        let config = test_config(dir.path());
        let mut server = start(config.clone());
        let port = server.port().unwrap();

        let mut ann = connect(&server);
        login(&mut server, &mut ann, "Ann").await;
        let ann_id = server.player("Ann").unwrap().borrow().id;
        assert!(ann_id.is_some());
        let mut stranger = connect(&server);
        expect(&mut server, &mut stranger, "By what name").await;

        let handoff = server.prepare_reboot().unwrap();
        assert_eq!(handoff.record.sessions.len(), 1);
        assert_eq!(handoff.record.sessions[0].name, "Ann");
        assert!(config.reboot_file().exists());
        drop(server);

        let mut seen = String::new();
        drain(&mut stranger, &mut seen);
        assert!(seen.contains("Sorry, we are rebooting."));

        let collaborators = Collaborators::file_backed(&config.data_dir, config.start_room.clone());
        let mut server = Server::resume(config.clone(), collaborators).unwrap();
        assert!(!config.reboot_file().exists());
        assert_eq!(server.port(), Some(port));
        assert_eq!(server.players_online(), vec!["Ann".to_string()]);
        // Resumed from storage, not created afresh
        assert_eq!(server.player("Ann").unwrap().borrow().id, ann_id);

        expect(&mut server, &mut ann, "The world comes back into focus!").await;
        ann.write_all(b"who\n").unwrap();
        expect(&mut server, &mut ann, "1 total.").await;

        // The listener survived too
        let mut newcomer = connect(&server);
        expect(&mut server, &mut newcomer, "By what name").await;
    }
}
