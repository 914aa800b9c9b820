//! Live reboot: replace the running program while keeping sessions open.
//!
//! `prepare_reboot` saves world state, writes a reboot record naming every
//! listening socket and every surviving session by file descriptor, and
//! releases those descriptors so they stay open across `exec`. The new
//! image starts with `--reboot`, reads the record exactly once, deletes it
//! and rebuilds each session around its inherited socket and the player
//! reloaded from storage.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Result, ServerError};
use crate::server::Server;
use crate::store::Collaborators;
use log::{debug, error, info, warn};
use shared::{load_record, store_record, ListenerRecord, RebootRecord, SessionRecord};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

const SORRY: &str = "\nSorry, we are rebooting. You may reconnect in a few seconds.\n";
const FOCUS: &str = "\nThe world comes back into focus!\n";

/// Toggles close-on-exec for a descriptor.
fn set_inheritable(fd: RawFd, inheritable: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own has no memory-safety effects.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if inheritable {
        flags & !libc::FD_CLOEXEC
    } else {
        flags | libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Everything needed to start the replacement image.
#[derive(Debug)]
pub struct RebootHandoff {
    pub record_path: PathBuf,
    pub record: RebootRecord,
}

impl RebootHandoff {
    /// Replaces the process image. Only returns on failure, after removing
    /// the record so a later start does not resume stale state.
    pub fn exec(self) -> ServerError {
        let program = match std::env::current_exe() {
            Ok(program) => program,
            Err(e) => return self.abort(e),
        };
        let mut args: Vec<OsString> = std::env::args_os()
            .skip(1)
            .filter(|arg| arg != "--reboot" && arg != "-r")
            .collect();
        args.push("--reboot".into());
        if let Some(listener) = self.record.listeners.first() {
            args.push("--port".into());
            args.push(listener.port.to_string().into());
        }

        info!("Replacing process image with {}", program.display());
        let e = Command::new(&program).args(&args).exec();
        self.abort(e)
    }

    fn abort(self, e: io::Error) -> ServerError {
        error!("Reboot failed: {}", e);
        if let Err(remove) = fs::remove_file(&self.record_path) {
            warn!("Could not remove {}: {}", self.record_path.display(), remove);
        }
        ServerError::RebootExec(e)
    }
}

impl Server {
    /// Saves the world and releases every surviving session.
    pub fn prepare_reboot(&mut self) -> Result<RebootHandoff> {
        info!("Preparing reboot with {} connections", self.connections.len());

        let mut healed = 0;
        for player in self.players.values() {
            let mut player = player.borrow_mut();
            if !player.vitals.is_full() {
                player.vitals.restore();
                healed += 1;
            }
        }
        debug!("Restored vitals of {} players", healed);

        // Only sessions bound to a live player survive
        for connection in self.connections.iter_mut() {
            let bound = !connection.is_disconnecting()
                && connection
                    .entity
                    .as_ref()
                    .map_or(false, |name| self.players.contains_key(name));
            if !bound {
                connection.write(SORRY);
                connection.mark_disconnecting();
            }
        }
        for closed in self.connections.sweep() {
            if let Some(name) = closed.entity {
                self.logout(&name);
            }
        }

        let saved = self.save_players();
        self.cache.flush_all()?;
        self.ids.save_if_dirty()?;
        self.dns.save()?;
        info!("Saved {} players before reboot", saved);

        let (bytes_in, bytes_out) = self.connections.traffic();
        let mut record = RebootRecord {
            counters: self.counters.clone(),
            ..RebootRecord::default()
        };
        record.counters.bytes_in = bytes_in;
        record.counters.bytes_out = bytes_out;

        for listener in self.connections.take_listeners() {
            let fd = listener.socket.into_raw_fd();
            set_inheritable(fd, true)?;
            record.listeners.push(ListenerRecord {
                port: listener.port,
                fd,
            });
        }

        for connection in self.connections.drain() {
            let Some(name) = connection.entity.clone() else {
                continue;
            };
            let id = connection.id.0;
            let address = connection.address.clone();
            let hostname = connection.hostname.clone();
            let capabilities = connection.capabilities.clone();
            let fd = connection.into_std()?.into_raw_fd();
            set_inheritable(fd, true)?;
            record.sessions.push(SessionRecord {
                connection: id,
                name,
                fd,
                address,
                hostname,
                capabilities,
            });
        }

        let record_path = self.config.reboot_file();
        store_record(&record_path, &record)
            .map_err(|e| ServerError::Reboot(format!("cannot write reboot record: {}", e)))?;
        info!(
            "Reboot record written: {} listeners, {} sessions",
            record.listeners.len(),
            record.sessions.len()
        );
        Ok(RebootHandoff {
            record_path,
            record,
        })
    }

    /// Rebuilds the server from a reboot record left by the previous image.
    pub fn resume(config: ServerConfig, collaborators: Collaborators) -> Result<Self> {
        let path = config.reboot_file();
        let record: RebootRecord = load_record(&path)
            .map_err(|e| ServerError::Reboot(format!("cannot read {}: {}", path.display(), e)))?;
        fs::remove_file(&path)?;

        let mut server = Server::new(config, collaborators)?;
        server.counters = record.counters.clone();
        server
            .connections
            .restore_traffic(record.counters.bytes_in, record.counters.bytes_out);

        for listener in record.listeners {
            // SAFETY: the descriptor was released by the previous image for
            // exactly this purpose and nothing else owns it.
            let socket = unsafe { TcpListener::from_raw_fd(listener.fd) };
            set_inheritable(listener.fd, false)?;
            server.connections.adopt_listener(socket)?;
        }

        for session in record.sessions {
            // SAFETY: as above.
            let stream = unsafe { TcpStream::from_raw_fd(session.fd) };
            set_inheritable(session.fd, false)?;
            let id = ConnectionId(session.connection);
            let connection = Connection::adopt(
                id,
                stream,
                session.address,
                session.hostname,
                session.capabilities,
            )?;
            server.connections.insert(connection);

            let player = server
                .player_store
                .load(&session.name)?
                .ok_or_else(|| ServerError::Reboot(format!("player {} missing", session.name)))?;
            server.attach(id, player)?;
            server.send(id, FOCUS);
        }

        info!(
            "Resumed {} sessions after reboot (up since {})",
            server.connections.len(),
            server.counters.start_time
        );
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    #[test]
    fn test_inheritable_toggles_cloexec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        assert_ok!(set_inheritable(fd, true));
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        assert_ok!(set_inheritable(fd, false));
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_resume_without_record_fails() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let config = ServerConfig {
            data_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        };
        let collaborators = Collaborators::file_backed(dir, config.start_room.clone());
        let err = Server::resume(config, collaborators).err().unwrap();
        assert!(matches!(err, ServerError::Reboot(_)));
    }

    #[test]
    fn test_exec_failure_removes_record() {
        let dir = tempdir().unwrap();
        let record_path = dir.path().join("reboot.bin");
        store_record(&record_path, &RebootRecord::default()).unwrap();

        let handoff = RebootHandoff {
            record_path: record_path.clone(),
            record: RebootRecord::default(),
        };
        let err = handoff.abort(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, ServerError::RebootExec(_)));
        assert!(!record_path.exists());
    }
}
