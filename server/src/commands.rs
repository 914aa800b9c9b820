//! Login and the thin command layer over the runtime.
//!
//! Game commands proper live outside the runtime core; what is here is
//! enough to log in, look around, and operate the server. Failures are
//! reported to the issuing connection only.

use crate::connection::ConnectionId;
use crate::error::ServerError;
use crate::server::{Server, Transition};
use crate::store::{canonical_name, is_valid_name};
use crate::workers::WorkerKind;
use crate::world::{Player, Role};
use log::{error, info, warn};
use shared::CacheKey;
use std::fmt::Write as _;

impl Server {
    pub(crate) fn login(&mut self, id: ConnectionId, line: &str) {
        let name = line.trim();
        if name.is_empty() {
            self.prompt_login(id);
            return;
        }
        if !is_valid_name(name) {
            self.send(id, "Names must be 3 to 16 letters.\n");
            self.prompt_login(id);
            return;
        }
        let name = canonical_name(name);
        if self.players.contains_key(&name) {
            self.send(id, "That character is already playing.\n");
            self.prompt_login(id);
            return;
        }

        let player = match self.player_store.load(&name) {
            Ok(Some(player)) => player,
            Ok(None) => {
                info!("Creating new character {}", name);
                Player::new(
                    name.clone(),
                    self.config.role_for(&name),
                    self.config.start_room.clone(),
                )
            }
            Err(e) => {
                error!("Could not load {}: {}", name, e);
                self.send(id, "That character cannot be loaded right now.\n");
                self.prompt_login(id);
                return;
            }
        };

        match self.attach(id, player) {
            Ok(_) => {
                info!("{} logged in", name);
                self.send(id, &format!("\nWelcome, {}.\n\n", name));
                self.look(id);
            }
            Err(ServerError::IdentityConflict { id: entity }) => {
                warn!("Refusing login of {}: {} is held by another session", name, entity);
                self.send(id, "That character is already in use.\n");
                self.connections.mark_disconnecting(id);
            }
            Err(e) => {
                error!("Could not place {} in the world: {}", name, e);
                self.send(id, "The world cannot receive you right now.\n");
                self.connections.mark_disconnecting(id);
            }
        }
    }

    pub(crate) fn interpret(&mut self, id: ConnectionId, line: &str) {
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb.to_lowercase(), args.trim()),
            None => (line.to_lowercase(), ""),
        };
        let role = self
            .connections
            .get(id)
            .map_or(Role::Guest, |connection| connection.role);
        let staff = role.is_staff();
        let admin = role == Role::Admin;

        match verb.as_str() {
            "" => {}
            "who" => self.who(id, staff),
            "look" | "l" => self.look(id),
            "quit" => self.quit(id),
            "list" if staff => self.launch_job(id, WorkerKind::Listing, args),
            "audit" if admin => self.launch_job(id, WorkerKind::Maintenance, args),
            "dns" if staff => self.show_dns(id),
            "cache" if staff => self.show_cache(id),
            "active" if staff => self.show_active(id),
            "goto" if staff => self.goto(id, args),
            "resave" if staff => self.resave_room(id),
            "reload" if staff => self.reload_room(id),
            "reboot" if admin => {
                info!("Reboot requested");
                self.send(id, "Rebooting.\n");
                self.request(Transition::Reboot);
            }
            "shutdown" if admin => {
                info!("Shutdown requested");
                self.request(Transition::Shutdown);
            }
            _ => self.send(id, &format!("Unknown command: {}\n", verb)),
        }
    }

    fn bound_player(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(id).and_then(|c| c.entity.clone())
    }

    fn who(&mut self, id: ConnectionId, staff: bool) {
        let mut text = String::from("Players online:\n");
        for connection in self.connections.iter() {
            let Some(name) = connection.entity.as_deref() else {
                continue;
            };
            if staff {
                let _ = writeln!(text, "  {:<16} {:?}  {}", name, connection.role, connection.hostname);
            } else {
                let _ = writeln!(text, "  {}", name);
            }
        }
        let _ = writeln!(text, "{} total.", self.players.len());
        self.send(id, &text);
    }

    pub(crate) fn look(&mut self, id: ConnectionId) {
        let Some(name) = self.bound_player(id) else {
            return;
        };
        let Some(key) = self.players.get(&name).map(|p| p.borrow().room.clone()) else {
            return;
        };
        let Some(room) = self.cache.rooms.get(&key) else {
            self.send(id, "You are nowhere.\n");
            return;
        };

        let text = {
            let room = room.borrow();
            let mut text = format!("{}\n{}\n", room.name, room.description);
            for mobile in &room.mobiles {
                let _ = writeln!(text, "{} is here.", mobile.borrow().name);
            }
            for item in &room.items {
                let _ = writeln!(text, "You see {}.", item.borrow().name);
            }
            let others: Vec<&str> = room
                .occupants
                .iter()
                .map(String::as_str)
                .filter(|other| *other != name)
                .collect();
            if !others.is_empty() {
                let _ = writeln!(text, "Also here: {}.", others.join(", "));
            }
            text
        };
        self.send(id, &text);
    }

    fn quit(&mut self, id: ConnectionId) {
        if let Some(name) = self.bound_player(id) {
            if let Some(player) = self.players.get(&name) {
                if let Err(e) = self.player_store.save(&player.borrow()) {
                    error!("Could not save {}: {}", name, e);
                }
            }
        }
        self.send(id, "Goodbye.\n");
        self.connections.mark_disconnecting(id);
    }

    fn launch_job(&mut self, id: ConnectionId, kind: WorkerKind, args: &str) {
        let Some(name) = self.bound_player(id) else {
            return;
        };
        let command = match kind {
            WorkerKind::Listing => {
                let dir = self.config.players_dir().display().to_string();
                self.worker_command(&["list", &dir, args])
            }
            WorkerKind::Maintenance => {
                let dir = self.config.data_dir.display().to_string();
                self.worker_command(&["audit", &dir])
            }
            WorkerKind::DnsLookup => return,
        };
        let launched = command.and_then(|command| self.workers.launch(kind, &name, command));
        match launched {
            Ok(worker) => {
                info!("{} started {:?} worker {:?}", name, kind, worker);
                self.send(id, "Working on it...\n");
            }
            Err(e) => {
                warn!("{} could not start {:?} worker: {}", name, kind, e);
                self.send(id, "That job could not be started.\n");
            }
        }
    }

    fn show_dns(&mut self, id: ConnectionId) {
        let mut text = String::new();
        for record in self.dns.records() {
            let _ = writeln!(text, "{:<40} {:<40} {}", record.address, record.hostname, record.resolved_at);
        }
        let _ = writeln!(text, "{} cached hostnames.", self.dns.len());
        let page_length = self.config.page_length;
        if let Some(connection) = self.connections.get_mut(id) {
            connection.page_text(&text, page_length);
        }
    }

    fn show_cache(&mut self, id: ConnectionId) {
        let mut text = String::new();
        for stats in self.cache.stats() {
            let _ = writeln!(text, "{}", stats);
        }
        let _ = writeln!(
            text,
            "ids: {} live, counters M{} O{} P{}",
            self.ids.live_count(),
            self.ids.counters().mobile,
            self.ids.counters().item,
            self.ids.counters().session
        );
        let _ = writeln!(text, "workers: {} outstanding", self.workers.len());
        self.send(id, &text);
    }

    fn show_active(&mut self, id: ConnectionId) {
        let mut text = String::new();
        for mobile in self.scheduler.live() {
            let mobile = mobile.borrow();
            let label = mobile.id.map_or_else(|| "-".to_string(), |id| id.to_string());
            let room = mobile
                .room
                .as_ref()
                .map_or_else(|| "nowhere".to_string(), CacheKey::to_string);
            let _ = writeln!(
                text,
                "{:<8} {:<24} {:<16} {}/{}",
                label, mobile.name, room, mobile.vitals.hp, mobile.vitals.max_hp
            );
        }
        let _ = writeln!(text, "{} tracked.", self.scheduler.len());
        self.send(id, &text);
    }

    fn goto(&mut self, id: ConnectionId, args: &str) {
        let Some(name) = self.bound_player(id) else {
            return;
        };
        let Ok(target) = args.parse::<CacheKey>() else {
            self.send(id, "Usage: goto <area.number>\n");
            return;
        };
        let Some(player) = self.players.get(&name).cloned() else {
            return;
        };
        let current = player.borrow().room.clone();
        if let Err(e) = self.enter_room(&name, &target) {
            self.send(id, &format!("You cannot go there: {}\n", e));
            return;
        }
        if current != target {
            self.leave_room(&name, &current);
        }
        player.borrow_mut().room = target;
        self.look(id);
    }

    fn current_room(&self, id: ConnectionId) -> Option<CacheKey> {
        let name = self.bound_player(id)?;
        let player = self.players.get(&name)?;
        let key = player.borrow().room.clone();
        Some(key)
    }

    fn resave_room(&mut self, id: ConnectionId) {
        let Some(key) = self.current_room(id) else {
            return;
        };
        let reply = match self.cache.rooms.resave(&key) {
            Ok(true) => format!("Room {} saved.\n", key),
            Ok(false) => format!("Room {} is not loaded.\n", key),
            Err(e) => format!("Room {} could not be saved: {}\n", key, e),
        };
        self.send(id, &reply);
    }

    fn reload_room(&mut self, id: ConnectionId) {
        let Some(key) = self.current_room(id) else {
            return;
        };
        let reply = match self.cache.reload_room(&key) {
            Ok(true) => format!("Room {} reloaded.\n", key),
            Ok(false) => format!("Room {} is not loaded.\n", key),
            Err(e) => format!("Room {} could not be reloaded: {}\n", key, e),
        };
        self.send(id, &reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::Collaborators;
    use std::path::Path;
    use tempfile::tempdir;

    fn server(dir: &Path) -> Server {
        let config = ServerConfig {
            data_dir: dir.to_path_buf(),
            resolve_hostnames: false,
            negotiate_telnet: false,
            admins: vec!["Zed".to_string()],
            ..ServerConfig::default()
        };
        let collaborators = Collaborators::file_backed(dir, config.start_room.clone());
        Server::new(config, collaborators).unwrap()
    }

    #[test]
    fn test_observed_rooms_follow_players() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let mut server = server(dir);
        assert!(server.observed_rooms().is_empty());

        let player = crate::world::shared(Player::new("Ann", Role::Player, CacheKey::new("misc", 1)));
        server.players.insert("Ann".to_string(), player);
        assert!(server.observed_rooms().contains(&CacheKey::new("misc", 1)));
    }

    #[test]
    fn test_shutdown_request_is_recorded() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let mut server = server(dir);
        server.request(Transition::Shutdown);
        assert_eq!(server.pending, Some(Transition::Shutdown));
    }
}
