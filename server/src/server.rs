//! The main loop tying every subsystem into one fixed-rate tick.

use crate::cache::ObjectCache;
use crate::config::ServerConfig;
use crate::connection::{ConnState, ConnectionId};
use crate::connections::{ConnectionRegistry, CLOSE_GRACE_TICKS};
use crate::dns::DnsCache;
use crate::error::{Result, ServerError};
use crate::ids::IdRegistry;
use crate::reboot::RebootHandoff;
use crate::scheduler::{EntityScheduler, Regeneration, Simulation};
use crate::store::{Collaborators, PlayerStore};
use crate::workers::{WorkerKind, WorkerSupervisor};
use crate::world::{shared, Mobile, Player, Room, Shared};
use log::{debug, error, info, warn};
use shared::{unix_now, CacheKey, ServerCounters};
use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};

/// Lifecycle change requested by an operator during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Shutdown,
    Reboot,
}

/// How `run` ended.
pub enum Exit {
    Shutdown,
    /// State is saved and handles are released; the caller replaces the
    /// process image.
    Reboot(RebootHandoff),
}

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) ids: IdRegistry,
    pub(crate) cache: ObjectCache,
    pub(crate) scheduler: EntityScheduler<Mobile>,
    pub(crate) simulation: Box<dyn Simulation<Mobile>>,
    pub(crate) workers: WorkerSupervisor,
    pub(crate) dns: DnsCache,
    /// Logged-in players by canonical name
    pub(crate) players: HashMap<String, Shared<Player>>,
    pub(crate) player_store: Box<dyn PlayerStore>,
    pub(crate) counters: ServerCounters,
    pub(crate) pending: Option<Transition>,
}

impl Server {
    /// Builds a server with no listening endpoint.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Result<Self> {
        let ids = IdRegistry::load(&config.ids_file())?;
        let dns = DnsCache::load(&config.dns_file(), config.dns_ttl())?;
        let cache = ObjectCache::new(
            &config,
            collaborators.rooms,
            collaborators.mobiles,
            collaborators.items,
        );
        let now = unix_now();
        Ok(Self {
            connections: ConnectionRegistry::new(config.max_connections, config.negotiate_telnet),
            ids,
            cache,
            scheduler: EntityScheduler::new(),
            simulation: Box::new(Regeneration),
            workers: WorkerSupervisor::new(),
            dns,
            players: HashMap::new(),
            player_store: collaborators.players,
            counters: ServerCounters {
                start_time: now,
                last_dns_prune: now,
                last_id_save: now,
                ..ServerCounters::default()
            },
            pending: None,
            config,
        })
    }

    /// Builds a server listening on the configured address.
    pub fn bind(config: ServerConfig, collaborators: Collaborators) -> Result<Self> {
        let address = config.address();
        let mut server = Server::new(config, collaborators)?;
        server.connections.add_listener(&address)?;
        Ok(server)
    }

    /// Replaces the default regeneration simulation.
    pub fn with_simulation(mut self, simulation: Box<dyn Simulation<Mobile>>) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &EntityScheduler<Mobile> {
        &self.scheduler
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    pub fn port(&self) -> Option<u16> {
        self.connections.listener_ports().first().copied()
    }

    pub fn players_online(&self) -> Vec<String> {
        let mut names: Vec<String> = self.players.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn player(&self, name: &str) -> Option<Shared<Player>> {
        self.players.get(name).cloned()
    }

    pub fn request(&mut self, transition: Transition) {
        self.pending = Some(transition);
    }

    /// Runs ticks at the configured rate until shutdown or reboot.
    pub async fn run(&mut self) -> Result<Exit> {
        let mut ticker = interval(self.config.tick_length());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!("Server running with {}ms ticks", self.config.tick_length_ms);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                    match self.pending.take() {
                        Some(Transition::Shutdown) => {
                            self.shutdown()?;
                            self.linger().await;
                            return Ok(Exit::Shutdown);
                        }
                        Some(Transition::Reboot) => {
                            let handoff = self.prepare_reboot()?;
                            return Ok(Exit::Reboot(handoff));
                        }
                        None => {}
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down");
                    self.shutdown()?;
                    self.linger().await;
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }

    /// Keeps ticking the sweep so closing sessions can drain their last
    /// output, then drops whatever is left.
    async fn linger(&mut self) {
        let mut ticker = interval(self.config.tick_length());
        for _ in 0..CLOSE_GRACE_TICKS {
            if self.connections.closing_len() == 0 {
                break;
            }
            ticker.tick().await;
            self.connections.sweep();
        }
        self.connections.close_all();
    }

    /// One iteration: accept, read, time out, dispatch, simulate, reap,
    /// flush, sweep.
    pub fn tick(&mut self) {
        self.counters.ticks += 1;
        let now = Instant::now();
        let wall = unix_now();

        for id in self.connections.accept_pending() {
            self.greet(id, wall);
        }

        self.connections.read_all();
        let idle = self.config.idle;
        for id in self.connections.check_idle(now, &idle) {
            debug!("Connection {} timed out", id);
        }

        // One command per connection per tick, in random order
        for id in self.connections.snapshot() {
            self.dispatch_next(id);
        }

        let observed = self.observed_rooms();
        let report = self.scheduler.tick(self.simulation.as_mut(), &observed);
        if report.untracked > 0 || report.dropped > 0 {
            debug!(
                "Active list: {} simulated, {} untracked, {} dropped",
                report.simulated, report.untracked, report.dropped
            );
        }

        let reaped = self
            .workers
            .reap_ready(&mut self.connections, &mut self.dns, wall);
        for id in reaped.released {
            self.prompt_login(id);
        }
        if !reaped.resolved.is_empty() {
            if let Err(e) = self.dns.save() {
                warn!("Could not save hostname cache: {}", e);
            }
        }

        self.connections.flush_all();
        for closed in self.connections.sweep() {
            if let Some(name) = closed.entity {
                self.logout(&name);
            }
        }

        self.housekeeping(wall);
    }

    fn greet(&mut self, id: ConnectionId, wall: u64) {
        let Some(address) = self.connections.get(id).map(|c| c.address.clone()) else {
            return;
        };

        if let Some(hostname) = self.dns.lookup(&address, wall).map(str::to_string) {
            self.release_lookup(id, hostname);
            return;
        }
        if !self.config.resolve_hostnames {
            self.release_lookup(id, address);
            return;
        }

        let running = self
            .workers
            .records()
            .any(|w| w.kind == WorkerKind::DnsLookup && w.correlation == address);
        if running {
            return;
        }
        let launched = self
            .worker_command(&["resolve", &address])
            .and_then(|command| self.workers.launch(WorkerKind::DnsLookup, &address, command));
        if let Err(e) = launched {
            warn!("Falling back to literal address for {}: {}", address, e);
            self.release_lookup(id, address);
        }
    }

    fn release_lookup(&mut self, id: ConnectionId, hostname: String) {
        if let Some(connection) = self.connections.get_mut(id) {
            connection.hostname = hostname;
            connection.state = ConnState::Authenticating;
        }
        self.prompt_login(id);
    }

    pub(crate) fn prompt_login(&mut self, id: ConnectionId) {
        self.send(id, "By what name do you wish to be known? ");
    }

    pub(crate) fn send(&mut self, id: ConnectionId, text: &str) {
        if let Some(connection) = self.connections.get_mut(id) {
            connection.write(text);
        }
    }

    pub(crate) fn worker_command(&self, args: &[&str]) -> Result<Command> {
        let mut command = Command::new(self.config.worker_program()?);
        command.arg("worker").args(args);
        Ok(command)
    }

    fn dispatch_next(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let state = connection.state;
        if matches!(state, ConnState::LookingUpHost | ConnState::Disconnecting) {
            return;
        }
        let Some(line) = connection.pop_command() else {
            return;
        };

        match state {
            ConnState::ViewingFile => connection.pager_input(&line),
            ConnState::Authenticating => self.login(id, &line),
            ConnState::Playing => self.interpret(id, &line),
            ConnState::LookingUpHost | ConnState::Disconnecting => {}
        }
    }

    /// Rooms that currently have a player standing in them.
    pub(crate) fn observed_rooms(&self) -> HashSet<CacheKey> {
        self.players
            .values()
            .map(|player| player.borrow().room.clone())
            .collect()
    }

    /// Binds a loaded player to a connection and places it in the world.
    pub(crate) fn attach(&mut self, id: ConnectionId, player: Player) -> Result<Shared<Player>> {
        let name = player.name.clone();
        let role = self.config.role_for(&name);
        let player = shared(player);
        {
            let mut inner = player.borrow_mut();
            inner.role = role;
            inner.connection = Some(id);
        }
        self.ids.register(&player)?;

        let connection = self
            .connections
            .get_mut(id)
            .ok_or_else(|| ServerError::not_found(format!("connection {}", id)))?;
        connection.entity = Some(name.clone());
        connection.role = role;
        connection.state = ConnState::Playing;
        self.players.insert(name.clone(), player.clone());

        let room = player.borrow().room.clone();
        if let Err(e) = self.enter_room(&name, &room) {
            warn!("{} cannot enter {}: {}", name, room, e);
            let start = self.config.start_room.clone();
            player.borrow_mut().room = start.clone();
            self.enter_room(&name, &start)?;
        }
        Ok(player)
    }

    /// Puts a player into a room, loading and populating it if needed.
    pub(crate) fn enter_room(&mut self, name: &str, key: &CacheKey) -> Result<()> {
        let fetched = self.cache.rooms.fetch_loaded(key)?;
        if let Some((evicted, old)) = fetched.evicted {
            self.teardown_room(&evicted, &old.borrow());
        }
        if fetched.loaded {
            fetched.value.borrow_mut().key = key.clone();
            self.populate(key);
        }
        let mut room = fetched.value.borrow_mut();
        room.occupants.insert(name.to_string());
        for mobile in &room.mobiles {
            self.scheduler.track(mobile);
        }
        Ok(())
    }

    pub(crate) fn leave_room(&mut self, name: &str, key: &CacheKey) {
        if let Some(room) = self.cache.rooms.peek(key) {
            room.borrow_mut().occupants.remove(name);
        }
    }

    /// Releases the identifiers of an evicted room's instances. The instances
    /// themselves die with the room.
    fn teardown_room(&mut self, key: &CacheKey, room: &Room) {
        let mut released = 0;
        for mobile in &room.mobiles {
            self.scheduler.untrack(mobile);
            let id = mobile.borrow().id;
            if let Some(id) = id {
                released += usize::from(self.ids.unregister(id, mobile));
            }
        }
        for item in &room.items {
            let id = item.borrow().id;
            if let Some(id) = id {
                released += usize::from(self.ids.unregister(id, item));
            }
        }
        debug!("Room {} evicted, released {} ids", key, released);
    }

    /// Spawns live instances for a freshly loaded room.
    fn populate(&mut self, key: &CacheKey) {
        let Some(room) = self.cache.rooms.peek(key) else {
            return;
        };
        let (mobile_spawns, item_spawns) = {
            let room = room.borrow();
            (room.mobile_spawns.clone(), room.item_spawns.clone())
        };

        for prototype in mobile_spawns {
            let spawned = self.cache.mobiles.fetch(&prototype).and_then(|proto| {
                let mut mobile = proto.borrow().instance();
                mobile.prototype = prototype.clone();
                mobile.room = Some(key.clone());
                let mobile = shared(mobile);
                self.ids.register(&mobile)?;
                Ok(mobile)
            });
            match spawned {
                Ok(mobile) => room.borrow_mut().mobiles.push(mobile),
                Err(e) => warn!("Room {} could not spawn mobile {}: {}", key, prototype, e),
            }
        }

        for prototype in item_spawns {
            let spawned = self.cache.items.fetch(&prototype).and_then(|proto| {
                let mut item = proto.borrow().instance();
                item.prototype = prototype.clone();
                let item = shared(item);
                self.ids.register(&item)?;
                Ok(item)
            });
            match spawned {
                Ok(item) => room.borrow_mut().items.push(item),
                Err(e) => warn!("Room {} could not spawn item {}: {}", key, prototype, e),
            }
        }
    }

    /// Saves and releases a player whose session has ended.
    pub(crate) fn logout(&mut self, name: &str) {
        let Some(player) = self.players.remove(name) else {
            return;
        };
        let (id, room) = {
            let mut inner = player.borrow_mut();
            inner.connection = None;
            (inner.id, inner.room.clone())
        };
        if let Err(e) = self.player_store.save(&player.borrow()) {
            error!("Could not save {}: {}", name, e);
        }
        self.leave_room(name, &room);
        if let Some(id) = id {
            self.ids.unregister(id, &player);
        }
        info!("{} left the game", name);
    }

    pub(crate) fn save_players(&self) -> usize {
        let mut saved = 0;
        for (name, player) in &self.players {
            match self.player_store.save(&player.borrow()) {
                Ok(()) => saved += 1,
                Err(e) => error!("Could not save {}: {}", name, e),
            }
        }
        saved
    }

    fn housekeeping(&mut self, wall: u64) {
        let interval = self.config.id_save_interval_ticks.max(1);
        if self.counters.ticks % interval == 0 {
            match self.ids.save_if_dirty() {
                Ok(true) => self.counters.last_id_save = wall,
                Ok(false) => {}
                Err(e) => warn!("Could not save id counters: {}", e),
            }
        }

        if wall.saturating_sub(self.counters.last_dns_prune) >= self.config.dns_prune_interval_secs {
            let removed = self.dns.prune(wall);
            self.counters.last_dns_prune = wall;
            info!("Pruned {} expired hostnames", removed);
            if let Err(e) = self.dns.save_if_dirty() {
                warn!("Could not save hostname cache: {}", e);
            }
        }
    }

    /// Saves everything and closes every session.
    pub fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down with {} connections", self.connections.len());
        for connection in self.connections.iter_mut() {
            connection.write("\nThe server is shutting down. Goodbye.\n");
            connection.mark_disconnecting();
        }
        self.save_players();
        for closed in self.connections.sweep() {
            if let Some(name) = closed.entity {
                self.logout(&name);
            }
        }
        let flushed = self.cache.flush_all()?;
        self.ids.save_if_dirty()?;
        self.dns.save()?;
        info!("Saved {} cached objects", flushed);
        Ok(())
    }
}
