//! Server configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! command-line flags in `main`. The resulting `ServerConfig` is passed
//! explicitly to everything that needs it.

use crate::error::Result;
use crate::world::Role;
use serde::Deserialize;
use shared::{CacheKey, DNS_FILE, DNS_PRUNE_INTERVAL_SECS, DNS_TTL_SECS, IDS_FILE, REBOOT_FILE, TICK_LENGTH_MS};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sizing for one object-cache pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Resident entries kept before least-recently-used eviction kicks in
    pub capacity: usize,
    /// How far past `capacity` the pool may grow when nothing is evictable.
    /// `None` lets it grow without bound.
    pub overflow_allowance: Option<usize>,
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            overflow_allowance: Some(capacity),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(200)
    }
}

/// Idle thresholds per role, in seconds. `None` means never time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdleTimeouts {
    pub guest_secs: u64,
    pub player_secs: u64,
    pub staff_secs: u64,
    pub admin_secs: Option<u64>,
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            guest_secs: 300,
            player_secs: 600,
            staff_secs: 1200,
            admin_secs: None,
        }
    }
}

impl IdleTimeouts {
    pub fn limit_for(&self, role: Role) -> Option<Duration> {
        match role {
            Role::Guest => Some(Duration::from_secs(self.guest_secs)),
            Role::Player => Some(Duration::from_secs(self.player_secs)),
            Role::Staff => Some(Duration::from_secs(self.staff_secs)),
            Role::Admin => self.admin_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub tick_length_ms: u64,
    /// Connection ceiling, kept below the process handle limit
    pub max_connections: usize,
    pub rooms: PoolConfig,
    pub mobiles: PoolConfig,
    pub items: PoolConfig,
    pub idle: IdleTimeouts,
    pub dns_ttl_secs: u64,
    pub dns_prune_interval_secs: u64,
    /// Launch DNS workers for addresses missing from the cache
    pub resolve_hostnames: bool,
    /// Offer telnet options to new connections
    pub negotiate_telnet: bool,
    /// Executable used for helper workers, defaults to the running binary
    pub worker_program: Option<PathBuf>,
    pub start_room: CacheKey,
    pub admins: Vec<String>,
    pub staff: Vec<String>,
    pub id_save_interval_ticks: u64,
    /// Lines per page when a connection is viewing paged text
    pub page_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            data_dir: PathBuf::from("data"),
            tick_length_ms: TICK_LENGTH_MS,
            max_connections: 1024 - 10,
            rooms: PoolConfig::new(600),
            mobiles: PoolConfig::new(200),
            items: PoolConfig::new(200),
            idle: IdleTimeouts::default(),
            dns_ttl_secs: DNS_TTL_SECS,
            dns_prune_interval_secs: DNS_PRUNE_INTERVAL_SECS,
            resolve_hostnames: true,
            negotiate_telnet: true,
            worker_program: None,
            start_room: CacheKey::new("misc", 1),
            admins: Vec::new(),
            staff: Vec::new(),
            id_save_interval_ticks: 600,
            page_length: 20,
        }
    }
}

impl ServerConfig {
    /// Reads a TOML configuration file; unspecified fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_length(&self) -> Duration {
        Duration::from_millis(self.tick_length_ms.max(1))
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn reboot_file(&self) -> PathBuf {
        self.data_dir.join(REBOOT_FILE)
    }

    pub fn ids_file(&self) -> PathBuf {
        self.data_dir.join(IDS_FILE)
    }

    pub fn dns_file(&self) -> PathBuf {
        self.data_dir.join(DNS_FILE)
    }

    pub fn players_dir(&self) -> PathBuf {
        self.data_dir.join("players")
    }

    pub fn role_for(&self, name: &str) -> Role {
        let matches = |list: &[String]| list.iter().any(|n| n.eq_ignore_ascii_case(name));
        if matches(&self.admins) {
            Role::Admin
        } else if matches(&self.staff) {
            Role::Staff
        } else {
            Role::Player
        }
    }

    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}
