//! Durable record formats and identifier types shared by the server, its
//! helper worker jobs and the integration tests.
//!
//! Everything in here is plain data plus the bincode file codec. Files are
//! always written to a temporary sibling first and then renamed into place so
//! a crash mid-write never leaves a truncated record behind.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Target length of one main-loop iteration.
pub const TICK_LENGTH_MS: u64 = 100;
/// Resolved hostnames older than this are pruned from the address cache.
pub const DNS_TTL_SECS: u64 = 60 * 60 * 24 * 15;
/// How often the address cache is swept for expired entries.
pub const DNS_PRUNE_INTERVAL_SECS: u64 = 60 * 60 * 24;
/// Attempts a DNS worker makes on transient resolver failures.
pub const DNS_RETRY_LIMIT: u32 = 5;

pub const REBOOT_FILE: &str = "reboot.bin";
pub const IDS_FILE: &str = "ids.bin";
pub const DNS_FILE: &str = "dns.bin";

/// Entity categories that receive process-wide unique identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Mobile,
    Item,
    Session,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Mobile, Category::Item, Category::Session];

    /// Single character that starts every identifier of this category
    pub fn prefix(self) -> char {
        match self {
            Category::Mobile => 'M',
            Category::Item => 'O',
            Category::Session => 'P',
        }
    }

    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'M' => Some(Category::Mobile),
            'O' => Some(Category::Item),
            'P' => Some(Category::Session),
            _ => None,
        }
    }

    /// Mutable categories get a fresh identifier when a registration
    /// collides; sessions never do.
    pub fn is_mutable(self) -> bool {
        !matches!(self, Category::Session)
    }
}

/// Typed identifier of the form `{prefix}{counter}`, e.g. `M42`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub category: Category,
    pub counter: u64,
}

impl EntityId {
    pub fn new(category: Category, counter: u64) -> Self {
        Self { category, counter }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.category.prefix(), self.counter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot parse '{}'", self.0)
    }
}

impl std::error::Error for ParseError {}

impl FromStr for EntityId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let category = chars
            .next()
            .and_then(Category::from_prefix)
            .ok_or_else(|| ParseError(s.to_string()))?;
        let counter = chars
            .as_str()
            .parse()
            .map_err(|_| ParseError(s.to_string()))?;
        Ok(EntityId { category, counter })
    }
}

/// Highest identifier handed out so far in each category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    pub mobile: u64,
    pub item: u64,
    pub session: u64,
}

impl IdCounters {
    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Mobile => self.mobile,
            Category::Item => self.item,
            Category::Session => self.session,
        }
    }

    pub fn get_mut(&mut self, category: Category) -> &mut u64 {
        match category {
            Category::Mobile => &mut self.mobile,
            Category::Item => &mut self.item,
            Category::Session => &mut self.session,
        }
    }
}

/// Composite (area, number) reference to a disk-backed world object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub area: String,
    pub number: u32,
}

impl CacheKey {
    pub fn new(area: impl Into<String>, number: u32) -> Self {
        Self {
            area: area.into(),
            number,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.area, self.number)
    }
}

impl FromStr for CacheKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (area, number) = s.rsplit_once('.').ok_or_else(|| ParseError(s.to_string()))?;
        let valid_area = !area.is_empty()
            && area
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_area {
            return Err(ParseError(s.to_string()));
        }
        let number = number.parse().map_err(|_| ParseError(s.to_string()))?;
        Ok(CacheKey::new(area, number))
    }
}

/// Options negotiated with a client over telnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub terminal: Option<String>,
    pub width: u16,
    pub height: u16,
    /// Client reported its window size (NAWS)
    pub naws: bool,
    pub suppress_go_ahead: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            terminal: None,
            width: 80,
            height: 24,
            naws: false,
            suppress_go_ahead: false,
        }
    }
}

/// One entry of the address-resolution cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub address: String,
    pub hostname: String,
    /// Seconds since the unix epoch
    pub resolved_at: u64,
}

impl DnsRecord {
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.resolved_at) >= ttl.as_secs()
    }
}

/// A listening endpoint handed across a reboot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub port: u16,
    pub fd: i32,
}

/// A live session handed across a reboot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub connection: u64,
    /// Name of the bound player entity, reloaded from storage afterwards
    pub name: String,
    pub fd: i32,
    pub address: String,
    pub hostname: String,
    pub capabilities: Capabilities,
}

/// Global counters that survive a reboot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCounters {
    pub start_time: u64,
    pub last_dns_prune: u64,
    pub last_id_save: u64,
    pub ticks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Everything the replacement process image needs to reattach sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootRecord {
    pub listeners: Vec<ListenerRecord>,
    pub counters: ServerCounters,
    pub sessions: Vec<SessionRecord>,
}

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Reads a bincode record from `path`.
pub fn load_record<T: DeserializeOwned>(path: &Path) -> bincode::Result<T> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes)
}

/// Reads a bincode record, treating a missing file as `None`.
pub fn load_record_if_exists<T: DeserializeOwned>(path: &Path) -> bincode::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => bincode::deserialize(&bytes).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes a bincode record atomically, creating parent directories.
pub fn store_record<T: Serialize>(path: &Path, record: &T) -> bincode::Result<()> {
    let bytes = bincode::serialize(record)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
