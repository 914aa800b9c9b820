//! Address-to-hostname cache fed by DNS workers.

use crate::error::Result;
use log::{debug, info};
use shared::{load_record_if_exists, store_record, DnsRecord};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct DnsCache {
    records: BTreeMap<String, DnsRecord>,
    ttl: Duration,
    path: PathBuf,
    /// Set whenever a resolution lands that has not been written yet
    dirty: bool,
}

impl DnsCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            ttl,
            path: path.into(),
            dirty: false,
        }
    }

    pub fn load(path: &Path, ttl: Duration) -> Result<Self> {
        let mut cache = DnsCache::new(path, ttl);
        if let Some(records) = load_record_if_exists::<Vec<DnsRecord>>(path)? {
            info!("Loaded {} cached hostnames", records.len());
            cache.records = records
                .into_iter()
                .map(|record| (record.address.clone(), record))
                .collect();
        }
        Ok(cache)
    }

    pub fn save(&mut self) -> Result<()> {
        let records: Vec<&DnsRecord> = self.records.values().collect();
        store_record(&self.path, &records)?;
        self.dirty = false;
        Ok(())
    }

    pub fn save_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Cached hostname for `address`, ignoring entries past their TTL.
    pub fn lookup(&self, address: &str, now: u64) -> Option<&str> {
        self.records
            .get(address)
            .filter(|record| !record.is_expired(now, self.ttl))
            .map(|record| record.hostname.as_str())
    }

    pub fn insert(&mut self, address: &str, hostname: &str, now: u64) {
        debug!("Caching {} as {}", address, hostname);
        self.records.insert(
            address.to_string(),
            DnsRecord {
                address: address.to_string(),
                hostname: hostname.to_string(),
                resolved_at: now,
            },
        );
        self.dirty = true;
    }

    /// Removes entries older than the TTL, returning how many went.
    pub fn prune(&mut self, now: u64) -> usize {
        let ttl = self.ttl;
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now, ttl));
        let removed = before - self.records.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
