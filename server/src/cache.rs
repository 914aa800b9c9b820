//! Bounded object cache over disk-backed world objects.
//!
//! Each pool keeps its resident entries in an insertion-ordered map where
//! the front is the least recently used entry and the back the most recent.
//! When a load would push the pool past its capacity, the oldest entry that
//! the store agrees to let go is saved and dropped. If nothing can be let
//! go the pool grows, but never past `capacity + overflow_allowance`.

use crate::config::{PoolConfig, ServerConfig};
use crate::error::{Result, ServerError};
use crate::world::{shared, Item, Mobile, Room, Shared};
use indexmap::IndexMap;
use log::{debug, warn};
use shared::CacheKey;
use std::fmt;

/// Durable storage behind one pool.
pub trait Store<T> {
    fn load(&self, key: &CacheKey) -> Result<T>;
    fn save(&self, key: &CacheKey, value: &T) -> Result<()>;

    /// Whether a resident value may be flushed and dropped right now.
    fn can_evict(&self, _value: &T) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub name: &'static str,
    pub resident: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.resident as f64 / self.capacity as f64
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} {:>5}/{:<5} ({:>5.1}% full)  hits {:>7}  misses {:>7}  hit rate {:>5.1}%",
            self.name,
            self.resident,
            self.capacity,
            self.utilization() * 100.0,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )
    }
}

/// Outcome of `Pool::fetch_loaded`.
pub struct Fetched<T> {
    pub value: Shared<T>,
    /// Read from the store by this call rather than already resident
    pub loaded: bool,
    /// Entry saved and dropped to make room for this one
    pub evicted: Option<(CacheKey, Shared<T>)>,
}

pub struct Pool<T> {
    name: &'static str,
    capacity: usize,
    overflow_allowance: Option<usize>,
    entries: IndexMap<CacheKey, Shared<T>>,
    store: Box<dyn Store<T>>,
    hits: u64,
    misses: u64,
}

impl<T> Pool<T> {
    pub fn new(name: &'static str, config: PoolConfig, store: Box<dyn Store<T>>) -> Self {
        Self {
            name,
            capacity: config.capacity,
            overflow_allowance: config.overflow_allowance,
            entries: IndexMap::new(),
            store,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the resident instance, loading it from the store on a miss.
    pub fn fetch(&mut self, key: &CacheKey) -> Result<Shared<T>> {
        self.fetch_loaded(key).map(|fetched| fetched.value)
    }

    /// Like `fetch`, also reporting whether the value was just loaded and
    /// which entry, if any, was evicted for it. Owners of the evicted entry
    /// tear down whatever hangs off it.
    pub fn fetch_loaded(&mut self, key: &CacheKey) -> Result<Fetched<T>> {
        if let Some(value) = self.get(key) {
            self.hits += 1;
            return Ok(Fetched {
                value,
                loaded: false,
                evicted: None,
            });
        }
        self.misses += 1;

        let value = self.store.load(key)?;
        let (value, evicted) = self.admit(key.clone(), value)?;
        debug!("{} pool loaded {}", self.name, key);
        Ok(Fetched {
            value,
            loaded: true,
            evicted,
        })
    }

    /// Inserts a freshly built value, replacing the contents of a resident
    /// entry in place if the key is already cached.
    pub fn insert(&mut self, key: CacheKey, value: T) -> Result<Shared<T>> {
        if let Some(existing) = self.get(&key) {
            *existing.borrow_mut() = value;
            return Ok(existing);
        }
        self.admit(key, value).map(|(value, _)| value)
    }

    /// Resident lookup that marks the entry most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<Shared<T>> {
        let index = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get_index(last).map(|(_, value)| value.clone())
    }

    /// Resident lookup that leaves the recency order untouched.
    pub fn peek(&self, key: &CacheKey) -> Option<Shared<T>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drops an entry without saving it.
    pub fn remove(&mut self, key: &CacheKey) -> Option<Shared<T>> {
        self.entries.shift_remove(key)
    }

    /// Forces a durability point for a resident entry.
    pub fn resave(&self, key: &CacheKey) -> Result<bool> {
        match self.entries.get(key) {
            Some(value) => {
                self.store.save(key, &value.borrow())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-reads a resident entry from the store and swaps the fresh state
    /// in behind the existing handle, so every holder sees it.
    pub fn invalidate_and_reload(&self, key: &CacheKey) -> Result<bool> {
        match self.entries.get(key) {
            Some(value) => {
                let fresh = self.store.load(key)?;
                *value.borrow_mut() = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Saves every resident entry, returning how many were written.
    pub fn flush_all(&self) -> Result<usize> {
        for (key, value) in &self.entries {
            self.store.save(key, &value.borrow())?;
        }
        Ok(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resident keys, least recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Shared<T>> {
        self.entries.values()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            resident: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn ceiling(&self) -> Option<usize> {
        self.overflow_allowance
            .map(|allowance| self.capacity.saturating_add(allowance))
    }

    fn admit(
        &mut self,
        key: CacheKey,
        value: T,
    ) -> Result<(Shared<T>, Option<(CacheKey, Shared<T>)>)> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            evicted = self.evict_one();
        }
        if self.entries.len() >= self.capacity && evicted.is_none() {
            if let Some(ceiling) = self.ceiling() {
                if self.entries.len() >= ceiling {
                    warn!(
                        "{} pool exhausted at {} entries, refusing {}",
                        self.name,
                        self.entries.len(),
                        key
                    );
                    return Err(ServerError::PoolExhausted {
                        pool: self.name,
                        resident: self.entries.len(),
                        ceiling,
                    });
                }
            }
            warn!(
                "{} pool over capacity ({} resident, capacity {}): nothing evictable",
                self.name,
                self.entries.len() + 1,
                self.capacity
            );
        }
        let value = shared(value);
        self.entries.insert(key, value.clone());
        Ok((value, evicted))
    }

    /// Saves and drops the least recently used evictable entry.
    fn evict_one(&mut self) -> Option<(CacheKey, Shared<T>)> {
        let mut chosen = None;
        for (index, (key, value)) in self.entries.iter().enumerate() {
            let Ok(inner) = value.try_borrow() else {
                continue;
            };
            if !self.store.can_evict(&inner) {
                continue;
            }
            match self.store.save(key, &inner) {
                Ok(()) => {
                    chosen = Some(index);
                    break;
                }
                Err(e) => warn!("{} pool could not save {} for eviction: {}", self.name, key, e),
            }
        }

        let evicted = chosen.and_then(|index| self.entries.shift_remove_index(index));
        if let Some((key, _)) = &evicted {
            debug!("{} pool evicted {}", self.name, key);
        }
        evicted
    }
}

/// The three independently sized pools of world objects.
pub struct ObjectCache {
    pub rooms: Pool<Room>,
    pub mobiles: Pool<Mobile>,
    pub items: Pool<Item>,
}

impl ObjectCache {
    pub fn new(
        config: &ServerConfig,
        rooms: Box<dyn Store<Room>>,
        mobiles: Box<dyn Store<Mobile>>,
        items: Box<dyn Store<Item>>,
    ) -> Self {
        Self {
            rooms: Pool::new("rooms", config.rooms, rooms),
            mobiles: Pool::new("mobiles", config.mobiles, mobiles),
            items: Pool::new("items", config.items, items),
        }
    }

    /// Re-reads a room from storage while keeping who and what is in it.
    pub fn reload_room(&mut self, key: &CacheKey) -> Result<bool> {
        let Some(room) = self.rooms.peek(key) else {
            return Ok(false);
        };
        let (occupants, mobiles, items) = {
            let mut room = room.borrow_mut();
            (
                std::mem::take(&mut room.occupants),
                std::mem::take(&mut room.mobiles),
                std::mem::take(&mut room.items),
            )
        };
        let reloaded = self.rooms.invalidate_and_reload(key);
        let mut room = room.borrow_mut();
        room.occupants = occupants;
        room.mobiles = mobiles;
        room.items = items;
        reloaded
    }

    pub fn stats(&self) -> [PoolStats; 3] {
        [self.rooms.stats(), self.mobiles.stats(), self.items.stats()]
    }

    /// Saves every resident object of every pool.
    pub fn flush_all(&self) -> Result<usize> {
        Ok(self.rooms.flush_all()? + self.mobiles.flush_all()? + self.items.flush_all()?)
    }
}
