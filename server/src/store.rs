//! File-backed persistence for world objects and players.
//!
//! Objects live at `<dir>/<area>/<number>.bin` and players at
//! `<data>/players/<Name>.bin`, all encoded with bincode.

use crate::cache::Store;
use crate::error::{Result, ServerError};
use crate::world::{Item, Mobile, Player, Room};
use serde::{de::DeserializeOwned, Serialize};
use shared::{load_record_if_exists, store_record, CacheKey};
use std::path::{Path, PathBuf};

type Fallback<T> = Box<dyn Fn(&CacheKey) -> Option<T>>;

pub struct FileStore<T> {
    dir: PathBuf,
    fallback: Option<Fallback<T>>,
    evictable: fn(&T) -> bool,
}

impl<T> FileStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback: None,
            evictable: |_| true,
        }
    }

    /// Supplies a value for keys that have nothing on disk.
    pub fn with_fallback(mut self, fallback: impl Fn(&CacheKey) -> Option<T> + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_eviction(mut self, evictable: fn(&T) -> bool) -> Self {
        self.evictable = evictable;
        self
    }

    pub fn path_for(&self, key: &CacheKey) -> Result<PathBuf> {
        let valid = !key.area.is_empty()
            && key
                .area
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ServerError::Persistence(format!("invalid area in {}", key)));
        }
        Ok(self.dir.join(&key.area).join(format!("{}.bin", key.number)))
    }
}

impl<T: Serialize + DeserializeOwned> Store<T> for FileStore<T> {
    fn load(&self, key: &CacheKey) -> Result<T> {
        if let Some(value) = load_record_if_exists(&self.path_for(key)?)? {
            return Ok(value);
        }
        self.fallback
            .as_ref()
            .and_then(|fallback| fallback(key))
            .ok_or_else(|| ServerError::not_found(key.to_string()))
    }

    fn save(&self, key: &CacheKey, value: &T) -> Result<()> {
        store_record(&self.path_for(key)?, value)?;
        Ok(())
    }

    fn can_evict(&self, value: &T) -> bool {
        (self.evictable)(value)
    }
}

/// Rooms can only leave memory once nobody is standing in them.
pub fn room_store(dir: impl Into<PathBuf>, start_room: CacheKey) -> FileStore<Room> {
    FileStore::new(dir)
        .with_fallback(move |key| (key == &start_room).then(|| Room::empty(key)))
        .with_eviction(|room| !room.is_observed())
}

pub trait PlayerStore {
    fn load(&self, name: &str) -> Result<Option<Player>>;
    fn save(&self, player: &Player) -> Result<()>;
}

pub struct FilePlayerStore {
    dir: PathBuf,
}

impl FilePlayerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(ServerError::Persistence(format!("invalid player name {:?}", name)));
        }
        Ok(self.dir.join(format!("{}.bin", canonical_name(name))))
    }
}

impl PlayerStore for FilePlayerStore {
    fn load(&self, name: &str) -> Result<Option<Player>> {
        Ok(load_record_if_exists(&self.path_for(name)?)?)
    }

    fn save(&self, player: &Player) -> Result<()> {
        store_record(&self.path_for(&player.name)?, player)?;
        Ok(())
    }
}

/// Player names are 3 to 16 ASCII letters.
pub fn is_valid_name(name: &str) -> bool {
    (3..=16).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphabetic())
}

/// `aNN` becomes `Ann`.
pub fn canonical_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Everything the runtime needs from durable storage.
pub struct Collaborators {
    pub rooms: Box<dyn Store<Room>>,
    pub mobiles: Box<dyn Store<Mobile>>,
    pub items: Box<dyn Store<Item>>,
    pub players: Box<dyn PlayerStore>,
}

impl Collaborators {
    pub fn file_backed(data_dir: &Path, start_room: CacheKey) -> Self {
        Self {
            rooms: Box::new(room_store(data_dir.join("rooms"), start_room)),
            mobiles: Box::new(FileStore::<Mobile>::new(data_dir.join("mobiles"))),
            items: Box::new(FileStore::<Item>::new(data_dir.join("items"))),
            players: Box::new(FilePlayerStore::new(data_dir.join("players"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Role;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    #[test]
    fn test_room_round_trip_and_fallback() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let start = CacheKey::new("misc", 1);
        let store = room_store(dir, start.clone());

        let void = store.load(&start).unwrap();
        assert_eq!(void.name, "The Void");
        assert!(matches!(
            store.load(&CacheKey::new("misc", 2)),
            Err(ServerError::NotFound { .. })
        ));

        let mut hall = Room::empty(&CacheKey::new("town", 7));
        hall.name = "Great Hall".to_string();
        assert_ok!(store.save(&hall.key.clone(), &hall));
        assert!(dir.join("town").join("7.bin").exists());
        assert_eq!(store.load(&CacheKey::new("town", 7)).unwrap().name, "Great Hall");
    }

    #[test]
    fn test_room_eviction_requires_no_observers() {
        let tmp = tempdir().unwrap();
        let store = room_store(tmp.path(), CacheKey::new("misc", 1));
        let mut room = Room::empty(&CacheKey::new("misc", 1));
        assert!(store.can_evict(&room));
        room.occupants.insert("Ann".to_string());
        assert!(!store.can_evict(&room));
    }

    #[test]
    fn test_invalid_area_is_refused() {
        let tmp = tempdir().unwrap();
        let store = FileStore::<Item>::new(tmp.path());
        let err = store.load(&CacheKey::new("../etc", 1)).unwrap_err();
        assert!(matches!(err, ServerError::Persistence(_)));
    }

    #[test]
    fn test_player_store() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let store = FilePlayerStore::new(dir);
        assert!(store.load("Ann").unwrap().is_none());

        let player = Player::new("Ann", Role::Player, CacheKey::new("misc", 1));
        assert_ok!(store.save(&player));
        let loaded = store.load("aNN").unwrap().unwrap();
        assert_eq!(loaded.name, "Ann");
        assert!(store.load("../../x").is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("Ann"));
        assert!(!is_valid_name("Al"));
        assert!(!is_valid_name("Ann2"));
        assert!(!is_valid_name("averyveryverylongname"));
        assert_eq!(canonical_name("bRIAR"), "Briar");
    }
}
